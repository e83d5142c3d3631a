//! Synchronization primitives for simulated threads
//!
//! Mutexes, reader-writer locks, condition variables, barriers and
//! spinlocks, all addressed by id. Callers are thread ids. Blocking follows
//! the IPC pattern: [`Step::Block`] asks the kernel to register a wait and
//! park it here; completions are pushed to [`Effects::wake`].

pub mod barrier;
pub mod condvar;
pub mod mutex;
pub mod rwlock;
pub mod spinlock;

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec::Vec;

use akern_api::{Error, Result, Tid};

pub use self::barrier::{BarrierStats, SimBarrier};
pub use self::condvar::{CondVarStats, CondWaiter, SimCondVar};
pub use self::mutex::{MutexKind, MutexStats, MutexWaiter, SimMutex};
pub use self::rwlock::{RwLockStats, RwMode, SimRwLock};
pub use self::spinlock::{SimSpinlock, SpinlockStats};

use crate::ipc::Step;
use crate::wait::{WaitChannel, WaitResult, WaitToken, Wakeup};

/// Side effects of a sync operation for the kernel to apply
#[derive(Debug, Default)]
pub struct Effects {
    /// Waits to complete
    pub wake: Vec<Wakeup>,
    /// Waits that moved to another queue and stay pending
    pub requeued: Vec<(WaitToken, WaitChannel)>,
}

/// Object counts for reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCounts {
    pub mutexes: usize,
    pub rwlocks: usize,
    pub condvars: usize,
    pub barriers: usize,
    pub spinlocks: usize,
}

/// Every synchronization object in the system
#[derive(Default)]
pub struct SyncManager {
    mutexes: BTreeMap<u32, SimMutex>,
    rwlocks: BTreeMap<u32, SimRwLock>,
    condvars: BTreeMap<u32, SimCondVar>,
    barriers: BTreeMap<u32, SimBarrier>,
    spinlocks: BTreeMap<u32, Arc<SimSpinlock>>,
    next_id: u32,
}

fn missing(kind: &str, id: u32) -> Error {
    Error::NotFound(format!("{} {}", kind, id))
}

fn busy(kind: &str, id: u32) -> Error {
    Error::Busy(format!("{} {} is in use", kind, id))
}

impl SyncManager {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    fn alloc_id(&mut self) -> Result<u32> {
        let id = self.next_id.max(1);
        self.next_id = id
            .checked_add(1)
            .ok_or_else(|| Error::ResourceExhausted("sync identifiers".into()))?;
        Ok(id)
    }

    pub fn counts(&self) -> SyncCounts {
        SyncCounts {
            mutexes: self.mutexes.len(),
            rwlocks: self.rwlocks.len(),
            condvars: self.condvars.len(),
            barriers: self.barriers.len(),
            spinlocks: self.spinlocks.len(),
        }
    }

    // ---- mutex ----

    pub fn create_mutex(&mut self, kind: MutexKind, name: Option<&str>) -> Result<u32> {
        let id = self.alloc_id()?;
        let mut m = SimMutex::new(id, kind);
        m.name = name.map(ToString::to_string);
        self.mutexes.insert(id, m);
        Ok(id)
    }

    pub fn mutex(&self, id: u32) -> Result<&SimMutex> {
        self.mutexes.get(&id).ok_or_else(|| missing("mutex", id))
    }

    pub fn mutex_mut(&mut self, id: u32) -> Result<&mut SimMutex> {
        self.mutexes.get_mut(&id).ok_or_else(|| missing("mutex", id))
    }

    /// Destroys an unheld mutex without waiters
    pub fn destroy_mutex(&mut self, id: u32) -> Result<()> {
        let m = self.mutex(id)?;
        if m.is_locked() || m.has_waiters() {
            return Err(busy("mutex", id));
        }
        self.mutexes.remove(&id);
        Ok(())
    }

    pub fn mutex_lock(&mut self, id: u32, tid: Tid) -> Result<Step<()>> {
        self.mutex_mut(id)?.lock(tid)
    }

    pub fn mutex_try_lock(&mut self, id: u32, tid: Tid) -> Result<()> {
        self.mutex_mut(id)?.try_lock(tid)
    }

    pub fn mutex_unlock(&mut self, id: u32, tid: Tid, fx: &mut Effects) -> Result<()> {
        self.mutex_mut(id)?.unlock(tid, &mut fx.wake)
    }

    // ---- rwlock ----

    pub fn create_rwlock(&mut self, prefer_writers: bool) -> Result<u32> {
        let id = self.alloc_id()?;
        self.rwlocks.insert(id, SimRwLock::new(id, prefer_writers));
        Ok(id)
    }

    pub fn rwlock(&self, id: u32) -> Result<&SimRwLock> {
        self.rwlocks.get(&id).ok_or_else(|| missing("rwlock", id))
    }

    pub fn rwlock_mut(&mut self, id: u32) -> Result<&mut SimRwLock> {
        self.rwlocks.get_mut(&id).ok_or_else(|| missing("rwlock", id))
    }

    pub fn destroy_rwlock(&mut self, id: u32) -> Result<()> {
        let rw = self.rwlock(id)?;
        if rw.is_held() || rw.has_waiters() {
            return Err(busy("rwlock", id));
        }
        self.rwlocks.remove(&id);
        Ok(())
    }

    // ---- condvar ----

    pub fn create_condvar(&mut self) -> Result<u32> {
        let id = self.alloc_id()?;
        self.condvars.insert(id, SimCondVar::new(id));
        Ok(id)
    }

    pub fn condvar(&self, id: u32) -> Result<&SimCondVar> {
        self.condvars.get(&id).ok_or_else(|| missing("condition variable", id))
    }

    pub fn destroy_condvar(&mut self, id: u32) -> Result<()> {
        if self.condvar(id)?.has_waiters() {
            return Err(busy("condition variable", id));
        }
        self.condvars.remove(&id);
        Ok(())
    }

    /// Checks that `tid` may wait on `cv` with `mutex` held
    pub fn cond_check(&self, cv: u32, mutex: u32, tid: Tid) -> Result<()> {
        self.condvar(cv)?;
        if self.mutex(mutex)?.owner() != Some(tid) {
            return Err(Error::PermissionDenied(format!(
                "tid {} must hold mutex {} to wait on condition variable {}",
                tid, mutex, cv
            )));
        }
        Ok(())
    }

    /// Parks a registered waiter and releases its mutex
    pub fn cond_park(&mut self, cv: u32, mutex: u32, token: WaitToken, tid: Tid, fx: &mut Effects) -> Result<()> {
        self.cond_check(cv, mutex, tid)?;
        let depth = self.mutex_mut(mutex)?.release_all(tid, &mut fx.wake)?;
        self.condvars
            .get_mut(&cv)
            .ok_or_else(|| missing("condition variable", cv))?
            .park(CondWaiter {
                token,
                tid,
                mutex,
                depth,
            });
        Ok(())
    }

    /// Hands a condition waiter back to its mutex with `result`
    fn reacquire(&mut self, w: CondWaiter, result: WaitResult, fx: &mut Effects) {
        let waiter = MutexWaiter {
            token: w.token,
            tid: w.tid,
            depth: w.depth,
            result,
        };
        match self.mutexes.get_mut(&w.mutex) {
            Some(m) => {
                if m.acquire_or_park(waiter, &mut fx.wake) {
                    fx.requeued.push((w.token, WaitChannel::Mutex(w.mutex)));
                }
            }
            None => fx
                .wake
                .push((w.token, Err(Error::NotFound(format!("mutex {}", w.mutex))))),
        }
    }

    /// Wakes the oldest waiter; false when nobody waited
    pub fn cond_signal(&mut self, cv: u32, fx: &mut Effects) -> Result<bool> {
        let c = self.condvars.get_mut(&cv).ok_or_else(|| missing("condition variable", cv))?;
        c.signals += 1;
        let Some(w) = c.pop() else {
            return Ok(false);
        };
        self.reacquire(w, WaitResult::Signaled, fx);
        Ok(true)
    }

    /// Wakes every waiter, returning how many there were
    pub fn cond_broadcast(&mut self, cv: u32, fx: &mut Effects) -> Result<usize> {
        let c = self.condvars.get_mut(&cv).ok_or_else(|| missing("condition variable", cv))?;
        c.broadcasts += 1;
        let mut woken = Vec::new();
        while let Some(w) = c.pop() {
            woken.push(w);
        }
        let n = woken.len();
        for w in woken {
            self.reacquire(w, WaitResult::Signaled, fx);
        }
        Ok(n)
    }

    /// Expires a timed condition wait; false if it was no longer queued
    pub fn cond_timeout(&mut self, cv: u32, token: WaitToken, fx: &mut Effects) -> bool {
        let Some(c) = self.condvars.get_mut(&cv) else {
            return false;
        };
        let Some(w) = c.remove(token) else {
            return false;
        };
        c.timeouts += 1;
        self.reacquire(w, WaitResult::TimedOut, fx);
        true
    }

    // ---- barrier ----

    pub fn create_barrier(&mut self, threshold: u32) -> Result<u32> {
        let id = self.alloc_id()?;
        self.barriers.insert(id, SimBarrier::new(id, threshold)?);
        Ok(id)
    }

    pub fn barrier(&self, id: u32) -> Result<&SimBarrier> {
        self.barriers.get(&id).ok_or_else(|| missing("barrier", id))
    }

    pub fn barrier_mut(&mut self, id: u32) -> Result<&mut SimBarrier> {
        self.barriers.get_mut(&id).ok_or_else(|| missing("barrier", id))
    }

    pub fn destroy_barrier(&mut self, id: u32) -> Result<()> {
        if self.barrier(id)?.has_waiters() {
            return Err(busy("barrier", id));
        }
        self.barriers.remove(&id);
        Ok(())
    }

    // ---- spinlock ----

    pub fn create_spinlock(&mut self) -> Result<u32> {
        let id = self.alloc_id()?;
        self.spinlocks.insert(id, Arc::new(SimSpinlock::new(id)));
        Ok(id)
    }

    /// Shared handle, for spinning outside the table lock
    pub fn spinlock(&self, id: u32) -> Result<Arc<SimSpinlock>> {
        self.spinlocks
            .get(&id)
            .cloned()
            .ok_or_else(|| missing("spinlock", id))
    }

    pub fn destroy_spinlock(&mut self, id: u32) -> Result<()> {
        if self.spinlock(id)?.is_locked() {
            return Err(busy("spinlock", id));
        }
        self.spinlocks.remove(&id);
        Ok(())
    }

    // ---- waiters ----

    /// Unlinks a cancelled waiter
    pub fn cancel(&mut self, token: WaitToken, channel: WaitChannel, fx: &mut Effects) -> bool {
        match channel {
            WaitChannel::Mutex(id) => self.mutexes.get_mut(&id).is_some_and(|m| m.cancel(token)),
            WaitChannel::RwLock(id) => self
                .rwlocks
                .get_mut(&id)
                .is_some_and(|rw| rw.cancel(token, &mut fx.wake)),
            WaitChannel::CondVar(id) => self
                .condvars
                .get_mut(&id)
                .is_some_and(|c| c.remove(token).is_some()),
            WaitChannel::Barrier(id) => self.barriers.get_mut(&id).is_some_and(|b| b.cancel(token)),
            _ => false,
        }
    }

    /// Releases what exited threads held: robust mutexes and rwlock holds
    pub fn threads_exited(&mut self, tids: &[Tid], fx: &mut Effects) -> Vec<u32> {
        let mut recovered = Vec::new();
        for tid in tids {
            for m in self.mutexes.values_mut() {
                if m.owner_exited(*tid, &mut fx.wake) {
                    recovered.push(m.id);
                }
            }
            for rw in self.rwlocks.values_mut() {
                rw.holder_exited(*tid, &mut fx.wake);
            }
        }
        recovered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condvar_requeues_on_held_mutex() {
        let mut sync = SyncManager::new();
        let mut fx = Effects::default();
        let m = sync.create_mutex(MutexKind::Recursive, None).unwrap();
        let cv = sync.create_condvar().unwrap();
        sync.mutex_lock(m, 1).unwrap();
        sync.mutex_lock(m, 1).unwrap();
        assert!(sync.cond_check(cv, m, 2).is_err());
        sync.cond_park(cv, m, WaitToken(1), 1, &mut fx).unwrap();
        assert!(!sync.mutex(m).unwrap().is_locked());

        sync.mutex_lock(m, 2).unwrap();
        assert!(sync.cond_signal(cv, &mut fx).unwrap());
        assert_eq!(fx.requeued, alloc::vec![(WaitToken(1), WaitChannel::Mutex(m))]);
        assert!(fx.wake.is_empty());

        sync.mutex_unlock(m, 2, &mut fx).unwrap();
        assert_eq!(fx.wake, alloc::vec![(WaitToken(1), Ok(WaitResult::Signaled))]);
        assert_eq!(sync.mutex(m).unwrap().depth(), 2);
    }

    #[test]
    fn test_timeout_reacquires_free_mutex() {
        let mut sync = SyncManager::new();
        let mut fx = Effects::default();
        let m = sync.create_mutex(MutexKind::Normal, None).unwrap();
        let cv = sync.create_condvar().unwrap();
        sync.mutex_lock(m, 1).unwrap();
        sync.cond_park(cv, m, WaitToken(5), 1, &mut fx).unwrap();
        assert!(sync.destroy_condvar(cv).is_err());
        assert!(sync.cond_timeout(cv, WaitToken(5), &mut fx));
        assert!(!sync.cond_timeout(cv, WaitToken(5), &mut fx));
        assert_eq!(fx.wake, alloc::vec![(WaitToken(5), Ok(WaitResult::TimedOut))]);
        assert_eq!(sync.mutex(m).unwrap().owner(), Some(1));
        assert_eq!(sync.condvar(cv).unwrap().stats().timeouts, 1);
    }

    #[test]
    fn test_destroy_busy_objects() {
        let mut sync = SyncManager::new();
        let m = sync.create_mutex(MutexKind::Normal, Some("m")).unwrap();
        sync.mutex_lock(m, 1).unwrap();
        assert!(matches!(sync.destroy_mutex(m), Err(Error::Busy(_))));
        let s = sync.create_spinlock().unwrap();
        sync.spinlock(s).unwrap().lock(0, 0, false).unwrap();
        assert!(sync.destroy_spinlock(s).is_err());
        assert!(sync.destroy_mutex(999).is_err());
    }
}
