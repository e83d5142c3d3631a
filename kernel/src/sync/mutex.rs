//! Simulated mutexes
//!
//! Ownership is by thread id. Unlock hands the lock directly to the oldest
//! waiter, so a woken waiter already owns it when it resumes.

use alloc::collections::VecDeque;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use akern_api::{Error, Result, Tid};

use crate::ipc::Step;
use crate::wait::{WaitResult, WaitToken, Wakeup};

/// Mutex flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MutexKind {
    #[default]
    Normal,
    Recursive,
    ErrorCheck,
    /// Spins briefly before sleeping on real hardware; behaves as Normal here
    Adaptive,
    Robust,
}

impl MutexKind {
    /// Whether only the owner may unlock
    pub fn checks_owner(self) -> bool {
        matches!(self, MutexKind::Recursive | MutexKind::ErrorCheck | MutexKind::Robust)
    }
}

/// A queued locker
///
/// Condition variable waiters moved here carry the recursion depth to
/// restore and the result to report once they own the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutexWaiter {
    pub token: WaitToken,
    pub tid: Tid,
    pub depth: u32,
    pub result: WaitResult,
}

impl MutexWaiter {
    pub fn locker(token: WaitToken, tid: Tid) -> Self {
        Self {
            token,
            tid,
            depth: 1,
            result: WaitResult::Acquired,
        }
    }
}

/// Snapshot of a mutex
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutexStats {
    pub id: u32,
    pub kind: MutexKind,
    pub owner: Option<Tid>,
    pub depth: u32,
    pub waiting: usize,
    pub lock_count: u64,
    pub contention_count: u64,
    pub owner_died: bool,
}

#[derive(Debug)]
pub struct SimMutex {
    pub id: u32,
    pub name: Option<String>,
    pub kind: MutexKind,
    owner: Option<Tid>,
    depth: u32,
    waiters: VecDeque<MutexWaiter>,
    lock_count: u64,
    contention_count: u64,
    owner_died: bool,
}

impl SimMutex {
    pub fn new(id: u32, kind: MutexKind) -> Self {
        Self {
            id,
            name: None,
            kind,
            owner: None,
            depth: 0,
            waiters: VecDeque::new(),
            lock_count: 0,
            contention_count: 0,
            owner_died: false,
        }
    }

    pub fn owner(&self) -> Option<Tid> {
        self.owner
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn is_locked(&self) -> bool {
        self.owner.is_some()
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }

    fn take(&mut self, tid: Tid, depth: u32) {
        self.owner = Some(tid);
        self.depth = depth;
        self.lock_count += 1;
    }

    /// Handles a lock attempt by the current owner
    fn relock(&mut self, tid: Tid) -> Result<()> {
        if self.kind == MutexKind::Recursive {
            self.depth = self
                .depth
                .checked_add(1)
                .ok_or_else(|| Error::ResourceExhausted(format!("mutex {} recursion depth", self.id)))?;
            self.lock_count += 1;
            return Ok(());
        }
        Err(Error::InvalidArgument(format!(
            "deadlock: tid {} already holds mutex {}",
            tid, self.id
        )))
    }

    pub fn lock(&mut self, tid: Tid) -> Result<Step<()>> {
        match self.owner {
            None => {
                self.take(tid, 1);
                Ok(Step::Done(()))
            }
            Some(owner) if owner == tid => self.relock(tid).map(Step::Done),
            Some(_) => {
                self.contention_count += 1;
                Ok(Step::Block)
            }
        }
    }

    pub fn try_lock(&mut self, tid: Tid) -> Result<()> {
        match self.lock(tid)? {
            Step::Done(()) => Ok(()),
            Step::Block => Err(Error::WouldBlock),
        }
    }

    pub fn park(&mut self, waiter: MutexWaiter) {
        self.waiters.push_back(waiter);
    }

    /// Takes the lock for `waiter` if it is free, otherwise queues it
    ///
    /// Returns true when the waiter was queued.
    pub fn acquire_or_park(&mut self, waiter: MutexWaiter, wake: &mut Vec<Wakeup>) -> bool {
        if self.owner.is_none() && self.waiters.is_empty() {
            self.take(waiter.tid, waiter.depth);
            wake.push((waiter.token, Ok(waiter.result)));
            false
        } else {
            self.contention_count += 1;
            self.waiters.push_back(waiter);
            true
        }
    }

    fn hand_off(&mut self, wake: &mut Vec<Wakeup>) {
        match self.waiters.pop_front() {
            Some(next) => {
                self.take(next.tid, next.depth);
                wake.push((next.token, Ok(next.result)));
            }
            None => {
                self.owner = None;
                self.depth = 0;
            }
        }
    }

    /// Releases one level of the lock
    pub fn unlock(&mut self, tid: Tid, wake: &mut Vec<Wakeup>) -> Result<()> {
        let owner = self
            .owner
            .ok_or_else(|| Error::InvalidArgument(format!("mutex {} is not locked", self.id)))?;
        if owner != tid {
            if self.kind.checks_owner() {
                return Err(Error::PermissionDenied(format!(
                    "tid {} does not own mutex {} (owner {})",
                    tid, self.id, owner
                )));
            }
            log::warn!("tid {} unlocked mutex {} owned by tid {}", tid, self.id, owner);
        }
        if self.depth > 1 {
            self.depth -= 1;
            return Ok(());
        }
        self.owner_died = false;
        self.hand_off(wake);
        Ok(())
    }

    /// Releases the lock entirely for a condition wait, returning the depth held
    pub fn release_all(&mut self, tid: Tid, wake: &mut Vec<Wakeup>) -> Result<u32> {
        if self.owner != Some(tid) {
            return Err(Error::PermissionDenied(format!("tid {} does not own mutex {}", tid, self.id)));
        }
        let depth = self.depth;
        self.hand_off(wake);
        Ok(depth)
    }

    /// Cleans up after an exited thread
    ///
    /// A robust mutex held by it passes on and is flagged; others stay held.
    pub fn owner_exited(&mut self, tid: Tid, wake: &mut Vec<Wakeup>) -> bool {
        if self.owner != Some(tid) {
            return false;
        }
        if self.kind != MutexKind::Robust {
            log::warn!("tid {} exited holding mutex {}", tid, self.id);
            return false;
        }
        self.hand_off(wake);
        self.owner_died = true;
        true
    }

    pub fn cancel(&mut self, token: WaitToken) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|w| w.token != token);
        before != self.waiters.len()
    }

    pub fn stats(&self) -> MutexStats {
        MutexStats {
            id: self.id,
            kind: self.kind,
            owner: self.owner,
            depth: self.depth,
            waiting: self.waiters.len(),
            lock_count: self.lock_count,
            contention_count: self.contention_count,
            owner_died: self.owner_died,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusion_and_handoff() {
        let mut m = SimMutex::new(1, MutexKind::Normal);
        let mut wake = Vec::new();
        assert_eq!(m.lock(10).unwrap(), Step::Done(()));
        assert_eq!(m.lock(11).unwrap(), Step::Block);
        m.park(MutexWaiter::locker(WaitToken(1), 11));
        assert_eq!(m.try_lock(12), Err(Error::WouldBlock));
        m.unlock(10, &mut wake).unwrap();
        assert_eq!(m.owner(), Some(11));
        assert_eq!(wake, alloc::vec![(WaitToken(1), Ok(WaitResult::Acquired))]);
        assert_eq!(m.stats().contention_count, 2);
    }

    #[test]
    fn test_recursive_needs_matching_unlocks() {
        let mut m = SimMutex::new(1, MutexKind::Recursive);
        let mut wake = Vec::new();
        m.lock(5).unwrap();
        m.lock(5).unwrap();
        m.unlock(5, &mut wake).unwrap();
        assert!(m.is_locked());
        m.unlock(5, &mut wake).unwrap();
        assert!(!m.is_locked());
        assert!(m.unlock(5, &mut wake).is_err());
    }

    #[test]
    fn test_self_relock_and_owner_checks() {
        let mut m = SimMutex::new(1, MutexKind::ErrorCheck);
        let mut wake = Vec::new();
        m.lock(5).unwrap();
        assert!(matches!(m.lock(5), Err(Error::InvalidArgument(_))));
        assert!(matches!(m.unlock(6, &mut wake), Err(Error::PermissionDenied(_))));

        let mut n = SimMutex::new(2, MutexKind::Normal);
        n.lock(5).unwrap();
        n.unlock(6, &mut wake).unwrap();
        assert!(!n.is_locked());
    }

    #[test]
    fn test_robust_owner_death() {
        let mut m = SimMutex::new(1, MutexKind::Robust);
        let mut wake = Vec::new();
        m.lock(5).unwrap();
        m.park(MutexWaiter::locker(WaitToken(4), 6));
        assert!(m.owner_exited(5, &mut wake));
        assert_eq!(m.owner(), Some(6));
        assert!(m.stats().owner_died);
    }
}
