//! Synchronization entry points

use alloc::format;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use akern_api::{CpuId, Error, Nanoseconds, Result, Tid};

use super::Kernel;
use crate::ipc::Step;
use crate::process::ProcessManager;
use crate::sync::{
    BarrierStats, CondVarStats, Effects, MutexKind, MutexStats, MutexWaiter, RwLockStats, RwMode, SpinlockStats,
    SyncCounts,
};
use crate::wait::{Blocking, WaitChannel, WaitToken};

impl Kernel {
    fn live_thread(pm: &ProcessManager, tid: Tid) -> Result<()> {
        let pid = pm.pid_of(tid)?;
        Self::live_process(pm, pid)
    }

    fn check_cpu(&self, cpu: CpuId) -> Result<()> {
        if cpu >= self.config.num_cpus {
            return Err(Error::InvalidArgument(format!("no cpu {}", cpu)));
        }
        Ok(())
    }

    // ========================================================================
    // Mutex
    // ========================================================================

    pub fn create_mutex(&self, kind: MutexKind, name: Option<&str>) -> Result<u32> {
        self.sync.lock().create_mutex(kind, name)
    }

    /// Fails with `Busy` while the mutex is held or has waiters
    pub fn destroy_mutex(&self, id: u32) -> Result<()> {
        self.sync.lock().destroy_mutex(id)
    }

    /// Locks or suspends until the mutex is handed over
    pub fn mutex_lock(&self, tid: Tid, id: u32) -> Result<Blocking<()>> {
        let mut pm = self.procs.lock();
        Self::live_thread(&pm, tid)?;
        let mut sync = self.sync.lock();
        match sync.mutex_lock(id, tid)? {
            Step::Done(()) => Ok(Blocking::Ready(())),
            Step::Block => {
                let token = pm.block_thread(tid, WaitChannel::Mutex(id), None)?;
                sync.mutex_mut(id)?.park(MutexWaiter::locker(token, tid));
                Ok(Blocking::Pending(token))
            }
        }
    }

    pub fn mutex_try_lock(&self, tid: Tid, id: u32) -> Result<()> {
        let pm = self.procs.lock();
        Self::live_thread(&pm, tid)?;
        self.sync.lock().mutex_try_lock(id, tid)
    }

    /// Releases one level; the oldest waiter becomes the owner
    pub fn mutex_unlock(&self, tid: Tid, id: u32) -> Result<()> {
        let now = self.now();
        let mut pm = self.procs.lock();
        let mut fx = Effects::default();
        let unlocked = self.sync.lock().mutex_unlock(id, tid, &mut fx);
        Self::apply_effects(&mut pm, fx, now);
        unlocked
    }

    pub fn mutex_stats(&self, id: u32) -> Result<MutexStats> {
        Ok(self.sync.lock().mutex(id)?.stats())
    }

    // ========================================================================
    // Reader-writer lock
    // ========================================================================

    pub fn create_rwlock(&self, prefer_writers: bool) -> Result<u32> {
        self.sync.lock().create_rwlock(prefer_writers)
    }

    pub fn destroy_rwlock(&self, id: u32) -> Result<()> {
        self.sync.lock().destroy_rwlock(id)
    }

    fn rwlock_acquire(&self, tid: Tid, id: u32, mode: RwMode) -> Result<Blocking<()>> {
        let mut pm = self.procs.lock();
        Self::live_thread(&pm, tid)?;
        let mut sync = self.sync.lock();
        let lock = sync.rwlock_mut(id)?;
        match lock.lock(tid, mode)? {
            Step::Done(()) => Ok(Blocking::Ready(())),
            Step::Block => {
                let token = pm.block_thread(tid, WaitChannel::RwLock(id), None)?;
                lock.park(token, tid, mode);
                Ok(Blocking::Pending(token))
            }
        }
    }

    pub fn read_lock(&self, tid: Tid, id: u32) -> Result<Blocking<()>> {
        self.rwlock_acquire(tid, id, RwMode::Read)
    }

    pub fn write_lock(&self, tid: Tid, id: u32) -> Result<Blocking<()>> {
        self.rwlock_acquire(tid, id, RwMode::Write)
    }

    pub fn try_read_lock(&self, tid: Tid, id: u32) -> Result<()> {
        self.sync.lock().rwlock_mut(id)?.try_lock(tid, RwMode::Read)
    }

    pub fn try_write_lock(&self, tid: Tid, id: u32) -> Result<()> {
        self.sync.lock().rwlock_mut(id)?.try_lock(tid, RwMode::Write)
    }

    /// Drops `tid`'s hold, read or write
    pub fn rwlock_unlock(&self, tid: Tid, id: u32) -> Result<()> {
        let now = self.now();
        let mut pm = self.procs.lock();
        let mut wake = Vec::new();
        let unlocked = self.sync.lock().rwlock_mut(id).and_then(|l| l.unlock(tid, &mut wake));
        Self::apply_wakeups(&mut pm, wake, now);
        unlocked
    }

    pub fn rwlock_stats(&self, id: u32) -> Result<RwLockStats> {
        Ok(self.sync.lock().rwlock(id)?.stats())
    }

    // ========================================================================
    // Condition variable
    // ========================================================================

    pub fn create_condvar(&self) -> Result<u32> {
        self.sync.lock().create_condvar()
    }

    pub fn destroy_condvar(&self, id: u32) -> Result<()> {
        self.sync.lock().destroy_condvar(id)
    }

    /// Releases `mutex` and waits for a signal
    ///
    /// The caller must hold `mutex`. The outcome arrives once the mutex has
    /// been reacquired at its previous depth.
    pub fn condvar_wait(&self, tid: Tid, cv: u32, mutex: u32) -> Result<WaitToken> {
        self.cond_wait(tid, cv, mutex, None)
    }

    /// As [`condvar_wait`](Self::condvar_wait), timing out after `timeout_ns`
    pub fn condvar_timed_wait(&self, tid: Tid, cv: u32, mutex: u32, timeout_ns: Nanoseconds) -> Result<WaitToken> {
        let deadline = self.now().saturating_add(timeout_ns);
        self.cond_wait(tid, cv, mutex, Some(deadline))
    }

    fn cond_wait(&self, tid: Tid, cv: u32, mutex: u32, deadline: Option<Nanoseconds>) -> Result<WaitToken> {
        let now = self.now();
        let mut pm = self.procs.lock();
        Self::live_thread(&pm, tid)?;
        let mut fx = Effects::default();
        let token = {
            let mut sync = self.sync.lock();
            sync.cond_check(cv, mutex, tid)?;
            let token = pm.block_thread(tid, WaitChannel::CondVar(cv), deadline)?;
            if let Err(err) = sync.cond_park(cv, mutex, token, tid, &mut fx) {
                fx.wake.push((token, Err(err)));
            }
            token
        };
        Self::apply_effects(&mut pm, fx, now);
        Ok(token)
    }

    /// Wakes the oldest waiter; false when nobody waited
    pub fn condvar_signal(&self, cv: u32) -> Result<bool> {
        let now = self.now();
        let mut pm = self.procs.lock();
        let mut fx = Effects::default();
        let signalled = self.sync.lock().cond_signal(cv, &mut fx);
        Self::apply_effects(&mut pm, fx, now);
        signalled
    }

    /// Wakes every waiter; returns how many
    pub fn condvar_broadcast(&self, cv: u32) -> Result<usize> {
        let now = self.now();
        let mut pm = self.procs.lock();
        let mut fx = Effects::default();
        let woken = self.sync.lock().cond_broadcast(cv, &mut fx);
        Self::apply_effects(&mut pm, fx, now);
        woken
    }

    pub fn condvar_stats(&self, cv: u32) -> Result<CondVarStats> {
        Ok(self.sync.lock().condvar(cv)?.stats())
    }

    // ========================================================================
    // Barrier
    // ========================================================================

    pub fn create_barrier(&self, threshold: u32) -> Result<u32> {
        self.sync.lock().create_barrier(threshold)
    }

    pub fn destroy_barrier(&self, id: u32) -> Result<()> {
        self.sync.lock().destroy_barrier(id)
    }

    /// Arrives at a barrier
    ///
    /// The arrival that completes the set returns `Ready(true)` and releases
    /// the others with `serial = false`.
    pub fn barrier_wait(&self, tid: Tid, id: u32) -> Result<Blocking<bool>> {
        let now = self.now();
        let mut pm = self.procs.lock();
        Self::live_thread(&pm, tid)?;
        let mut wake = Vec::new();
        let result = (|| -> Result<Blocking<bool>> {
            let mut sync = self.sync.lock();
            match sync.barrier_mut(id)?.arrive(&mut wake) {
                Step::Done(serial) => Ok(Blocking::Ready(serial)),
                Step::Block => {
                    let token = pm.block_thread(tid, WaitChannel::Barrier(id), None)?;
                    sync.barrier_mut(id)?.park(token);
                    Ok(Blocking::Pending(token))
                }
            }
        })();
        Self::apply_wakeups(&mut pm, wake, now);
        result
    }

    pub fn barrier_stats(&self, id: u32) -> Result<BarrierStats> {
        Ok(self.sync.lock().barrier(id)?.stats())
    }

    // ========================================================================
    // Spinlock
    // ========================================================================

    pub fn create_spinlock(&self) -> Result<u32> {
        self.sync.lock().create_spinlock()
    }

    pub fn destroy_spinlock(&self, id: u32) -> Result<()> {
        self.sync.lock().destroy_spinlock(id)
    }

    /// Spins for the configured limit, then fails with `WouldBlock`
    pub fn spin_lock(&self, id: u32, cpu: CpuId) -> Result<()> {
        self.spin_acquire(id, cpu, false)
    }

    /// Takes the lock with interrupts off; `cpu` is not preempted until
    /// the matching unlock
    pub fn spin_lock_irqsave(&self, id: u32, cpu: CpuId) -> Result<()> {
        self.spin_acquire(id, cpu, true)
    }

    fn spin_acquire(&self, id: u32, cpu: CpuId, irqsave: bool) -> Result<()> {
        self.check_cpu(cpu)?;
        let lock = self.sync.lock().spinlock(id)?;
        lock.lock(cpu, self.config.spin_limit, irqsave)?;
        if irqsave {
            self.preempt_off.fetch_or(1 << cpu, Ordering::AcqRel);
        }
        Ok(())
    }

    pub fn spin_unlock(&self, id: u32, cpu: CpuId) -> Result<()> {
        self.check_cpu(cpu)?;
        let lock = self.sync.lock().spinlock(id)?;
        if lock.unlock(cpu)? {
            self.preempt_off.fetch_and(!(1 << cpu), Ordering::AcqRel);
        }
        Ok(())
    }

    pub fn spinlock_stats(&self, id: u32) -> Result<SpinlockStats> {
        Ok(self.sync.lock().spinlock(id)?.stats())
    }

    pub fn sync_counts(&self) -> SyncCounts {
        self.sync.lock().counts()
    }
}

#[cfg(test)]
mod tests {
    use akern_api::{INIT_PID, Pid};

    use super::*;
    use crate::config::KernelConfig;
    use crate::wait::WaitResult;

    fn threads(n: usize) -> (Kernel, Pid, Vec<Tid>) {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let pid = kernel.create_process("sync", INIT_PID).unwrap();
        let mut tids = alloc::vec![kernel.threads_of(pid).unwrap()[0].tid];
        for i in 1..n {
            tids.push(kernel.create_thread(pid, &format!("t{}", i), 0, 0).unwrap());
        }
        (kernel, pid, tids)
    }

    #[test]
    fn test_mutex_hands_over_in_order() {
        let (kernel, _, t) = threads(3);
        let m = kernel.create_mutex(MutexKind::Normal, None).unwrap();
        assert!(kernel.mutex_lock(t[0], m).unwrap().is_ready());
        let w1 = kernel.mutex_lock(t[1], m).unwrap().token().unwrap();
        let w2 = kernel.mutex_lock(t[2], m).unwrap().token().unwrap();
        assert!(matches!(kernel.destroy_mutex(m), Err(Error::Busy(_))));

        kernel.mutex_unlock(t[0], m).unwrap();
        assert_eq!(kernel.poll_wait(w1).unwrap(), Some(WaitResult::Acquired));
        assert_eq!(kernel.poll_wait(w2).unwrap(), None);
        assert_eq!(kernel.mutex_stats(m).unwrap().owner, Some(t[1]));
    }

    #[test]
    fn test_condvar_signal_reacquires_mutex() {
        let (kernel, _, t) = threads(2);
        let m = kernel.create_mutex(MutexKind::Normal, None).unwrap();
        let cv = kernel.create_condvar().unwrap();
        assert!(kernel.condvar_wait(t[0], cv, m).is_err());

        kernel.mutex_lock(t[0], m).unwrap();
        let token = kernel.condvar_wait(t[0], cv, m).unwrap();
        assert!(kernel.mutex_lock(t[1], m).unwrap().is_ready());
        assert!(kernel.condvar_signal(cv).unwrap());
        assert_eq!(kernel.poll_wait(token).unwrap(), None);
        kernel.mutex_unlock(t[1], m).unwrap();
        assert_eq!(kernel.poll_wait(token).unwrap(), Some(WaitResult::Signaled));
    }

    #[test]
    fn test_condvar_timeout() {
        let (kernel, _, t) = threads(1);
        let m = kernel.create_mutex(MutexKind::Normal, None).unwrap();
        let cv = kernel.create_condvar().unwrap();
        kernel.mutex_lock(t[0], m).unwrap();
        let token = kernel.condvar_timed_wait(t[0], cv, m, 1_000).unwrap();
        kernel.advance_clock(2_000);
        assert_eq!(kernel.poll_wait(token).unwrap(), Some(WaitResult::TimedOut));
        assert_eq!(kernel.mutex_stats(m).unwrap().owner, Some(t[0]));
    }

    #[test]
    fn test_barrier_releases_all() {
        let (kernel, _, t) = threads(3);
        let b = kernel.create_barrier(3).unwrap();
        let a = kernel.barrier_wait(t[0], b).unwrap().token().unwrap();
        let c = kernel.barrier_wait(t[1], b).unwrap().token().unwrap();
        assert_eq!(kernel.barrier_wait(t[2], b).unwrap(), Blocking::Ready(true));
        assert_eq!(kernel.poll_wait(a).unwrap(), Some(WaitResult::Barrier { serial: false }));
        assert_eq!(kernel.poll_wait(c).unwrap(), Some(WaitResult::Barrier { serial: false }));
    }

    #[test]
    fn test_irqsave_spinlock_disables_preemption() {
        let kernel = Kernel::new(KernelConfig::default().with_cpus(2)).unwrap();
        let s = kernel.create_spinlock().unwrap();
        kernel.spin_lock_irqsave(s, 1).unwrap();
        assert!(kernel.preemption_disabled(1));
        assert_eq!(kernel.spin_lock(s, 0), Err(Error::WouldBlock));
        assert!(kernel.spin_lock(s, 1).is_err());
        assert!(kernel.spin_unlock(s, 0).is_err());
        kernel.spin_unlock(s, 1).unwrap();
        assert!(!kernel.preemption_disabled(1));
        assert!(kernel.spin_lock(s, 7).is_err());
    }
}
