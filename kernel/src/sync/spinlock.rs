//! Simulated spinlocks
//!
//! These are real atomics. Callers spin on them after the sync table lock
//! has been dropped, so a held spinlock never stalls other registry users.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use akern_api::{CpuId, Error, Result};

const NO_CPU: u32 = u32::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpinlockStats {
    pub id: u32,
    pub locked: bool,
    pub holder: Option<CpuId>,
    pub interrupts_disabled: bool,
    pub acquisitions: u64,
    pub spin_count: u64,
}

#[derive(Debug)]
pub struct SimSpinlock {
    pub id: u32,
    locked: AtomicBool,
    holder: AtomicU32,
    irq_saved: AtomicBool,
    acquisitions: AtomicU64,
    spin_count: AtomicU64,
}

impl SimSpinlock {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            locked: AtomicBool::new(false),
            holder: AtomicU32::new(NO_CPU),
            irq_saved: AtomicBool::new(false),
            acquisitions: AtomicU64::new(0),
            spin_count: AtomicU64::new(0),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub fn holder(&self) -> Option<CpuId> {
        match self.holder.load(Ordering::Acquire) {
            NO_CPU => None,
            cpu => Some(cpu),
        }
    }

    /// Spins for at most `limit` iterations
    ///
    /// Fails with `WouldBlock` if still held, and with `InvalidArgument` if
    /// `cpu` already holds the lock.
    pub fn lock(&self, cpu: CpuId, limit: u32, irqsave: bool) -> Result<()> {
        if self.holder() == Some(cpu) {
            return Err(Error::InvalidArgument(format_deadlock(self.id, cpu)));
        }
        let mut spins = 0u32;
        loop {
            if self
                .locked
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.holder.store(cpu, Ordering::Release);
                self.irq_saved.store(irqsave, Ordering::Release);
                self.acquisitions.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            if spins >= limit {
                return Err(Error::WouldBlock);
            }
            spins += 1;
            self.spin_count.fetch_add(1, Ordering::Relaxed);
            spin_loop();
        }
    }

    /// Releases the lock; returns whether it was taken with interrupts disabled
    pub fn unlock(&self, cpu: CpuId) -> Result<bool> {
        let holder = self.holder();
        if holder != Some(cpu) {
            return Err(match holder {
                None => Error::InvalidArgument(alloc::format!("spinlock {} is not locked", self.id)),
                Some(other) => Error::PermissionDenied(alloc::format!(
                    "spinlock {} is held by cpu {}, not {}",
                    self.id, other, cpu
                )),
            });
        }
        let irq = self.irq_saved.swap(false, Ordering::AcqRel);
        self.holder.store(NO_CPU, Ordering::Release);
        self.locked.store(false, Ordering::Release);
        Ok(irq)
    }

    pub fn stats(&self) -> SpinlockStats {
        SpinlockStats {
            id: self.id,
            locked: self.is_locked(),
            holder: self.holder(),
            interrupts_disabled: self.irq_saved.load(Ordering::Acquire),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            spin_count: self.spin_count.load(Ordering::Relaxed),
        }
    }
}

fn format_deadlock(id: u32, cpu: CpuId) -> alloc::string::String {
    alloc::format!("deadlock: cpu {} already holds spinlock {}", cpu, id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spin_limit_gives_up() {
        let lock = SimSpinlock::new(1);
        lock.lock(0, 10, true).unwrap();
        assert_eq!(lock.lock(1, 5, false), Err(Error::WouldBlock));
        assert_eq!(lock.stats().spin_count, 5);
        assert!(lock.lock(0, 5, false).is_err());
        assert!(lock.unlock(1).is_err());
        assert!(lock.unlock(0).unwrap());
        lock.lock(1, 0, false).unwrap();
        assert_eq!(lock.holder(), Some(1));
    }
}
