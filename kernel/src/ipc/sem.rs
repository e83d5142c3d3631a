//! Counting semaphores

use alloc::collections::VecDeque;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use akern_api::{Error, Pid, Result};

use super::Step;
use crate::wait::{WaitResult, WaitToken, Wakeup};

/// Largest value a semaphore may hold
pub const SEM_VALUE_MAX: u32 = i32::MAX as u32;

/// Snapshot of a semaphore
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemaphoreStats {
    pub id: u32,
    pub name: Option<String>,
    pub value: u32,
    pub waiting: usize,
    pub waits: u64,
    pub posts: u64,
}

/// One semaphore
#[derive(Debug)]
pub struct Semaphore {
    pub id: u32,
    pub name: Option<String>,
    pub owner: Pid,
    value: u32,
    waiters: VecDeque<WaitToken>,
    waits: u64,
    posts: u64,
}

impl Semaphore {
    pub fn new(id: u32, value: u32, owner: Pid) -> Result<Self> {
        if value > SEM_VALUE_MAX {
            return Err(Error::InvalidArgument(format!("semaphore value {} too large", value)));
        }
        Ok(Self {
            id,
            name: None,
            owner,
            value,
            waiters: VecDeque::new(),
            waits: 0,
            posts: 0,
        })
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    /// Takes one unit, or asks the caller to block
    pub fn wait(&mut self) -> Step<()> {
        self.waits += 1;
        if self.value > 0 && self.waiters.is_empty() {
            self.value -= 1;
            Step::Done(())
        } else {
            Step::Block
        }
    }

    /// Takes one unit or fails with `WouldBlock`
    pub fn try_wait(&mut self) -> Result<()> {
        if self.value == 0 || !self.waiters.is_empty() {
            return Err(Error::WouldBlock);
        }
        self.waits += 1;
        self.value -= 1;
        Ok(())
    }

    pub fn park(&mut self, token: WaitToken) {
        self.waiters.push_back(token);
    }

    /// Adds `n` units; waiters take them in arrival order
    pub fn post(&mut self, n: u32, wake: &mut Vec<Wakeup>) -> Result<()> {
        if n == 0 {
            return Err(Error::InvalidArgument("semaphore post of zero".into()));
        }
        let handoff = (n as usize).min(self.waiters.len());
        let rest = n - handoff as u32;
        if self.value.checked_add(rest).is_none_or(|v| v > SEM_VALUE_MAX) {
            return Err(Error::InvalidArgument(format!("semaphore {} would overflow", self.id)));
        }
        self.posts += u64::from(n);
        for token in self.waiters.drain(..handoff) {
            wake.push((token, Ok(WaitResult::Acquired)));
        }
        self.value += rest;
        Ok(())
    }

    pub fn cancel(&mut self, token: WaitToken) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|t| *t != token);
        before != self.waiters.len()
    }

    /// Fails every waiter; used when the semaphore is destroyed
    pub fn fail_waiters(&mut self, wake: &mut Vec<Wakeup>) {
        for token in self.waiters.drain(..) {
            wake.push((token, Err(Error::NotFound(format!("semaphore {} destroyed", self.id)))));
        }
    }

    pub fn stats(&self) -> SemaphoreStats {
        SemaphoreStats {
            id: self.id,
            name: self.name.clone(),
            value: self.value,
            waiting: self.waiters.len(),
            waits: self.waits,
            posts: self.posts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_post_conserves_value() {
        let mut sem = Semaphore::new(1, 2, 1).unwrap();
        let mut wake = Vec::new();
        assert_eq!(sem.wait(), Step::Done(()));
        assert_eq!(sem.wait(), Step::Done(()));
        assert_eq!(sem.try_wait(), Err(Error::WouldBlock));
        sem.post(1, &mut wake).unwrap();
        sem.post(1, &mut wake).unwrap();
        assert_eq!(sem.value(), 2);
    }

    #[test]
    fn test_post_hands_off_in_order() {
        let mut sem = Semaphore::new(1, 0, 1).unwrap();
        let mut wake = Vec::new();
        assert_eq!(sem.wait(), Step::Block);
        sem.park(WaitToken(1));
        assert_eq!(sem.wait(), Step::Block);
        sem.park(WaitToken(2));
        sem.post(3, &mut wake).unwrap();
        assert_eq!(
            wake,
            alloc::vec![(WaitToken(1), Ok(WaitResult::Acquired)), (WaitToken(2), Ok(WaitResult::Acquired))]
        );
        assert_eq!(sem.value(), 1);
    }

    #[test]
    fn test_destroy_fails_waiters() {
        let mut sem = Semaphore::new(4, 0, 1).unwrap();
        let mut wake = Vec::new();
        sem.park(WaitToken(8));
        assert!(sem.cancel(WaitToken(8)));
        sem.park(WaitToken(9));
        sem.fail_waiters(&mut wake);
        assert!(matches!(wake[0], (WaitToken(9), Err(Error::NotFound(_)))));
    }
}
