//! Simulated condition variables
//!
//! A waiter releases its mutex when it parks. On signal or timeout it is
//! handed back to the mutex: it completes at once if the mutex is free,
//! otherwise it joins the mutex queue and completes when the lock is
//! handed to it.

use alloc::collections::VecDeque;

use akern_api::Tid;

use crate::wait::WaitToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CondWaiter {
    pub token: WaitToken,
    pub tid: Tid,
    pub mutex: u32,
    /// Recursion depth to restore on the mutex
    pub depth: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CondVarStats {
    pub id: u32,
    pub waiting: usize,
    pub signals: u64,
    pub broadcasts: u64,
    pub timeouts: u64,
}

#[derive(Debug)]
pub struct SimCondVar {
    pub id: u32,
    waiters: VecDeque<CondWaiter>,
    pub(crate) signals: u64,
    pub(crate) broadcasts: u64,
    pub(crate) timeouts: u64,
}

impl SimCondVar {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            waiters: VecDeque::new(),
            signals: 0,
            broadcasts: 0,
            timeouts: 0,
        }
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }

    pub fn park(&mut self, waiter: CondWaiter) {
        self.waiters.push_back(waiter);
    }

    /// Oldest waiter
    pub fn pop(&mut self) -> Option<CondWaiter> {
        self.waiters.pop_front()
    }

    /// Removes a specific waiter, e.g. on timeout or cancellation
    pub fn remove(&mut self, token: WaitToken) -> Option<CondWaiter> {
        let pos = self.waiters.iter().position(|w| w.token == token)?;
        self.waiters.remove(pos)
    }

    pub fn stats(&self) -> CondVarStats {
        CondVarStats {
            id: self.id,
            waiting: self.waiters.len(),
            signals: self.signals,
            broadcasts: self.broadcasts,
            timeouts: self.timeouts,
        }
    }
}
