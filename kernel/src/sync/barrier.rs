//! Reusable barriers

use alloc::format;
use alloc::vec::Vec;

use akern_api::{Error, Result};

use crate::ipc::Step;
use crate::wait::{WaitResult, WaitToken, Wakeup};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierStats {
    pub id: u32,
    pub threshold: u32,
    pub current_count: u32,
    pub generation: u64,
}

#[derive(Debug)]
pub struct SimBarrier {
    pub id: u32,
    pub threshold: u32,
    waiting: Vec<WaitToken>,
    generation: u64,
}

impl SimBarrier {
    pub fn new(id: u32, threshold: u32) -> Result<Self> {
        if threshold == 0 {
            return Err(Error::InvalidArgument(format!("barrier {} needs a threshold", id)));
        }
        Ok(Self {
            id,
            threshold,
            waiting: Vec::new(),
            generation: 0,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiting.is_empty()
    }

    /// One arrival; the arrival that completes the set releases everyone
    ///
    /// The releasing arrival gets `Done(true)`, the parked ones are woken
    /// with `serial = false`.
    pub fn arrive(&mut self, wake: &mut Vec<Wakeup>) -> Step<bool> {
        if self.waiting.len() as u32 + 1 < self.threshold {
            return Step::Block;
        }
        for token in self.waiting.drain(..) {
            wake.push((token, Ok(WaitResult::Barrier { serial: false })));
        }
        self.generation += 1;
        Step::Done(true)
    }

    pub fn park(&mut self, token: WaitToken) {
        self.waiting.push(token);
    }

    pub fn cancel(&mut self, token: WaitToken) -> bool {
        let before = self.waiting.len();
        self.waiting.retain(|t| *t != token);
        before != self.waiting.len()
    }

    pub fn stats(&self) -> BarrierStats {
        BarrierStats {
            id: self.id,
            threshold: self.threshold,
            current_count: self.waiting.len() as u32,
            generation: self.generation,
        }
    }
}
