//! Wait tokens and the wait registry
//!
//! A blocking operation that cannot finish registers a slot here and hands
//! its token back to the caller as `Blocking::Pending`. The operation that
//! satisfies the wait completes the slot exactly once; the caller collects
//! the outcome with `Kernel::poll_wait`.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use akern_api::{Error, Nanoseconds, Pid, Result, Tid};

use crate::process::ProcessState;

/// Handle of one suspended operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WaitToken(pub u64);

/// What a completed wait produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitResult {
    /// Lock or semaphore acquired
    Acquired,
    /// Bytes read (empty on end of file)
    Bytes(Vec<u8>),
    /// Bytes written in total
    Written(usize),
    /// A message was received
    Message {
        /// Message type
        mtype: i64,
        /// Payload
        data: Vec<u8>,
    },
    /// A message was queued
    Sent,
    /// A child was reaped
    Child {
        /// Child pid
        pid: Pid,
        /// Exit code
        status: i32,
    },
    /// A joined thread exited
    Joined(i32),
    /// A barrier released; `serial` is true for exactly one arrival
    Barrier {
        /// The arrival that triggered the release
        serial: bool,
    },
    /// Condition variable signalled and mutex reacquired
    Signaled,
    /// Condition variable wait expired and mutex reacquired
    TimedOut,
    /// Sleep finished
    Slept,
}

/// A completion produced by the operation that satisfied a wait
pub type Wakeup = (WaitToken, Result<WaitResult>);

/// Outcome of an operation that may suspend the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blocking<T> {
    /// Finished immediately
    Ready(T),
    /// Suspended; poll the token for the outcome
    Pending(WaitToken),
}

impl<T> Blocking<T> {
    /// Whether the operation finished
    pub fn is_ready(&self) -> bool {
        matches!(self, Blocking::Ready(_))
    }

    /// Whether the caller was suspended
    pub fn is_pending(&self) -> bool {
        matches!(self, Blocking::Pending(_))
    }

    /// The value, if ready
    pub fn ready(self) -> Option<T> {
        match self {
            Blocking::Ready(v) => Some(v),
            Blocking::Pending(_) => None,
        }
    }

    /// The token, if pending
    pub fn token(&self) -> Option<WaitToken> {
        match self {
            Blocking::Ready(_) => None,
            Blocking::Pending(t) => Some(*t),
        }
    }

    /// Maps the ready value
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Blocking<U> {
        match self {
            Blocking::Ready(v) => Blocking::Ready(f(v)),
            Blocking::Pending(t) => Blocking::Pending(t),
        }
    }
}

/// Object a waiter is queued on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitChannel {
    /// Reader of a pipe
    PipeRead(u32),
    /// Writer of a pipe
    PipeWrite(u32),
    /// Sender on a message queue
    MqSend(u32),
    /// Receiver on a message queue
    MqReceive(u32),
    /// Semaphore waiter
    Semaphore(u32),
    /// Mutex waiter
    Mutex(u32),
    /// Reader-writer lock waiter
    RwLock(u32),
    /// Condition variable waiter
    CondVar(u32),
    /// Barrier arrival
    Barrier(u32),
    /// Parent waiting for a child; `-1` for any
    Child(i64),
    /// Thread joining another
    Join(Tid),
    /// Timed sleep
    Sleep,
}

impl WaitChannel {
    /// Process state while every thread waits on this channel
    pub fn process_state(self) -> ProcessState {
        match self {
            WaitChannel::PipeRead(_)
            | WaitChannel::PipeWrite(_)
            | WaitChannel::MqSend(_)
            | WaitChannel::MqReceive(_)
            | WaitChannel::Semaphore(_) => ProcessState::WaitingIpc,
            WaitChannel::Mutex(_)
            | WaitChannel::RwLock(_)
            | WaitChannel::CondVar(_)
            | WaitChannel::Barrier(_) => ProcessState::WaitingMutex,
            WaitChannel::Sleep => ProcessState::Sleeping,
            WaitChannel::Child(_) | WaitChannel::Join(_) => ProcessState::Blocked,
        }
    }
}

/// One registered wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitSlot {
    /// Token
    pub token: WaitToken,
    /// Waiting thread
    pub tid: Tid,
    /// Owning process
    pub pid: Pid,
    /// Where the waiter is queued
    pub channel: WaitChannel,
    /// Expiry time, for timed waits
    pub deadline: Option<Nanoseconds>,
    outcome: Option<Result<WaitResult>>,
}

impl WaitSlot {
    /// Whether the wait is still outstanding
    pub fn is_pending(&self) -> bool {
        self.outcome.is_none()
    }
}

/// Completed slots a thread may leave uncollected; the oldest go first
pub const MAX_UNCOLLECTED_PER_THREAD: usize = 16;

/// Every outstanding or uncollected wait
#[derive(Debug, Default)]
pub struct WaitRegistry {
    slots: BTreeMap<WaitToken, WaitSlot>,
    next: u64,
}

impl WaitRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new pending wait
    pub fn register(
        &mut self,
        tid: Tid,
        pid: Pid,
        channel: WaitChannel,
        deadline: Option<Nanoseconds>,
    ) -> WaitToken {
        self.next += 1;
        let token = WaitToken(self.next);
        self.slots.insert(
            token,
            WaitSlot {
                token,
                tid,
                pid,
                channel,
                deadline,
                outcome: None,
            },
        );
        token
    }

    /// Completes a pending wait, returning the thread to wake
    ///
    /// A slot that already completed is left untouched and `None` is returned.
    pub fn complete(&mut self, token: WaitToken, outcome: Result<WaitResult>) -> Option<(Tid, Pid)> {
        let slot = self.slots.get_mut(&token)?;
        if slot.outcome.is_some() {
            return None;
        }
        slot.outcome = Some(outcome);
        slot.deadline = None;
        let (tid, pid) = (slot.tid, slot.pid);
        self.trim_uncollected(tid);
        Some((tid, pid))
    }

    fn trim_uncollected(&mut self, tid: Tid) {
        let done: Vec<WaitToken> = self
            .slots
            .values()
            .filter(|s| s.tid == tid && !s.is_pending())
            .map(|s| s.token)
            .collect();
        let excess = done.len().saturating_sub(MAX_UNCOLLECTED_PER_THREAD);
        for token in &done[..excess] {
            self.slots.remove(token);
            log::trace!("wait: dropped uncollected token {} of tid {}", token.0, tid);
        }
    }

    /// Moves a pending waiter to another queue, optionally clearing its deadline
    pub fn requeue(&mut self, token: WaitToken, channel: WaitChannel, keep_deadline: bool) {
        if let Some(slot) = self.slots.get_mut(&token) {
            slot.channel = channel;
            if !keep_deadline {
                slot.deadline = None;
            }
        }
    }

    /// Takes the outcome of a completed wait; `Ok(None)` while pending
    pub fn take(&mut self, token: WaitToken) -> Result<Option<Result<WaitResult>>> {
        let slot = self
            .slots
            .get(&token)
            .ok_or_else(|| Error::NotFound(alloc::format!("wait token {}", token.0)))?;
        if slot.outcome.is_none() {
            return Ok(None);
        }
        Ok(self.slots.remove(&token).and_then(|s| s.outcome))
    }

    /// Slot behind a token
    pub fn slot(&self, token: WaitToken) -> Option<&WaitSlot> {
        self.slots.get(&token)
    }

    /// Pending waits of one thread
    pub fn pending_for_thread(&self, tid: Tid) -> Vec<(WaitToken, WaitChannel)> {
        self.slots
            .values()
            .filter(|s| s.tid == tid && s.is_pending())
            .map(|s| (s.token, s.channel))
            .collect()
    }

    /// Pending waits whose deadline is at or before `now`
    pub fn expired(&self, now: Nanoseconds) -> Vec<(WaitToken, WaitChannel)> {
        self.slots
            .values()
            .filter(|s| s.is_pending() && s.deadline.is_some_and(|d| d <= now))
            .map(|s| (s.token, s.channel))
            .collect()
    }

    /// Pending waits on a channel in registration order
    pub fn pending_on(&self, channel: WaitChannel) -> Vec<WaitToken> {
        self.slots
            .values()
            .filter(|s| s.is_pending() && s.channel == channel)
            .map(|s| s.token)
            .collect()
    }

    /// Drops every slot of a reaped process
    pub fn purge_process(&mut self, pid: Pid) {
        self.slots.retain(|_, s| s.pid != pid);
    }

    /// Number of pending waits
    pub fn pending_count(&self) -> usize {
        self.slots.values().filter(|s| s.is_pending()).count()
    }

    /// Completed waits nobody has collected yet
    pub fn uncollected_count(&self) -> usize {
        self.slots.len() - self.pending_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completes_exactly_once() {
        let mut reg = WaitRegistry::new();
        let token = reg.register(5, 5, WaitChannel::Sleep, Some(100));
        assert_eq!(reg.take(token).unwrap(), None);
        assert_eq!(reg.expired(100), alloc::vec![(token, WaitChannel::Sleep)]);
        assert_eq!(reg.complete(token, Ok(WaitResult::Slept)), Some((5, 5)));
        assert_eq!(reg.complete(token, Err(Error::Timeout)), None);
        assert!(reg.expired(200).is_empty());
        assert_eq!(reg.take(token).unwrap(), Some(Ok(WaitResult::Slept)));
        assert!(reg.take(token).is_err());
    }

    #[test]
    fn test_uncollected_outcomes_are_capped() {
        let mut reg = WaitRegistry::new();
        let tokens: Vec<_> = (0..MAX_UNCOLLECTED_PER_THREAD + 3)
            .map(|_| reg.register(7, 7, WaitChannel::Sleep, None))
            .collect();
        let other = reg.register(8, 7, WaitChannel::Sleep, None);
        for token in &tokens {
            reg.complete(*token, Ok(WaitResult::Slept));
        }
        reg.complete(other, Ok(WaitResult::Slept));

        assert_eq!(reg.uncollected_count(), MAX_UNCOLLECTED_PER_THREAD + 1);
        assert!(reg.take(tokens[0]).is_err());
        assert!(reg.take(tokens[2]).is_err());
        assert_eq!(reg.take(tokens[3]).unwrap(), Some(Ok(WaitResult::Slept)));
        assert_eq!(reg.take(other).unwrap(), Some(Ok(WaitResult::Slept)));
    }

    #[test]
    fn test_blocking_helpers() {
        let ready: Blocking<u32> = Blocking::Ready(3);
        assert_eq!(ready.clone().map(|v| v * 2).ready(), Some(6));
        let pending: Blocking<u32> = Blocking::Pending(WaitToken(9));
        assert_eq!(pending.token(), Some(WaitToken(9)));
        assert!(pending.is_pending());
    }
}
