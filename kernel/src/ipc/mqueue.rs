//! Message queues
//!
//! Messages carry a positive type and a priority. A receive filter of 0
//! takes the highest priority message (oldest among equals), a positive
//! filter the oldest message of exactly that type, and a negative filter
//! the oldest message of the lowest type not above its magnitude.

use alloc::collections::VecDeque;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use akern_api::{Error, Nanoseconds, Pid, Result, Uid};

use super::Step;
use crate::wait::{WaitResult, WaitToken, Wakeup};

/// One queued message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub mtype: i64,
    pub priority: u32,
    pub data: Vec<u8>,
    pub sender: Pid,
    pub sent_ns: Nanoseconds,
    seq: u64,
}

impl Message {
    /// Builds a message; the queue stamps its arrival order
    pub fn new(mtype: i64, priority: u32, data: Vec<u8>, sender: Pid, now: Nanoseconds) -> Self {
        Self {
            mtype,
            priority,
            data,
            sender,
            sent_ns: now,
            seq: 0,
        }
    }
}

/// Whether a message passes a receive filter
fn matches(filter: i64, mtype: i64) -> bool {
    match filter {
        0 => true,
        f if f > 0 => mtype == f,
        f => mtype <= f.saturating_neg(),
    }
}

/// Snapshot of a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub id: u32,
    pub name: Option<String>,
    pub owner: Pid,
    pub messages: usize,
    pub bytes: usize,
    pub max_messages: usize,
    pub max_message_size: usize,
    pub waiting_senders: usize,
    pub waiting_receivers: usize,
    pub sent: u64,
    pub received: u64,
}

/// One message queue
#[derive(Debug)]
pub struct MessageQueue {
    pub id: u32,
    pub name: Option<String>,
    pub owner: Pid,
    pub owner_uid: Uid,
    pub max_messages: usize,
    pub max_message_size: usize,
    messages: Vec<Message>,
    receivers: VecDeque<(WaitToken, i64)>,
    senders: VecDeque<(WaitToken, Message)>,
    next_seq: u64,
    sent: u64,
    received: u64,
}

impl MessageQueue {
    /// Creates an empty queue
    pub fn new(id: u32, owner: Pid, owner_uid: Uid, max_messages: usize, max_message_size: usize) -> Self {
        Self {
            id,
            name: None,
            owner,
            owner_uid,
            max_messages: max_messages.max(1),
            max_message_size,
            messages: Vec::new(),
            receivers: VecDeque::new(),
            senders: VecDeque::new(),
            next_seq: 0,
            sent: 0,
            received: 0,
        }
    }

    /// Messages queued
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether no message is queued
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn validate(&self, msg: &Message) -> Result<()> {
        if msg.mtype < 1 {
            return Err(Error::InvalidArgument(format!("message type {} must be positive", msg.mtype)));
        }
        if msg.data.len() > self.max_message_size {
            return Err(Error::InvalidArgument(format!(
                "message of {} bytes exceeds the {} byte limit of queue {}",
                msg.data.len(),
                self.max_message_size,
                self.id
            )));
        }
        Ok(())
    }

    /// Hands a message to the oldest matching receiver, or stores it
    fn route(&mut self, mut msg: Message, wake: &mut Vec<Wakeup>) {
        self.sent += 1;
        if let Some(pos) = self.receivers.iter().position(|(_, f)| matches(*f, msg.mtype)) {
            if let Some((token, _)) = self.receivers.remove(pos) {
                self.received += 1;
                wake.push((
                    token,
                    Ok(WaitResult::Message {
                        mtype: msg.mtype,
                        data: msg.data,
                    }),
                ));
                return;
            }
        }
        self.next_seq += 1;
        msg.seq = self.next_seq;
        self.messages.push(msg);
    }

    /// Admits parked senders while there is room
    fn admit_senders(&mut self, wake: &mut Vec<Wakeup>) {
        while self.messages.len() < self.max_messages {
            let Some((token, msg)) = self.senders.pop_front() else {
                break;
            };
            self.route(msg, wake);
            wake.push((token, Ok(WaitResult::Sent)));
        }
    }

    /// Sends a message
    pub fn send(&mut self, msg: Message, nonblock: bool, wake: &mut Vec<Wakeup>) -> Result<Step<()>> {
        self.validate(&msg)?;
        let delivers = self.receivers.iter().any(|(_, f)| matches(*f, msg.mtype));
        if !delivers && (!self.senders.is_empty() || self.messages.len() >= self.max_messages) {
            return if nonblock { Err(Error::WouldBlock) } else { Ok(Step::Block) };
        }
        self.route(msg, wake);
        Ok(Step::Done(()))
    }

    fn select(&self, filter: i64) -> Option<usize> {
        let candidates = self
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| matches(filter, m.mtype));
        match filter {
            0 => candidates
                .min_by_key(|(_, m)| (core::cmp::Reverse(m.priority), m.seq))
                .map(|(i, _)| i),
            f if f > 0 => candidates.min_by_key(|(_, m)| m.seq).map(|(i, _)| i),
            _ => candidates.min_by_key(|(_, m)| (m.mtype, m.seq)).map(|(i, _)| i),
        }
    }

    /// Receives a message passing `filter`
    pub fn receive(&mut self, filter: i64, nonblock: bool, wake: &mut Vec<Wakeup>) -> Result<Step<Message>> {
        match self.select(filter) {
            Some(i) => {
                let msg = self.messages.remove(i);
                self.received += 1;
                self.admit_senders(wake);
                Ok(Step::Done(msg))
            }
            None if nonblock => Err(Error::WouldBlock),
            None => Ok(Step::Block),
        }
    }

    /// Queues a suspended sender with its message
    pub fn park_sender(&mut self, token: WaitToken, mut msg: Message, wake: &mut Vec<Wakeup>) {
        msg.seq = 0;
        self.senders.push_back((token, msg));
        self.admit_senders(wake);
    }

    /// Queues a suspended receiver
    pub fn park_receiver(&mut self, token: WaitToken, filter: i64) {
        self.receivers.push_back((token, filter));
    }

    /// Removes a cancelled waiter
    pub fn cancel(&mut self, token: WaitToken) -> bool {
        let before = self.receivers.len() + self.senders.len();
        self.receivers.retain(|(t, _)| *t != token);
        self.senders.retain(|(t, _)| *t != token);
        before != self.receivers.len() + self.senders.len()
    }

    /// Fails every waiter; used when the queue is destroyed
    pub fn fail_waiters(&mut self, wake: &mut Vec<Wakeup>) {
        let gone = || Err(Error::NotFound(format!("message queue {} destroyed", self.id)));
        for (token, _) in self.receivers.iter() {
            wake.push((*token, gone()));
        }
        for (token, _) in self.senders.iter() {
            wake.push((*token, gone()));
        }
        self.receivers.clear();
        self.senders.clear();
    }

    /// Snapshot
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            id: self.id,
            name: self.name.clone(),
            owner: self.owner,
            messages: self.messages.len(),
            bytes: self.messages.iter().map(|m| m.data.len()).sum(),
            max_messages: self.max_messages,
            max_message_size: self.max_message_size,
            waiting_senders: self.senders.len(),
            waiting_receivers: self.receivers.len(),
            sent: self.sent,
            received: self.received,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(mtype: i64, priority: u32, byte: u8) -> Message {
        Message::new(mtype, priority, alloc::vec![byte], 1, 0)
    }

    fn take(q: &mut MessageQueue, filter: i64) -> Message {
        let mut wake = Vec::new();
        match q.receive(filter, true, &mut wake).unwrap() {
            Step::Done(m) => m,
            Step::Block => panic!("queue empty"),
        }
    }

    #[test]
    fn test_priority_then_fifo_for_any_type() {
        let mut q = MessageQueue::new(1, 1, 0, 10, 64);
        let mut wake = Vec::new();
        for m in [msg(1, 1, b'a'), msg(2, 5, b'b'), msg(3, 5, b'c'), msg(1, 0, b'd')] {
            q.send(m, true, &mut wake).unwrap();
        }
        let order: Vec<u8> = (0..4).map(|_| take(&mut q, 0).data[0]).collect();
        assert_eq!(order, b"bcad".to_vec());
    }

    #[test]
    fn test_type_filters() {
        let mut q = MessageQueue::new(1, 1, 0, 10, 64);
        let mut wake = Vec::new();
        for m in [msg(5, 0, b'a'), msg(2, 0, b'b'), msg(3, 0, b'c'), msg(2, 0, b'd')] {
            q.send(m, true, &mut wake).unwrap();
        }
        assert_eq!(take(&mut q, 3).data, b"c".to_vec());
        assert_eq!(take(&mut q, -4).data, b"b".to_vec());
        assert_eq!(take(&mut q, -4).data, b"d".to_vec());
        assert_eq!(q.receive(-4, true, &mut wake), Err(Error::WouldBlock));
    }

    #[test]
    fn test_limits_and_parked_sender() {
        let mut q = MessageQueue::new(1, 1, 0, 1, 4);
        let mut wake = Vec::new();
        assert!(q.send(Message::new(1, 0, alloc::vec![0; 5], 1, 0), true, &mut wake).is_err());
        assert!(q.send(msg(0, 0, b'x'), true, &mut wake).is_err());
        q.send(msg(1, 0, b'a'), true, &mut wake).unwrap();
        assert_eq!(q.send(msg(1, 0, b'b'), false, &mut wake).unwrap(), Step::Block);
        q.park_sender(WaitToken(4), msg(1, 0, b'b'), &mut wake);
        assert!(wake.is_empty());
        assert_eq!(take(&mut q, 0).data, b"a".to_vec());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_send_wakes_matching_receiver() {
        let mut q = MessageQueue::new(1, 1, 0, 4, 64);
        let mut wake = Vec::new();
        q.park_receiver(WaitToken(1), 7);
        q.park_receiver(WaitToken(2), 0);
        q.send(msg(3, 0, b'z'), false, &mut wake).unwrap();
        assert_eq!(
            wake,
            alloc::vec![(WaitToken(2), Ok(WaitResult::Message { mtype: 3, data: b"z".to_vec() }))]
        );
        assert!(q.is_empty());
        q.fail_waiters(&mut wake);
        assert!(matches!(wake.last(), Some((WaitToken(1), Err(Error::NotFound(_))))));
    }
}
