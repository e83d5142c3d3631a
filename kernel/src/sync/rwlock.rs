//! Simulated reader-writer locks

use alloc::collections::{BTreeMap, VecDeque};
use alloc::format;
use alloc::vec::Vec;

use akern_api::{Error, Result, Tid};

use crate::ipc::Step;
use crate::wait::{WaitResult, WaitToken, Wakeup};

/// Access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RwMode {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RwLockStats {
    pub id: u32,
    pub readers: u32,
    pub writer: Option<Tid>,
    pub waiting_readers: usize,
    pub waiting_writers: usize,
    pub read_acquisitions: u64,
    pub write_acquisitions: u64,
    pub contention_count: u64,
    pub prefer_writers: bool,
}

#[derive(Debug)]
pub struct SimRwLock {
    pub id: u32,
    pub prefer_writers: bool,
    /// Read holds per thread
    readers: BTreeMap<Tid, u32>,
    writer: Option<Tid>,
    waiters: VecDeque<(WaitToken, Tid, RwMode)>,
    read_acquisitions: u64,
    write_acquisitions: u64,
    contention_count: u64,
}

impl SimRwLock {
    pub fn new(id: u32, prefer_writers: bool) -> Self {
        Self {
            id,
            prefer_writers,
            readers: BTreeMap::new(),
            writer: None,
            waiters: VecDeque::new(),
            read_acquisitions: 0,
            write_acquisitions: 0,
            contention_count: 0,
        }
    }

    pub fn reader_count(&self) -> u32 {
        self.readers.values().sum()
    }

    pub fn writer(&self) -> Option<Tid> {
        self.writer
    }

    pub fn is_held(&self) -> bool {
        self.writer.is_some() || !self.readers.is_empty()
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }

    fn writer_waiting(&self) -> bool {
        self.waiters.iter().any(|(_, _, m)| *m == RwMode::Write)
    }

    fn grant(&mut self, tid: Tid, mode: RwMode) {
        match mode {
            RwMode::Read => {
                *self.readers.entry(tid).or_insert(0) += 1;
                self.read_acquisitions += 1;
            }
            RwMode::Write => {
                self.writer = Some(tid);
                self.write_acquisitions += 1;
            }
        }
    }

    fn can_grant(&self, tid: Tid, mode: RwMode) -> Result<bool> {
        if self.writer == Some(tid) {
            return Err(Error::InvalidArgument(format!(
                "deadlock: tid {} holds rwlock {} for writing",
                tid, self.id
            )));
        }
        match mode {
            RwMode::Read => Ok(self.writer.is_none() && !(self.prefer_writers && self.writer_waiting())),
            RwMode::Write => {
                if self.readers.contains_key(&tid) {
                    return Err(Error::InvalidArgument(format!(
                        "deadlock: tid {} holds rwlock {} for reading",
                        tid, self.id
                    )));
                }
                Ok(self.writer.is_none() && self.readers.is_empty())
            }
        }
    }

    pub fn lock(&mut self, tid: Tid, mode: RwMode) -> Result<Step<()>> {
        if self.can_grant(tid, mode)? {
            self.grant(tid, mode);
            Ok(Step::Done(()))
        } else {
            self.contention_count += 1;
            Ok(Step::Block)
        }
    }

    pub fn try_lock(&mut self, tid: Tid, mode: RwMode) -> Result<()> {
        match self.lock(tid, mode)? {
            Step::Done(()) => Ok(()),
            Step::Block => Err(Error::WouldBlock),
        }
    }

    pub fn park(&mut self, token: WaitToken, tid: Tid, mode: RwMode) {
        self.waiters.push_back((token, tid, mode));
    }

    /// Admits queued waiters in order
    ///
    /// A queued writer stops later readers when writers are preferred;
    /// otherwise readers behind it may pass.
    fn admit(&mut self, wake: &mut Vec<Wakeup>) {
        let mut i = 0;
        while i < self.waiters.len() {
            let (token, tid, mode) = self.waiters[i];
            let free = match mode {
                RwMode::Read => self.writer.is_none(),
                RwMode::Write => self.writer.is_none() && self.readers.is_empty(),
            };
            if free {
                self.waiters.remove(i);
                self.grant(tid, mode);
                wake.push((token, Ok(WaitResult::Acquired)));
                if mode == RwMode::Write {
                    break;
                }
                continue;
            }
            if mode == RwMode::Write && self.prefer_writers {
                break;
            }
            i += 1;
        }
    }

    /// Releases one hold of `tid`
    pub fn unlock(&mut self, tid: Tid, wake: &mut Vec<Wakeup>) -> Result<()> {
        if self.writer == Some(tid) {
            self.writer = None;
        } else if let Some(count) = self.readers.get_mut(&tid) {
            *count -= 1;
            if *count == 0 {
                self.readers.remove(&tid);
            }
        } else {
            return Err(Error::PermissionDenied(format!(
                "tid {} does not hold rwlock {}",
                tid, self.id
            )));
        }
        self.admit(wake);
        Ok(())
    }

    /// Drops every hold of an exited thread
    pub fn holder_exited(&mut self, tid: Tid, wake: &mut Vec<Wakeup>) -> bool {
        let held = self.writer == Some(tid) || self.readers.contains_key(&tid);
        if held {
            if self.writer == Some(tid) {
                self.writer = None;
            }
            self.readers.remove(&tid);
            self.admit(wake);
        }
        held
    }

    pub fn cancel(&mut self, token: WaitToken, wake: &mut Vec<Wakeup>) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|(t, _, _)| *t != token);
        let removed = before != self.waiters.len();
        if removed {
            // a departed writer may have been holding back readers
            self.admit(wake);
        }
        removed
    }

    pub fn stats(&self) -> RwLockStats {
        RwLockStats {
            id: self.id,
            readers: self.reader_count(),
            writer: self.writer,
            waiting_readers: self.waiters.iter().filter(|w| w.2 == RwMode::Read).count(),
            waiting_writers: self.waiters.iter().filter(|w| w.2 == RwMode::Write).count(),
            read_acquisitions: self.read_acquisitions,
            write_acquisitions: self.write_acquisitions,
            contention_count: self.contention_count,
            prefer_writers: self.prefer_writers,
        }
    }
}
