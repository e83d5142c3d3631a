//! Pipes
//!
//! A bounded byte ring with reference-counted ends. Waiting readers and
//! writers are served in arrival order. A writer that does not fit is
//! parked with the rest of its data and completes once every byte went in.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;

use akern_api::{Error, Nanoseconds, Pid, Result};

use super::Step;
use crate::wait::{WaitResult, WaitToken, Wakeup};

/// Which end of a pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipeEnd {
    Read,
    Write,
}

/// Result of a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeWrite {
    /// Everything the call will write went in
    Done(usize),
    /// `written` bytes went in; the caller must park with `rest`
    Partial { written: usize, rest: Vec<u8> },
}

#[derive(Debug)]
struct ParkedWriter {
    token: WaitToken,
    data: VecDeque<u8>,
    written: usize,
}

/// Snapshot of a pipe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeStats {
    pub id: u32,
    pub name: Option<String>,
    pub capacity: usize,
    pub buffered: usize,
    pub read_refs: u32,
    pub write_refs: u32,
    pub waiting_readers: usize,
    pub waiting_writers: usize,
    pub bytes_written: u64,
    pub bytes_read: u64,
}

/// One pipe
#[derive(Debug)]
pub struct Pipe {
    pub id: u32,
    pub name: Option<String>,
    pub owner: Pid,
    pub created_ns: Nanoseconds,
    buffer: VecDeque<u8>,
    capacity: usize,
    read_refs: u32,
    write_refs: u32,
    readers: VecDeque<(WaitToken, usize)>,
    writers: VecDeque<ParkedWriter>,
    bytes_written: u64,
    bytes_read: u64,
}

impl Pipe {
    /// Creates a pipe with both ends open once
    pub fn new(id: u32, capacity: usize, owner: Pid, now: Nanoseconds) -> Self {
        Self {
            id,
            name: None,
            owner,
            created_ns: now,
            buffer: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
            read_refs: 1,
            write_refs: 1,
            readers: VecDeque::new(),
            writers: VecDeque::new(),
            bytes_written: 0,
            bytes_read: 0,
        }
    }

    fn space(&self) -> usize {
        self.capacity - self.buffer.len()
    }

    /// Bytes buffered
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Whether both ends are closed
    pub fn is_closed(&self) -> bool {
        self.read_refs == 0 && self.write_refs == 0
    }

    /// Takes another reference on one end
    pub fn add_ref(&mut self, end: PipeEnd) {
        match end {
            PipeEnd::Read => self.read_refs += 1,
            PipeEnd::Write => self.write_refs += 1,
        }
    }

    /// Hands buffered bytes to waiting readers
    fn feed_readers(&mut self, wake: &mut Vec<Wakeup>) {
        while !self.buffer.is_empty() {
            let Some((token, max)) = self.readers.pop_front() else {
                break;
            };
            let data = self.take(max);
            wake.push((token, Ok(WaitResult::Bytes(data))));
        }
    }

    /// Moves parked writers' bytes into free space
    fn drain_writers(&mut self, wake: &mut Vec<Wakeup>) {
        while self.space() > 0 {
            let Some(writer) = self.writers.front_mut() else {
                break;
            };
            let n = self.capacity - self.buffer.len();
            let n = n.min(writer.data.len());
            self.buffer.extend(writer.data.drain(..n));
            writer.written += n;
            self.bytes_written += n as u64;
            if writer.data.is_empty() {
                if let Some(done) = self.writers.pop_front() {
                    wake.push((done.token, Ok(WaitResult::Written(done.written))));
                }
            }
        }
    }

    /// Moves data until neither side can progress, then settles closed ends
    fn pump(&mut self, wake: &mut Vec<Wakeup>) {
        loop {
            let before = (self.buffer.len(), self.readers.len(), self.writers.len());
            self.feed_readers(wake);
            self.drain_writers(wake);
            if before == (self.buffer.len(), self.readers.len(), self.writers.len()) {
                break;
            }
        }
        if self.write_refs == 0 && self.buffer.is_empty() {
            for (token, _) in self.readers.drain(..) {
                wake.push((token, Ok(WaitResult::Bytes(Vec::new()))));
            }
        }
        if self.read_refs == 0 {
            for writer in self.writers.drain(..) {
                wake.push((writer.token, Err(Error::BrokenPipe)));
            }
        }
    }

    fn take(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.buffer.len());
        self.bytes_read += n as u64;
        self.buffer.drain(..n).collect()
    }

    /// Writes as much of `data` as fits
    pub fn write(&mut self, data: &[u8], nonblock: bool, wake: &mut Vec<Wakeup>) -> Result<PipeWrite> {
        if self.read_refs == 0 {
            return Err(Error::BrokenPipe);
        }
        if data.is_empty() {
            return Ok(PipeWrite::Done(0));
        }
        let mut offset = 0;
        if self.writers.is_empty() {
            loop {
                let n = self.space().min(data.len() - offset);
                self.buffer.extend(&data[offset..offset + n]);
                self.bytes_written += n as u64;
                offset += n;
                let waiting = self.readers.len();
                self.feed_readers(wake);
                if offset == data.len() || (n == 0 && waiting == self.readers.len()) {
                    break;
                }
            }
        }
        if offset == data.len() {
            return Ok(PipeWrite::Done(offset));
        }
        if nonblock {
            return if offset == 0 {
                Err(Error::WouldBlock)
            } else {
                Ok(PipeWrite::Done(offset))
            };
        }
        Ok(PipeWrite::Partial {
            written: offset,
            rest: data[offset..].to_vec(),
        })
    }

    /// Reads up to `max` bytes; an empty result with the write end closed is end of file
    pub fn read(&mut self, max: usize, nonblock: bool, wake: &mut Vec<Wakeup>) -> Result<Step<Vec<u8>>> {
        if max == 0 {
            return Ok(Step::Done(Vec::new()));
        }
        if !self.buffer.is_empty() {
            let data = self.take(max);
            self.pump(wake);
            return Ok(Step::Done(data));
        }
        if self.write_refs == 0 {
            return Ok(Step::Done(Vec::new()));
        }
        if nonblock {
            return Err(Error::WouldBlock);
        }
        Ok(Step::Block)
    }

    /// Queues a suspended reader
    pub fn park_reader(&mut self, token: WaitToken, max: usize, wake: &mut Vec<Wakeup>) {
        self.readers.push_back((token, max));
        self.pump(wake);
    }

    /// Queues a suspended writer with the bytes it still has to write
    pub fn park_writer(&mut self, token: WaitToken, rest: Vec<u8>, written: usize, wake: &mut Vec<Wakeup>) {
        self.writers.push_back(ParkedWriter {
            token,
            data: rest.into(),
            written,
        });
        self.pump(wake);
    }

    /// Drops one reference on an end
    pub fn close(&mut self, end: PipeEnd, wake: &mut Vec<Wakeup>) -> Result<()> {
        let refs = match end {
            PipeEnd::Read => &mut self.read_refs,
            PipeEnd::Write => &mut self.write_refs,
        };
        if *refs == 0 {
            return Err(Error::InvariantViolation(alloc::format!(
                "pipe {} {:?} end closed more often than opened",
                self.id, end
            )));
        }
        *refs -= 1;
        self.pump(wake);
        Ok(())
    }

    /// Removes a waiter that was cancelled
    pub fn cancel(&mut self, token: WaitToken) -> bool {
        let before = self.readers.len() + self.writers.len();
        self.readers.retain(|(t, _)| *t != token);
        self.writers.retain(|w| w.token != token);
        before != self.readers.len() + self.writers.len()
    }

    /// Snapshot
    pub fn stats(&self) -> PipeStats {
        PipeStats {
            id: self.id,
            name: self.name.clone(),
            capacity: self.capacity,
            buffered: self.buffer.len(),
            read_refs: self.read_refs,
            write_refs: self.write_refs,
            waiting_readers: self.readers.len(),
            waiting_writers: self.writers.len(),
            bytes_written: self.bytes_written,
            bytes_read: self.bytes_read,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut pipe = Pipe::new(1, 16, 1, 0);
        let mut wake = Vec::new();
        assert_eq!(pipe.write(&[1, 2, 3, 4, 5], false, &mut wake).unwrap(), PipeWrite::Done(5));
        assert_eq!(pipe.read(5, false, &mut wake).unwrap(), Step::Done(alloc::vec![1, 2, 3, 4, 5]));
        assert!(pipe.is_empty());
        assert!(wake.is_empty());
    }

    #[test]
    fn test_blocked_writer_completes_as_space_frees() {
        let mut pipe = Pipe::new(1, 4, 1, 0);
        let mut wake = Vec::new();
        let PipeWrite::Partial { written, rest } = pipe.write(b"abcdef", false, &mut wake).unwrap() else {
            panic!("expected a partial write");
        };
        assert_eq!(written, 4);
        pipe.park_writer(WaitToken(7), rest, written, &mut wake);
        assert!(wake.is_empty());

        assert_eq!(pipe.read(3, false, &mut wake).unwrap(), Step::Done(b"abc".to_vec()));
        assert_eq!(wake, alloc::vec![(WaitToken(7), Ok(WaitResult::Written(6)))]);
        assert_eq!(pipe.len(), 3);
    }

    #[test]
    fn test_waiting_reader_gets_eof() {
        let mut pipe = Pipe::new(1, 4, 1, 0);
        let mut wake = Vec::new();
        assert_eq!(pipe.read(4, false, &mut wake).unwrap(), Step::Block);
        assert_eq!(pipe.read(4, true, &mut wake), Err(Error::WouldBlock));
        pipe.park_reader(WaitToken(3), 4, &mut wake);
        pipe.close(PipeEnd::Write, &mut wake).unwrap();
        assert_eq!(wake, alloc::vec![(WaitToken(3), Ok(WaitResult::Bytes(Vec::new())))]);
    }

    #[test]
    fn test_closed_reader_breaks_pipe() {
        let mut pipe = Pipe::new(1, 2, 1, 0);
        let mut wake = Vec::new();
        let PipeWrite::Partial { written, rest } = pipe.write(b"xyz", false, &mut wake).unwrap() else {
            panic!("expected a partial write");
        };
        pipe.park_writer(WaitToken(2), rest, written, &mut wake);
        pipe.close(PipeEnd::Read, &mut wake).unwrap();
        assert_eq!(wake, alloc::vec![(WaitToken(2), Err(Error::BrokenPipe))]);
        assert_eq!(pipe.write(b"a", false, &mut wake), Err(Error::BrokenPipe));
    }
}
