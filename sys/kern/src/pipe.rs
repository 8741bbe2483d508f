// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task-space message buffers.
//!
//! A task has at most one inbound pipe (`pipe_in`, holding a message copied
//! in from the NoC and awaiting `read()`) and at most one outbound pipe
//! (`pipe_out`, holding a message awaiting delivery). Both are fixed,
//! inline `MAX_MESSAGE_SIZE`-byte buffers rather than heap allocations --
//! there is no heap to allocate from.

use abi::{KernelError, TaskId};

use crate::MAX_MESSAGE_SIZE;

/// An inbound message buffer: the receiving half of a rendezvous.
pub struct Pipe {
    buf: [u8; MAX_MESSAGE_SIZE],
    len: usize,
    peer: TaskId,
    read: bool,
}

impl Pipe {
    pub fn new(peer: TaskId) -> Self {
        Self {
            buf: [0; MAX_MESSAGE_SIZE],
            len: 0,
            peer,
            read: false,
        }
    }

    pub fn peer(&self) -> TaskId {
        self.peer
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the message has been delivered into this pipe and is ready
    /// to be drained (mirrors the original `ipipe_t::read` flag: set once
    /// reception completes, independent of whether anyone has drained it
    /// yet).
    pub fn is_read(&self) -> bool {
        self.read
    }

    /// Copies `src` into the pipe's buffer and marks it ready to drain.
    /// Used both for a local delivery (copying straight from the sender's
    /// user buffer) and for draining a `MESSAGE_DELIVERY` packet's payload
    /// off the NoC.
    pub fn fill(&mut self, src: &[u8]) -> Result<(), KernelError> {
        if src.len() > MAX_MESSAGE_SIZE {
            return Err(KernelError::InvalidArg);
        }
        self.buf[..src.len()].copy_from_slice(src);
        self.len = src.len();
        self.read = true;
        Ok(())
    }

    /// Copies up to `dst.len()` bytes out and returns the number of bytes
    /// actually copied (the lesser of the message size and the caller's
    /// buffer). The pipe is expected to be discarded by the caller right
    /// after -- this does not clear `read` itself.
    pub fn drain(&mut self, dst: &mut [u8]) -> usize {
        let n = self.len.min(dst.len());
        dst[..n].copy_from_slice(&self.buf[..n]);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid() -> TaskId {
        TaskId::for_app_and_index(1, 0)
    }

    #[test]
    fn fresh_pipe_is_not_read_until_filled() {
        let p = Pipe::new(tid());
        assert!(!p.is_read());
    }

    #[test]
    fn fill_then_drain_round_trips() {
        let mut p = Pipe::new(tid());
        p.fill(b"hello").unwrap();
        assert!(p.is_read());
        let mut dst = [0u8; 16];
        let n = p.drain(&mut dst);
        assert_eq!(&dst[..n], b"hello");
    }

    #[test]
    fn drain_truncates_to_destination_capacity() {
        let mut p = Pipe::new(tid());
        p.fill(b"hello world").unwrap();
        let mut dst = [0u8; 5];
        let n = p.drain(&mut dst);
        assert_eq!(n, 5);
        assert_eq!(&dst, b"hello");
    }

    #[test]
    fn fill_rejects_oversize_message() {
        let mut p = Pipe::new(tid());
        let big = std::vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert_eq!(p.fill(&big), Err(KernelError::InvalidArg));
    }
}
