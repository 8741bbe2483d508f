// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel pipe: outbound messages the kernel itself originates (migration
//! notifications, allocation replies, control RPCs) encapsulated in the
//! same messaging API user tasks use, so a receiving task cannot tell a
//! kernel-authored message apart from a peer's.
//!
//! A fixed-capacity FIFO of entries, each keyed by the receiving task so a
//! later `kpipe_find` by that messaging handler can pick it back up.

use abi::{Peer, TaskId};
use arrayvec::ArrayVec;

use crate::KPIPE_CAPACITY;
use crate::MAX_MESSAGE_SIZE;

/// One outbound message the kernel is holding for delivery.
pub struct Entry {
    buf: [u8; MAX_MESSAGE_SIZE],
    len: usize,
    target: Peer,
}

impl Entry {
    pub fn buf(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn receiver(&self) -> TaskId {
        self.target.task
    }

    pub fn target(&self) -> Peer {
        self.target
    }
}

#[derive(Default)]
pub struct Kpipe {
    entries: ArrayVec<Entry, KPIPE_CAPACITY>,
}

impl Kpipe {
    pub fn new() -> Self {
        Self {
            entries: ArrayVec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Queues a message for `target`. Returns `false` if the FIFO is full,
    /// in which case the caller must not drop the message silently -- it
    /// should retry once a slot frees.
    pub fn add(&mut self, target: Peer, msg: &[u8]) -> bool {
        if msg.len() > MAX_MESSAGE_SIZE {
            return false;
        }
        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        buf[..msg.len()].copy_from_slice(msg);
        self.entries
            .try_push(Entry {
                buf,
                len: msg.len(),
                target,
            })
            .is_ok()
    }

    /// Finds (without removing) the first queued entry addressed to
    /// `receiver`.
    pub fn find(&self, receiver: TaskId) -> Option<&Entry> {
        self.entries.iter().find(|e| e.receiver() == receiver)
    }

    /// Removes the first queued entry addressed to `receiver`, once its
    /// messaging handshake has actually been delivered.
    pub fn remove(&mut self, receiver: TaskId) -> Option<Entry> {
        let pos = self.entries.iter().position(|e| e.receiver() == receiver)?;
        Some(self.entries.remove(pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use abi::TileAddr;

    fn tid(i: u8) -> TaskId {
        TaskId::for_app_and_index(1, i)
    }

    fn target(i: u8) -> Peer {
        Peer {
            task: tid(i),
            addr: TileAddr::new(0, 0),
        }
    }

    #[test]
    fn add_then_find_round_trips() {
        let mut k = Kpipe::new();
        assert!(k.add(target(0), b"hi"));
        let e = k.find(tid(0)).unwrap();
        assert_eq!(e.buf(), b"hi");
    }

    #[test]
    fn remove_drops_the_entry() {
        let mut k = Kpipe::new();
        k.add(target(0), b"hi");
        assert!(k.remove(tid(0)).is_some());
        assert!(k.find(tid(0)).is_none());
        assert!(k.is_empty());
    }

    #[test]
    fn add_fails_past_capacity() {
        let mut k = Kpipe::new();
        for i in 0..KPIPE_CAPACITY {
            assert!(k.add(target(i as u8), b"x"));
        }
        assert!(!k.add(target(250), b"x"));
    }
}
