// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pending-handshake FIFO.
//!
//! `DATA_AV` and `MESSAGE_REQUEST` packets normally get processed and
//! forwarded to the matching TCB's peer FIFO immediately. If the ISR wants
//! to reply (an ACK, or chaining into a delivery) and the DMNI send channel
//! is already busy with something else, the packet is parked here instead,
//! and retried on a later tick. Nothing else is ever parked here.

use abi::HandshakeBody;
use arrayvec::ArrayVec;

use crate::PENDING_CAPACITY;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum PendingKind {
    DataAv,
    MessageRequest,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PendingEntry {
    pub kind: PendingKind,
    pub body: HandshakeBody,
}

#[derive(Default)]
pub struct PendingFifo {
    entries: ArrayVec<PendingEntry, PENDING_CAPACITY>,
}

impl PendingFifo {
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

    /// Parks a deferred handshake. Returns `false` if the FIFO is full.
    pub fn push_back(&mut self, kind: PendingKind, body: HandshakeBody) -> bool {
        self.entries.try_push(PendingEntry { kind, body }).is_ok()
    }

    /// Pops the oldest deferred handshake, for retry on the next tick.
    pub fn pop_front(&mut self) -> Option<PendingEntry> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::TaskId;

    fn body() -> HandshakeBody {
        HandshakeBody {
            source: 0,
            receiver: TaskId::for_app_and_index(1, 0),
            sender: TaskId::KERNEL,
        }
    }

    #[test]
    fn fifo_order_is_preserved() {
        let mut p = PendingFifo::new();
        p.push_back(PendingKind::DataAv, body());
        p.push_back(PendingKind::MessageRequest, body());
        assert_eq!(p.pop_front().unwrap().kind, PendingKind::DataAv);
        assert_eq!(p.pop_front().unwrap().kind, PendingKind::MessageRequest);
        assert!(p.pop_front().is_none());
    }

    #[test]
    fn push_fails_past_capacity() {
        let mut p = PendingFifo::new();
        for _ in 0..PENDING_CAPACITY {
            assert!(p.push_back(PendingKind::DataAv, body()));
        }
        assert!(!p.push_back(PendingKind::DataAv, body()));
    }
}
