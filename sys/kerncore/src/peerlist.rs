// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A fixed-capacity, insertion-ordered set of `abi::Peer`s, unique by task
//! id. Backs a TCB's `msg_requests` and `data_avs` lists: both are drained
//! FIFO and must never hold two entries for the same peer task.

use abi::{Peer, TaskId};
use arrayvec::ArrayVec;

/// Ordered, peer-unique, fixed-capacity queue.
#[derive(Clone, Debug)]
pub struct PeerFifo<const N: usize> {
    entries: ArrayVec<Peer, N>,
}

impl<const N: usize> Default for PeerFifo<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> PeerFifo<N> {
    pub const fn new() -> Self {
        Self {
            entries: ArrayVec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, task: TaskId) -> bool {
        self.entries.iter().any(|p| p.task == task)
    }

    /// Appends `peer`, unless a peer with the same task id is already
    /// present (the spec's "unique by peer_task" invariant) or the queue is
    /// full.
    ///
    /// Returns `true` if the peer was inserted.
    pub fn push_unique(&mut self, peer: Peer) -> bool {
        if self.contains(peer.task) {
            return false;
        }
        self.entries.try_push(peer).is_ok()
    }

    /// Pops the oldest entry, if any.
    pub fn pop_front(&mut self) -> Option<Peer> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0))
        }
    }

    /// Removes the entry for `task`, if present, preserving the order of
    /// the rest.
    pub fn remove(&mut self, task: TaskId) -> Option<Peer> {
        let idx = self.entries.iter().position(|p| p.task == task)?;
        Some(self.entries.remove(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::TileAddr;

    fn peer(app: u8, index: u8) -> Peer {
        Peer {
            task: TaskId::for_app_and_index(app, index),
            addr: TileAddr::new(1, 2),
        }
    }

    #[test]
    fn push_unique_rejects_duplicate_peer_task() {
        let mut list: PeerFifo<4> = PeerFifo::new();
        assert!(list.push_unique(peer(1, 1)));
        assert!(!list.push_unique(peer(1, 1)));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn pop_front_drains_in_insertion_order() {
        let mut list: PeerFifo<4> = PeerFifo::new();
        list.push_unique(peer(1, 1));
        list.push_unique(peer(1, 2));
        list.push_unique(peer(1, 3));

        assert_eq!(list.pop_front().unwrap().task, TaskId::for_app_and_index(1, 1));
        assert_eq!(list.pop_front().unwrap().task, TaskId::for_app_and_index(1, 2));
        assert_eq!(list.pop_front().unwrap().task, TaskId::for_app_and_index(1, 3));
        assert!(list.pop_front().is_none());
    }

    #[test]
    fn push_unique_fails_past_capacity() {
        let mut list: PeerFifo<2> = PeerFifo::new();
        assert!(list.push_unique(peer(1, 1)));
        assert!(list.push_unique(peer(1, 2)));
        assert!(!list.push_unique(peer(1, 3)));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn remove_preserves_remaining_order() {
        let mut list: PeerFifo<4> = PeerFifo::new();
        list.push_unique(peer(1, 1));
        list.push_unique(peer(1, 2));
        list.push_unique(peer(1, 3));

        let removed = list.remove(TaskId::for_app_and_index(1, 2));
        assert_eq!(removed.unwrap().task, TaskId::for_app_and_index(1, 2));
        assert_eq!(list.pop_front().unwrap().task, TaskId::for_app_and_index(1, 1));
        assert_eq!(list.pop_front().unwrap().task, TaskId::for_app_and_index(1, 3));
    }
}
