// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task location table: which tile a given task of an application currently
//! lives on.
//!
//! Every application has exactly one of these, shared by every task of that
//! application resident on this tile (see `app::Application`). Migration
//! updates one entry in place; it never needs to touch any other task's
//! entry.

use abi::{TaskId, TileAddr};
use arrayvec::ArrayVec;

use crate::MAX_TASKS_PER_APP;

#[derive(Copy, Clone, Debug, PartialEq)]
struct Entry {
    task: TaskId,
    tile: TileAddr,
}

/// Fixed-capacity `task_id -> tile_address` map for one application.
pub struct LocationTable {
    entries: ArrayVec<Entry, MAX_TASKS_PER_APP>,
}

impl LocationTable {
    pub const fn new() -> Self {
        Self {
            entries: ArrayVec::new_const(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn locate(&self, task: TaskId) -> Option<TileAddr> {
        self.entries
            .iter()
            .find(|e| e.task == task)
            .map(|e| e.tile)
    }

    /// Inserts a new task/tile pair, or overwrites the tile of an existing
    /// one (the `MIGRATION_TASK_LOCATION` step updates an entry this way).
    /// Returns `false` if the task is new and the table is full.
    pub fn set(&mut self, task: TaskId, tile: TileAddr) -> bool {
        if let Some(e) = self.entries.iter_mut().find(|e| e.task == task) {
            e.tile = tile;
            return true;
        }
        self.entries.try_push(Entry { task, tile }).is_ok()
    }

    /// Removes a task's entry, e.g. once it has exited or aborted.
    pub fn remove(&mut self, task: TaskId) -> Option<TileAddr> {
        let pos = self.entries.iter().position(|e| e.task == task)?;
        Some(self.entries.remove(pos).tile)
    }

    /// Iterates every `(task, tile)` pair in insertion order, as
    /// `MIGRATION_TASK_LOCATION` ships the whole table to a task's new home.
    pub fn iter(&self) -> impl Iterator<Item = (TaskId, TileAddr)> + '_ {
        self.entries.iter().map(|e| (e.task, e.tile))
    }
}

impl Default for LocationTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(app: u8, index: u8) -> TaskId {
        TaskId::for_app_and_index(app, index)
    }

    #[test]
    fn set_then_locate_round_trips() {
        let mut t = LocationTable::new();
        assert!(t.set(tid(1, 0), TileAddr::new(2, 3)));
        assert_eq!(t.locate(tid(1, 0)), Some(TileAddr::new(2, 3)));
    }

    #[test]
    fn set_on_existing_task_updates_in_place() {
        let mut t = LocationTable::new();
        t.set(tid(1, 0), TileAddr::new(0, 0));
        t.set(tid(1, 0), TileAddr::new(5, 5));
        assert_eq!(t.len(), 1);
        assert_eq!(t.locate(tid(1, 0)), Some(TileAddr::new(5, 5)));
    }

    #[test]
    fn remove_drops_entry() {
        let mut t = LocationTable::new();
        t.set(tid(1, 0), TileAddr::new(0, 0));
        assert_eq!(t.remove(tid(1, 0)), Some(TileAddr::new(0, 0)));
        assert_eq!(t.locate(tid(1, 0)), None);
    }

    #[test]
    fn set_fails_past_capacity() {
        let mut t = LocationTable::new();
        for i in 0..MAX_TASKS_PER_APP {
            assert!(t.set(tid(1, i as u8), TileAddr::new(0, 0)));
        }
        assert!(!t.set(tid(1, 200), TileAddr::new(0, 0)));
    }
}
