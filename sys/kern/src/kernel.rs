// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The aggregate kernel state.
//!
//! Every handler in this crate -- a syscall, an ISR, an RPC -- takes a
//! single `&mut Kernel` and nothing else. There is exactly one instance per
//! tile, it is never reentered, and it owns every piece of mutable state
//! the rest of the modules touch: the resident task table, the
//! applications with a presence here, the kernel pipe, the pending-
//! handshake FIFO, the migration table, and who (if anyone) is waiting for
//! this tile to halt.

use abi::{KernelError, Peer, TaskId, TileAddr};
use arrayvec::ArrayVec;

use crate::app::Application;
use crate::arch::{BrliteHal, DmniHal, SchedulerHal};
use crate::brlite::Brlite;
use crate::dmni::Dmni;
use crate::kpipe::Kpipe;
use crate::pending::PendingFifo;
use crate::task::Tcb;
use crate::{MAX_APPS, MAX_TASKS, MIGRATION_TABLE_CAPACITY};

/// One entry in the source-side migration table: a task that used to live
/// here now lives at `new_addr`.
#[derive(Copy, Clone, Debug)]
pub struct MigrationTableEntry {
    pub task: TaskId,
    pub new_addr: TileAddr,
}

pub struct Kernel<H, B, S> {
    pub self_addr: TileAddr,

    tasks: ArrayVec<Tcb, MAX_TASKS>,
    /// Indexed by the same `usize` every `Tcb::app` stores, so a slot's
    /// index can never change once assigned -- dropping an application
    /// tombstones its slot with `None` rather than compacting the vec,
    /// which would silently repoint every higher-indexed app's TCBs.
    apps: ArrayVec<Option<Application>, MAX_APPS>,

    pub kpipe: Kpipe,
    pub pending: PendingFifo,
    migration_table: ArrayVec<MigrationTableEntry, MIGRATION_TABLE_CAPACITY>,

    /// Set by an inbound `HALT_PE`; cleared once `PE_HALTED` is sent.
    halter: Option<Peer>,

    pub dmni: Dmni<H>,
    pub brlite: Brlite<B>,
    pub scheduler: S,
}

impl<H: DmniHal, B: BrliteHal, S: SchedulerHal> Kernel<H, B, S> {
    pub fn new(self_addr: TileAddr, dmni: H, brlite: B, scheduler: S) -> Self {
        Self {
            self_addr,
            tasks: ArrayVec::new(),
            apps: ArrayVec::new(),
            kpipe: Kpipe::new(),
            pending: PendingFifo::new(),
            migration_table: ArrayVec::new(),
            halter: None,
            dmni: Dmni::new(dmni),
            brlite: Brlite::new(brlite),
            scheduler,
        }
    }

    pub fn tasks(&self) -> &[Tcb] {
        &self.tasks
    }

    pub fn find_task_index(&self, id: TaskId) -> Option<usize> {
        self.tasks.iter().position(|t| t.id() == id)
    }

    pub fn task(&self, id: TaskId) -> Option<&Tcb> {
        self.find_task_index(id).map(|i| &self.tasks[i])
    }

    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut Tcb> {
        let i = self.find_task_index(id)?;
        Some(&mut self.tasks[i])
    }

    /// Splits the task table so two distinct tasks can be borrowed mutably
    /// at once, as same-tile messaging needs (producer and consumer).
    pub fn task_pair_mut(&mut self, a: TaskId, b: TaskId) -> Option<(&mut Tcb, &mut Tcb)> {
        let ia = self.find_task_index(a)?;
        let ib = self.find_task_index(b)?;
        if ia == ib {
            return None;
        }
        Some(crate::util::index2_distinct(&mut self.tasks, ia, ib))
    }

    pub fn insert_task(&mut self, tcb: Tcb) -> Result<(), KernelError> {
        self.tasks.try_push(tcb).map_err(|_| KernelError::NoMemory)
    }

    pub fn remove_task(&mut self, id: TaskId) -> Option<Tcb> {
        let i = self.find_task_index(id)?;
        Some(self.tasks.remove(i))
    }

    pub fn app(&self, index: usize) -> Option<&Application> {
        self.apps.get(index)?.as_ref()
    }

    pub fn app_mut(&mut self, index: usize) -> Option<&mut Application> {
        self.apps.get_mut(index)?.as_mut()
    }

    /// Finds `id`'s slot, reusing the first tombstoned (`None`) one before
    /// growing the vec, so a slot index handed out to a `Tcb::app` earlier
    /// is never reassigned to a different app while still referenced.
    pub fn find_or_insert_app(&mut self, id: u8) -> Result<usize, KernelError> {
        if let Some(i) = self
            .apps
            .iter()
            .position(|a| a.as_ref().map_or(false, |a| a.id() == id))
        {
            return Ok(i);
        }
        if let Some(i) = self.apps.iter().position(|a| a.is_none()) {
            self.apps[i] = Some(Application::new(id));
            return Ok(i);
        }
        self.apps
            .try_push(Some(Application::new(id)))
            .map_err(|_| KernelError::NoMemory)?;
        Ok(self.apps.len() - 1)
    }

    /// Drops an application once its refcount hits zero, freeing its
    /// location table. Called from `app_derefer` sites in `task`
    /// teardown, migration, and abort. Tombstones the slot rather than
    /// removing it, so every other app's `Tcb::app` index stays valid.
    pub fn drop_app_if_unreferenced(&mut self, index: usize) {
        if self.apps[index].as_ref().map_or(false, |a| a.refcount() == 0) {
            self.apps[index] = None;
        }
    }

    pub fn migration_table_is_empty(&self) -> bool {
        self.migration_table.is_empty()
    }

    pub fn migration_table_lookup(&self, task: TaskId) -> Option<TileAddr> {
        self.migration_table
            .iter()
            .find(|e| e.task == task)
            .map(|e| e.new_addr)
    }

    pub fn migration_table_insert(&mut self, task: TaskId, new_addr: TileAddr) -> bool {
        self.migration_table
            .try_push(MigrationTableEntry { task, new_addr })
            .is_ok()
    }

    /// Drops every migration-table entry for tasks of `app_id`, once the
    /// mapper has announced the whole application terminated.
    pub fn migration_table_clear_app(&mut self, app_id: u8) {
        self.migration_table
            .retain(|e| e.task.app() != app_id);
    }

    pub fn halter(&self) -> Option<Peer> {
        self.halter
    }

    pub fn set_halter(&mut self, halter: Peer) {
        self.halter = Some(halter);
    }

    pub fn clear_halter(&mut self) {
        self.halter = None;
    }

    /// `halt_try` preconditions, per the halt protocol: quiescent only once
    /// nothing is left to deliver or migrate.
    pub fn halt_ready(&self) -> bool {
        self.kpipe.is_empty() && self.migration_table_is_empty() && self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::fake::{FakeBrlite, FakeDmni, FakeScheduler};

    fn kernel() -> Kernel<FakeDmni, FakeBrlite, FakeScheduler> {
        Kernel::new(
            TileAddr::new(0, 0),
            FakeDmni::default(),
            FakeBrlite::default(),
            FakeScheduler::default(),
        )
    }

    #[test]
    fn dropping_a_lower_app_does_not_shift_a_higher_ones_index() {
        let mut k = kernel();
        let low = k.find_or_insert_app(1).unwrap();
        let high = k.find_or_insert_app(2).unwrap();
        assert_eq!(low, 0);
        assert_eq!(high, 1);

        k.app_mut(high).unwrap().app_refer();
        k.drop_app_if_unreferenced(low);

        assert!(k.app(low).is_none());
        assert_eq!(k.app(high).unwrap().id(), 2);
    }

    #[test]
    fn find_or_insert_app_reuses_a_tombstoned_slot() {
        let mut k = kernel();
        let first = k.find_or_insert_app(1).unwrap();
        k.drop_app_if_unreferenced(first);

        let second = k.find_or_insert_app(2).unwrap();
        assert_eq!(second, first);
        assert_eq!(k.app(second).unwrap().id(), 2);
    }
}
