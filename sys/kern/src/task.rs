// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The task control block.
//!
//! One `Tcb` exists per task resident on this tile. Unlike a general-purpose
//! kernel's task struct, there is no parent/child hierarchy and no page
//! table here -- a task's only kernel-visible state beyond its registers is
//! what the messaging, migration, and halt protocols need: who it's talking
//! to, what it owes a reply to, and where it would like to go.

use abi::{Peer, SchedState, TaskId, TileAddr};
use kerncore::peerlist::PeerFifo;

use crate::pipe::Pipe;
use crate::MAX_PEERS_PER_TASK;

/// Everything the kernel tracks about one resident task.
pub struct Tcb {
    id: TaskId,

    text_size: u32,
    data_size: u32,
    bss_size: u32,
    heap_end: u32,

    /// Saved machine state; restored verbatim on a context switch back to
    /// this task, and shipped verbatim as `MIGRATION_TCB`'s payload.
    save: crate::arch::SavedState,

    /// Offset of this task's page in tile-local memory.
    page_offset: u32,

    /// The task (and its tile) that allocated this one, which is the
    /// default recipient of lifecycle notifications (`TASK_TERMINATED`,
    /// `TASK_ABORTED`).
    mapper: Peer,

    /// `DATA_AV`s received but not yet matched to a `read()`.
    data_avs: PeerFifo<MAX_PEERS_PER_TASK>,
    /// `MESSAGE_REQUEST`s received but not yet matched to a `write()`.
    msg_requests: PeerFifo<MAX_PEERS_PER_TASK>,

    /// Inbound message awaiting `read()`.
    pipe_in: Option<Pipe>,
    /// Outbound message awaiting delivery. A task cannot be freed or
    /// migrated while this is `Some`.
    pipe_out: Option<Pipe>,

    /// Destination tile of a migration this task has requested, if any.
    proc_to_migrate: Option<TileAddr>,

    /// Set once the task has called its exit syscall; the TCB is kept
    /// around only until its outstanding messaging obligations drain.
    called_exit: bool,

    sched_state: SchedState,

    /// Index into the tile's application table.
    app: usize,
}

impl Tcb {
    pub fn new(id: TaskId, app: usize, mapper: Peer, page_offset: u32) -> Self {
        Self {
            id,
            text_size: 0,
            data_size: 0,
            bss_size: 0,
            heap_end: 0,
            save: crate::arch::SavedState::default(),
            page_offset,
            mapper,
            data_avs: PeerFifo::new(),
            msg_requests: PeerFifo::new(),
            pipe_in: None,
            pipe_out: None,
            proc_to_migrate: None,
            called_exit: false,
            sched_state: SchedState::Runnable,
            app,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn app(&self) -> usize {
        self.app
    }

    pub fn mapper(&self) -> Peer {
        self.mapper
    }

    pub fn page_offset(&self) -> u32 {
        self.page_offset
    }

    pub fn set_sizes(&mut self, text_size: u32, data_size: u32, bss_size: u32, heap_end: u32) {
        self.text_size = text_size;
        self.data_size = data_size;
        self.bss_size = bss_size;
        self.heap_end = heap_end;
    }

    pub fn text_size(&self) -> u32 {
        self.text_size
    }

    pub fn data_size(&self) -> u32 {
        self.data_size
    }

    pub fn bss_size(&self) -> u32 {
        self.bss_size
    }

    pub fn heap_end(&self) -> u32 {
        self.heap_end
    }

    pub fn save(&self) -> &crate::arch::SavedState {
        &self.save
    }

    pub fn save_mut(&mut self) -> &mut crate::arch::SavedState {
        &mut self.save
    }

    pub fn sched_state(&self) -> SchedState {
        self.sched_state
    }

    pub fn set_sched_state(&mut self, s: SchedState) {
        self.sched_state = s;
    }

    pub fn called_exit(&self) -> bool {
        self.called_exit
    }

    pub fn set_called_exit(&mut self) {
        self.called_exit = true;
    }

    pub fn migration_target(&self) -> Option<TileAddr> {
        self.proc_to_migrate
    }

    pub fn request_migration(&mut self, target: TileAddr) {
        self.proc_to_migrate = Some(target);
    }

    pub fn clear_migration_request(&mut self) {
        self.proc_to_migrate = None;
    }

    /// Records an arrived `DATA_AV` from `peer`. Returns `false` if `peer`
    /// already has one pending (double-request) or the FIFO is full.
    pub fn push_data_av(&mut self, peer: Peer) -> bool {
        self.data_avs.push_unique(peer)
    }

    /// Records an arrived `MESSAGE_REQUEST` from `peer`.
    pub fn push_msg_request(&mut self, peer: Peer) -> bool {
        self.msg_requests.push_unique(peer)
    }

    pub fn data_avs(&self) -> &PeerFifo<MAX_PEERS_PER_TASK> {
        &self.data_avs
    }

    pub fn msg_requests(&self) -> &PeerFifo<MAX_PEERS_PER_TASK> {
        &self.msg_requests
    }

    pub fn data_avs_mut(&mut self) -> &mut PeerFifo<MAX_PEERS_PER_TASK> {
        &mut self.data_avs
    }

    pub fn msg_requests_mut(&mut self) -> &mut PeerFifo<MAX_PEERS_PER_TASK> {
        &mut self.msg_requests
    }

    pub fn pipe_in(&self) -> Option<&Pipe> {
        self.pipe_in.as_ref()
    }

    pub fn set_pipe_in(&mut self, pipe: Pipe) {
        self.pipe_in = Some(pipe);
    }

    pub fn take_pipe_in(&mut self) -> Option<Pipe> {
        self.pipe_in.take()
    }

    pub fn pipe_out(&self) -> Option<&Pipe> {
        self.pipe_out.as_ref()
    }

    pub fn set_pipe_out(&mut self, pipe: Pipe) {
        self.pipe_out = Some(pipe);
    }

    pub fn take_pipe_out(&mut self) -> Option<Pipe> {
        self.pipe_out.take()
    }

    /// A task with a buffered outbound message cannot be freed: the
    /// message would be lost with no consumer ever told.
    pub fn can_be_freed(&self) -> bool {
        self.pipe_out.is_none()
    }

    /// Migration may not start while this task is waiting for a
    /// `MESSAGE_DELIVERY` -- the in-flight handshake names this tile as the
    /// deliverer, and moving mid-handshake would strand it.
    pub fn can_migrate(&self) -> bool {
        self.sched_state != SchedState::WaitingMessageDelivery
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(app: u8, index: u8) -> Peer {
        Peer {
            task: TaskId::for_app_and_index(app, index),
            addr: TileAddr::new(0, 0),
        }
    }

    fn tcb() -> Tcb {
        Tcb::new(TaskId::for_app_and_index(1, 0), 0, peer(0, 0), 0)
    }

    #[test]
    fn fresh_tcb_can_be_freed_and_migrated() {
        let t = tcb();
        assert!(t.can_be_freed());
        assert!(t.can_migrate());
    }

    #[test]
    fn buffered_pipe_out_blocks_freeing() {
        let mut t = tcb();
        t.set_pipe_out(Pipe::new(peer(2, 0).task));
        assert!(!t.can_be_freed());
    }

    #[test]
    fn waiting_delivery_blocks_migration() {
        let mut t = tcb();
        t.set_sched_state(SchedState::WaitingMessageDelivery);
        assert!(!t.can_migrate());
    }

    #[test]
    fn data_av_rejects_duplicate_peer() {
        let mut t = tcb();
        assert!(t.push_data_av(peer(2, 0)));
        assert!(!t.push_data_av(peer(2, 0)));
    }
}
