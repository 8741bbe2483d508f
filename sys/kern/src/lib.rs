// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MAestro kernel.
//!
//! This is the architecture-independent portion of the per-tile kernel: one
//! instance of it runs on every processing element of the mesh, in M-mode.
//! Instances never share memory; they cooperate exclusively by exchanging
//! packets over Hermes (unicast) and BrLite (broadcast). Boot, CPU
//! register save/restore, and the scheduler's own time-slice math live
//! outside this crate and are consumed here through narrow HAL traits in
//! [`arch`].
//!
//! # Design principles
//!
//! 1. A single `&mut Kernel` is threaded through every handler; there is no
//!    other mutable global state. The kernel is never reentered, so this
//!    needs no synchronization.
//! 2. Suspension is a return value, not a yield: a syscall that cannot
//!    complete returns `KernelError::Retry(reason)` and leaves the TCB in a
//!    waiting state for the external scheduler to act on.
//! 3. Every allocation (a packet body, a pipe buffer) has one documented,
//!    reachable free path.

#![cfg_attr(not(test), no_std)]

pub mod log;

pub mod alloc;
pub mod app;
pub mod arch;
pub mod brlite;
pub mod dmni;
pub mod halt;
pub mod hermes;
pub mod isr;
pub mod kernel;
pub mod kpipe;
pub mod loctable;
pub mod messaging;
pub mod migration;
pub mod pending;
pub mod pipe;
pub mod rpc;
pub mod task;
pub mod time;
pub mod util;

/// Maximum size, in bytes, of a single message payload. Pipes are fixed
/// inline buffers of this size rather than heap allocations; see
/// `pipe::Pipe`.
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Flit size in bytes; DMNI transfer sizes must be multiples of this.
pub const FLIT_SIZE: usize = 4;

/// Maximum number of tasks resident on one tile at once.
pub const MAX_TASKS: usize = 16;

/// Maximum number of applications with a presence on this tile.
pub const MAX_APPS: usize = 8;

/// Maximum number of tasks tracked in one application's location table.
pub const MAX_TASKS_PER_APP: usize = 16;

/// Capacity of the pending-handshake FIFO.
pub const PENDING_CAPACITY: usize = 8;

/// Capacity of the kernel pipe (kpipe).
pub const KPIPE_CAPACITY: usize = 8;

/// Capacity of the source-tile migration table.
pub const MIGRATION_TABLE_CAPACITY: usize = 8;

/// Capacity of a single TCB's `msg_requests`/`data_avs` peer FIFOs.
pub const MAX_PEERS_PER_TASK: usize = 8;
