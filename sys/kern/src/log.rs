// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel instrumentation.
//!
//! The kernel has no console of its own; events are recorded into a ring
//! buffer instead, the way the rest of this codebase instruments
//! interrupt-time code, and inspected later with a debugger or monitor task.

use abi::{Blocked, KernelError, Service, TaskId, TileAddr};

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Event {
    None,
    /// A packet of `service` arrived from `from`.
    PacketIn { service: u8, from: TileAddr },
    /// A packet of `service` was sent to `to`.
    PacketOut { service: u8, to: TileAddr },
    /// A handler returned an error while processing a packet or syscall.
    Error { where_: &'static str, err: KernelError },
    /// A task entered a waiting state.
    Blocked { task: TaskId, reason: Blocked },
    /// A task left a waiting state because the matching event arrived.
    Woken { task: TaskId },
    /// A packet was deferred into the pending FIFO because the DMNI send
    /// channel was busy.
    Deferred { service: u8 },
    /// A migration step completed for `task`.
    MigrationStep { task: TaskId, step: u8 },
    /// `halt_try` was attempted and did or didn't succeed.
    HaltAttempt { succeeded: bool },
}

ringbuf::ringbuf!(Event, 64, Event::None);

/// Records an event. Thin wrapper so call sites read like a log statement
/// instead of a macro invocation on a module-private static.
macro_rules! klog {
    ($ev:expr) => {
        ringbuf::ringbuf_entry!($ev)
    };
}

pub(crate) use klog;

#[allow(dead_code)]
pub(crate) fn event_service_in(service: u8, from: TileAddr) {
    klog!(Event::PacketIn { service, from });
}

#[allow(dead_code)]
pub(crate) fn event_service_out(service: u8, to: TileAddr) {
    klog!(Event::PacketOut { service, to });
}

#[allow(dead_code)]
pub(crate) fn event_error(where_: &'static str, err: KernelError) {
    klog!(Event::Error { where_, err });
}

/// Handy constant so call sites can name a service by its catalog entry
/// without importing `Service` everywhere.
pub(crate) const fn service_code(s: Service) -> u8 {
    s as u8
}
