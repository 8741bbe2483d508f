// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! High-level user interface.
//!
//! Thin ergonomics over the raw `maestro_write`/`maestro_read` syscalls:
//! retrying on the one condition a caller can usefully retry (the BrLite
//! channel being busy on a broadcast send), and a couple of small
//! convenience wrappers tasks reach for constantly.

use crate::{
    maestro_broadcast_send, maestro_read, maestro_write, SyscallError, TaskId,
};

/// Writes `buf` to `receiver`, blocking until it is accepted.
///
/// This is just `maestro_write` with `sync` fixed to `true`: the common case
/// for application code, where a task wants the rendezvous handshake to
/// complete before it moves on. Use `maestro_write` directly for the
/// fire-and-forget buffered form.
pub fn send(receiver: TaskId, buf: &[u8]) -> Result<usize, SyscallError> {
    maestro_write(receiver, buf, true)
}

/// Reads from `producer` into `buf`, blocking until a message arrives.
pub fn recv(producer: TaskId, buf: &mut [u8]) -> Result<usize, SyscallError> {
    maestro_read(producer, buf, true)
}

/// Sends a management broadcast, spinning past `Busy` until the BrLite send
/// channel frees up. Every other error is returned immediately: `Busy` is
/// the only outcome a caller can usefully wait out, since it just means
/// another broadcast is mid-flight.
pub fn broadcast_send(service: u8, payload: u16) -> Result<(), SyscallError> {
    loop {
        match maestro_broadcast_send(service, payload) {
            Err(SyscallError::Busy) => continue,
            other => return other,
        }
    }
}
