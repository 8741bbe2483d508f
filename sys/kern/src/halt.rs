// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cooperative halt protocol.
//!
//! A monitor (or any task) asks a tile to shut down by broadcasting
//! `HALT_PE`; the tile only actually reports `PE_HALTED` once it is
//! quiescent -- no buffered kernel messages, no outstanding migrations, no
//! deferred packets. Until then the request just sits recorded in
//! [`Kernel::halter`], re-checked every time one of those three drains.

use abi::{KernelError, Peer};

use crate::arch::{BrliteHal, DmniHal, SchedulerHal};
use crate::kernel::Kernel;
use crate::messaging;

/// Whether a halt has been requested and is still awaiting quiescence.
pub fn pending<H: DmniHal, B: BrliteHal, S: SchedulerHal>(kernel: &Kernel<H, B, S>) -> bool {
    kernel.halter().is_some()
}

/// Records a halt request. Overwrites any earlier, unresolved requester --
/// only one halt can be in flight against a tile at a time.
pub fn set<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    requester: Peer,
) {
    kernel.set_halter(requester);
}

/// Abandons a pending halt request without reporting completion. Not
/// reached by the normal protocol; kept for a supervisor that wants to
/// cancel a halt it already knows will never become quiescent.
pub fn clear<H: DmniHal, B: BrliteHal, S: SchedulerHal>(kernel: &mut Kernel<H, B, S>) {
    kernel.clear_halter();
}

/// Reports `PE_HALTED` to the requester once the tile has gone quiescent.
/// A no-op if no halt is pending, or the tile still has work outstanding --
/// the caller is expected to call this again after every drain of
/// `kpipe`, the migration table, or the pending FIFO.
pub fn try_halt<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
) -> Result<(), KernelError> {
    let requester = match kernel.halter() {
        Some(r) => r,
        None => return Ok(()),
    };
    if !kernel.halt_ready() {
        return Ok(());
    }
    let addr = kernel.self_addr;
    messaging::post_kernel_message(kernel, requester, &addr.0.to_le_bytes())?;
    kernel.clear_halter();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::fake::{FakeBrlite, FakeDmni, FakeScheduler};
    use abi::{TaskId, TileAddr};

    fn kernel() -> Kernel<FakeDmni, FakeBrlite, FakeScheduler> {
        Kernel::new(
            TileAddr::new(0, 0),
            FakeDmni::default(),
            FakeBrlite::default(),
            FakeScheduler::default(),
        )
    }

    fn requester() -> Peer {
        Peer {
            task: TaskId::KERNEL,
            addr: TileAddr::new(7, 7),
        }
    }

    #[test]
    fn try_halt_without_request_is_noop() {
        let mut k = kernel();
        assert!(try_halt(&mut k).is_ok());
        assert!(!pending(&k));
    }

    #[test]
    fn try_halt_waits_for_quiescence() {
        let mut k = kernel();
        set(&mut k, requester());
        let task = TaskId::for_app_and_index(1, 0);
        k.migration_table_insert(task, TileAddr::new(2, 2));
        try_halt(&mut k).unwrap();
        assert!(pending(&k));
    }

    #[test]
    fn try_halt_reports_once_quiescent() {
        let mut k = kernel();
        set(&mut k, requester());
        try_halt(&mut k).unwrap();
        assert!(!pending(&k));
        assert!(!k.kpipe.is_empty());
    }

    #[test]
    fn clear_abandons_request() {
        let mut k = kernel();
        set(&mut k, requester());
        clear(&mut k);
        assert!(!pending(&k));
    }
}
