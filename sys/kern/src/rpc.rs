// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control-plane RPCs: the Hermes-side `TASK_RELEASE`/`ABORT_TASK`/
//! `TASK_MIGRATION` handlers and the BrLite broadcast dispatcher.
//!
//! Unlike the messaging/allocation/migration packet handlers, these carry
//! no variable-length payload of their own beyond what their body already
//! states (`TASK_RELEASE` excepted, which drains a location-table payload
//! the same shape `MIGRATION_TASK_LOCATION` uses).

use abi::{
    AbortTaskBody, Blocked, HermesHeader, KernelError, Peer, SchedState, Service, TaskId,
    TaskMigrationBody, TaskReleaseBody, TileAddr,
};
use zerocopy::{AsBytes, FromBytes};

use crate::arch::{BrliteHal, DmniHal, SchedulerHal};
use crate::halt;
use crate::kernel::Kernel;
use crate::migration;
use crate::{FLIT_SIZE, MAX_TASKS_PER_APP};

const fn flit_round(size: usize) -> usize {
    (size + FLIT_SIZE - 1) / FLIT_SIZE * FLIT_SIZE
}

/// A just-allocated task starts `Stopped`; the mapper's `TASK_RELEASE`
/// carries the app's initial location table and is what actually lets it
/// run.
pub fn recv_task_release<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    body: TaskReleaseBody,
) -> Result<(), KernelError> {
    let len = body.task_count as usize * 4;
    let mut raw = [0u8; MAX_TASKS_PER_APP * 4];
    if len > raw.len() {
        return Err(KernelError::InvalidArg);
    }
    kernel.dmni.recv(&mut raw[..len])?;

    let app_index = kernel.task(body.task).ok_or(KernelError::NotFound)?.app();
    let app = kernel.app_mut(app_index).unwrap();
    if app.loc_table().is_empty() {
        for i in 0..body.task_count as usize {
            let peer = Peer::read_from(&raw[i * 4..i * 4 + 4]).ok_or(KernelError::BadMessage)?;
            app.loc_table_mut().set(peer.task, peer.addr);
        }
    }

    let tcb = kernel.task_mut(body.task).ok_or(KernelError::NotFound)?;
    tcb.set_sched_state(SchedState::Runnable);
    kernel.scheduler.mark_runnable(body.task);
    Ok(())
}

/// Tears the task down if it is still resident here; otherwise forwards
/// the abort to wherever it migrated to, via the source-side migration
/// table. A task present on neither this tile nor its migration table was
/// already aborted or never lived here -- not an error.
pub fn recv_abort_task<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    body: AbortTaskBody,
) -> Result<(), KernelError> {
    if let Some(tcb) = kernel.task(body.task) {
        let app_index = tcb.app();
        kernel.remove_task(body.task);
        if kernel
            .app_mut(app_index)
            .map(|a| a.app_derefer())
            .unwrap_or(false)
        {
            kernel.drop_app_if_unreferenced(app_index);
        }
        return Ok(());
    }
    if let Some(target) = kernel.migration_table_lookup(body.task) {
        return send_abort_task(kernel, target, body.task);
    }
    Ok(())
}

fn send_abort_task<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    target: TileAddr,
    task: TaskId,
) -> Result<(), KernelError> {
    if kernel.dmni.send_busy() {
        return Err(KernelError::Retry(Blocked::DmniBusy));
    }
    let header = HermesHeader {
        address: target.0,
        service: Service::AbortTask as u8,
        flags: 0,
    };
    let body = AbortTaskBody { task };
    const RAW_LEN: usize = core::mem::size_of::<HermesHeader>() + core::mem::size_of::<AbortTaskBody>();
    let mut pkt = [0u8; flit_round(RAW_LEN)];
    pkt[..4].copy_from_slice(header.as_bytes());
    pkt[4..RAW_LEN].copy_from_slice(body.as_bytes());
    kernel.dmni.send(target, &pkt, None)
}

/// Starts the migration protocol's first step (`send_text`) and, once that
/// completes, hands off to [`migration::migrate`] for the rest. A task
/// that isn't resident, or can't migrate right now (mid `MESSAGE_DELIVERY`
/// handshake), is silently ignored -- the mapper will retry.
pub fn recv_task_migration<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    body: TaskMigrationBody,
    text: &[u8],
    data_bss_heap: &[u8],
    stack: &[u8],
) -> Result<(), KernelError> {
    let tcb = match kernel.task(body.task) {
        Some(t) => t,
        None => return Ok(()),
    };
    if !tcb.can_migrate() {
        return Ok(());
    }
    let mapper = tcb.mapper();
    migration::send_text(kernel, body.task, body.target_addr, mapper, text)?;
    migration::migrate(kernel, body.task, body.target_addr, data_bss_heap, stack)
}

/// Handles one decoded BrLite broadcast. `AnnounceMonitor`/
/// `ReleasePeripheral` concern board-level peripheral ownership, which sits
/// outside this kernel and is acknowledged with a no-op.
pub fn dispatch_broadcast<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    service: Service,
    src: TileAddr,
    payload: u16,
) -> Result<(), KernelError> {
    match service {
        Service::AnnounceMonitor | Service::ReleasePeripheral => Ok(()),
        Service::AppTerminated => {
            kernel.migration_table_clear_app(payload as u8);
            if halt::pending(kernel) {
                halt::try_halt(kernel)?;
            }
            Ok(())
        }
        Service::HaltPe => {
            halt::set(
                kernel,
                Peer {
                    task: TaskId(payload),
                    addr: src,
                },
            );
            halt::try_halt(kernel)
        }
        _ => Err(KernelError::BadMessage),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::fake::{FakeBrlite, FakeDmni, FakeScheduler};
    use crate::task::Tcb;

    fn kernel() -> Kernel<FakeDmni, FakeBrlite, FakeScheduler> {
        Kernel::new(
            TileAddr::new(0, 0),
            FakeDmni::default(),
            FakeBrlite::default(),
            FakeScheduler::default(),
        )
    }

    fn mapper() -> Peer {
        Peer {
            task: TaskId::KERNEL,
            addr: TileAddr::new(9, 9),
        }
    }

    #[test]
    fn task_release_marks_runnable() {
        let mut k = kernel();
        let task = TaskId::for_app_and_index(1, 0);
        k.insert_task(Tcb::new(task, 0, mapper(), 0)).unwrap();
        k.find_or_insert_app(1).unwrap();
        recv_task_release(&mut k, TaskReleaseBody { task, task_count: 0 }).unwrap();
        assert_eq!(
            k.task(task).unwrap().sched_state(),
            abi::SchedState::Runnable
        );
    }

    #[test]
    fn abort_task_removes_resident_tcb() {
        let mut k = kernel();
        let task = TaskId::for_app_and_index(1, 0);
        k.insert_task(Tcb::new(task, 0, mapper(), 0)).unwrap();
        k.app_mut(k.find_or_insert_app(1).unwrap()).unwrap().app_refer();
        recv_abort_task(&mut k, AbortTaskBody { task }).unwrap();
        assert!(k.task(task).is_none());
    }

    #[test]
    fn abort_task_forwards_to_migration_target() {
        let mut k = kernel();
        let task = TaskId::for_app_and_index(1, 0);
        let target = TileAddr::new(3, 3);
        k.migration_table_insert(task, target);
        recv_abort_task(&mut k, AbortTaskBody { task }).unwrap();
        let sent = k.dmni.hal_mut().last_send.clone().unwrap();
        assert_eq!(sent.0, target);
    }

    #[test]
    fn abort_task_unknown_everywhere_is_ok() {
        let mut k = kernel();
        let task = TaskId::for_app_and_index(1, 0);
        assert!(recv_abort_task(&mut k, AbortTaskBody { task }).is_ok());
    }

    #[test]
    fn app_terminated_clears_migration_table_entries() {
        let mut k = kernel();
        let task = TaskId::for_app_and_index(4, 0);
        k.migration_table_insert(task, TileAddr::new(1, 1));
        dispatch_broadcast(&mut k, Service::AppTerminated, TileAddr::new(0, 0), 4).unwrap();
        assert!(k.migration_table_is_empty());
    }

    #[test]
    fn halt_pe_records_requester() {
        let mut k = kernel();
        dispatch_broadcast(
            &mut k,
            Service::HaltPe,
            TileAddr::new(5, 5),
            TaskId::KERNEL.0,
        )
        .unwrap();
        assert_eq!(halt::pending(&k), true);
    }
}
