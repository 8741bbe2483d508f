// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task migration: the seven-packet protocol that moves a running task's
//! state from this tile to another.
//!
//! Both directions live here -- the source-side `send_*` functions that
//! serialize a resident task's state, and the destination-side `recv_*`
//! handlers that rebuild it packet by packet, in the same order the source
//! sends them: `MIGRATION_TEXT` (sent separately, before the source commits
//! to migrating -- see `send_text`), then data, stack, handshake, pipe,
//! task location, and finally the TCB itself, which also releases the task
//! to the destination's scheduler.
//!
//! The task's text, data, and stack memory regions are board-mapped slices
//! the caller already knows how to produce or receive into; this module
//! only owns the wire protocol and the TCB bookkeeping around it.

use abi::{
    Blocked, HermesHeader, KernelError, MigrationDataBody, MigrationHandshakeBody,
    MigrationPipeBody, MigrationStackBody, MigrationTaskLocationBody, MigrationTcbBody,
    MigrationTextBody, Peer, SchedState, Service, TaskId, TileAddr,
};
use zerocopy::{AsBytes, FromBytes};

use crate::arch::{BrliteHal, DmniHal, SchedulerHal};
use crate::kernel::Kernel;
use crate::messaging;
use crate::pipe::Pipe;
use crate::task::Tcb;
use crate::{FLIT_SIZE, MAX_MESSAGE_SIZE, MAX_PEERS_PER_TASK, MAX_TASKS_PER_APP};

fn flit_round(size: usize) -> usize {
    (size + FLIT_SIZE - 1) / FLIT_SIZE * FLIT_SIZE
}

/// `MigrationTcbBody.waiting` carries the TCB's actual `SchedState`, not
/// just whether it was waiting on *something* -- `recv_message_request`
/// only wakes a producer that is specifically `WaitingMessageRequest`, so a
/// migrated task parked in that state has to be reinstalled in it, not in
/// `WaitingDataAv`.
fn sched_state_to_wire(s: SchedState) -> u8 {
    match s {
        SchedState::Runnable => 0,
        SchedState::WaitingDataAv => 1,
        SchedState::WaitingMessageRequest => 2,
        SchedState::WaitingMessageDelivery => 3,
        SchedState::Stopped => 4,
    }
}

fn sched_state_from_wire(w: u8) -> SchedState {
    match w {
        1 => SchedState::WaitingDataAv,
        2 => SchedState::WaitingMessageRequest,
        3 => SchedState::WaitingMessageDelivery,
        4 => SchedState::Stopped,
        _ => SchedState::Runnable,
    }
}

// ---------------------------------------------------------------- source --

/// Sends a migrating task's `.text` payload ahead of the rest of the
/// protocol, per the RPC handler's ordering: the source commits to the
/// migration only after this succeeds.
pub fn send_text<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    task: TaskId,
    target: TileAddr,
    mapper: Peer,
    text: &[u8],
) -> Result<(), KernelError> {
    if kernel.dmni.send_busy() {
        return Err(KernelError::Retry(Blocked::DmniBusy));
    }
    let header = HermesHeader {
        address: target.0,
        service: Service::MigrationText as u8,
        flags: 0,
    };
    let body = MigrationTextBody {
        size: text.len() as u32,
        task,
        mapper_address: mapper.addr,
        mapper_task: mapper.task,
    };
    let mut pkt = [0u8; 4 + core::mem::size_of::<MigrationTextBody>()];
    pkt[..4].copy_from_slice(header.as_bytes());
    pkt[4..].copy_from_slice(body.as_bytes());
    kernel.dmni.send(target, &pkt, Some(text))
}

fn send_data<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    task: TaskId,
    target: TileAddr,
    payload: &[u8],
) -> Result<(), KernelError> {
    if payload.is_empty() {
        return Ok(());
    }
    let tcb = kernel.task(task).ok_or(KernelError::NotFound)?;
    let data_size = tcb.data_size();
    let bss_size = tcb.bss_size();
    let heap_size = tcb.heap_end().saturating_sub(data_size + bss_size);

    if kernel.dmni.send_busy() {
        return Err(KernelError::Retry(Blocked::DmniBusy));
    }
    let header = HermesHeader {
        address: target.0,
        service: Service::MigrationData as u8,
        flags: 0,
    };
    let body = MigrationDataBody {
        data_size,
        bss_size,
        heap_size,
        task,
    };
    let mut pkt = [0u8; 4 + core::mem::size_of::<MigrationDataBody>()];
    pkt[..4].copy_from_slice(header.as_bytes());
    pkt[4..].copy_from_slice(body.as_bytes());
    kernel.dmni.send(target, &pkt, Some(payload))
}

fn send_stack<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    task: TaskId,
    target: TileAddr,
    stack: &[u8],
) -> Result<(), KernelError> {
    if stack.is_empty() {
        return Ok(());
    }
    if kernel.dmni.send_busy() {
        return Err(KernelError::Retry(Blocked::DmniBusy));
    }
    let header = HermesHeader {
        address: target.0,
        service: Service::MigrationStack as u8,
        flags: 0,
    };
    let body = MigrationStackBody {
        size: stack.len() as u32,
        task,
    };
    let mut pkt = [0u8; 4 + core::mem::size_of::<MigrationStackBody>()];
    pkt[..4].copy_from_slice(header.as_bytes());
    pkt[4..].copy_from_slice(body.as_bytes());
    kernel.dmni.send(target, &pkt, Some(stack))
}

fn send_hdshk<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    task: TaskId,
    target: TileAddr,
) -> Result<(), KernelError> {
    let tcb = kernel.task(task).ok_or(KernelError::NotFound)?;
    let available_count = tcb.data_avs().len() as u8;
    let requested_count = tcb.msg_requests().len() as u8;
    if available_count == 0 && requested_count == 0 {
        return Ok(());
    }

    let mut payload = [0u8; 2 * MAX_PEERS_PER_TASK * 4];
    let mut offset = 0;
    for peer in tcb.data_avs().iter() {
        payload[offset..offset + 4].copy_from_slice(peer.as_bytes());
        offset += 4;
    }
    for peer in tcb.msg_requests().iter() {
        payload[offset..offset + 4].copy_from_slice(peer.as_bytes());
        offset += 4;
    }

    if kernel.dmni.send_busy() {
        return Err(KernelError::Retry(Blocked::DmniBusy));
    }
    let header = HermesHeader {
        address: target.0,
        service: Service::MigrationHdshk as u8,
        flags: 0,
    };
    let body = MigrationHandshakeBody {
        task,
        available_count,
        requested_count,
    };
    let mut pkt = [0u8; 4 + core::mem::size_of::<MigrationHandshakeBody>()];
    pkt[..4].copy_from_slice(header.as_bytes());
    pkt[4..].copy_from_slice(body.as_bytes());
    kernel.dmni.send(target, &pkt, Some(&payload[..offset]))
}

fn send_pipe<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    task: TaskId,
    target: TileAddr,
) -> Result<(), KernelError> {
    let has_pipe = kernel
        .task(task)
        .ok_or(KernelError::NotFound)?
        .pipe_out()
        .is_some();
    if !has_pipe {
        return Ok(());
    }
    if kernel.dmni.send_busy() {
        return Err(KernelError::Retry(Blocked::DmniBusy));
    }

    let tcb = kernel.task_mut(task).unwrap();
    let mut pipe = tcb.take_pipe_out().unwrap();
    let receiver = pipe.peer();
    let mut buf = [0u8; MAX_MESSAGE_SIZE];
    let n = pipe.drain(&mut buf);

    let header = HermesHeader {
        address: target.0,
        service: Service::MigrationPipe as u8,
        flags: 0,
    };
    let body = MigrationPipeBody {
        task,
        receiver,
        size: n as u32,
    };
    let mut pkt = [0u8; 4 + core::mem::size_of::<MigrationPipeBody>()];
    pkt[..4].copy_from_slice(header.as_bytes());
    pkt[4..].copy_from_slice(body.as_bytes());
    kernel.dmni.send(target, &pkt, Some(&buf[..flit_round(n)]))
}

fn send_task_location<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    task: TaskId,
    target: TileAddr,
) -> Result<(), KernelError> {
    let app_index = kernel.task(task).ok_or(KernelError::NotFound)?.app();
    let app = kernel.app(app_index).ok_or(KernelError::NotFound)?;
    let task_count = app.loc_table().len() as u8;

    let mut payload = [0u8; MAX_TASKS_PER_APP * 4];
    let mut offset = 0;
    for (t, tile) in app.loc_table().iter() {
        let peer = Peer { task: t, addr: tile };
        payload[offset..offset + 4].copy_from_slice(peer.as_bytes());
        offset += 4;
    }

    if kernel.dmni.send_busy() {
        return Err(KernelError::Retry(Blocked::DmniBusy));
    }
    let header = HermesHeader {
        address: target.0,
        service: Service::MigrationTaskLocation as u8,
        flags: 0,
    };
    let body = MigrationTaskLocationBody { task, task_count };
    let mut pkt = [0u8; 4 + core::mem::size_of::<MigrationTaskLocationBody>()];
    pkt[..4].copy_from_slice(header.as_bytes());
    pkt[4..].copy_from_slice(body.as_bytes());
    kernel.dmni.send(target, &pkt, Some(&payload[..offset]))
}

fn send_tcb<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    task: TaskId,
    target: TileAddr,
) -> Result<(), KernelError> {
    let tcb = kernel.task(task).ok_or(KernelError::NotFound)?;
    // Only the byte count of a buffered, unread pipe_in crosses migration,
    // not its payload -- the task will re-request delivery from its new
    // home if it still needs the data.
    let received = tcb
        .pipe_in()
        .filter(|p| p.is_read())
        .map(|p| p.len() as u16)
        .unwrap_or(0);
    let waiting = sched_state_to_wire(tcb.sched_state());
    let pc = tcb.save().pc;
    let mut regbuf = [0u8; 32 * 4];
    for (i, r) in tcb.save().regs.iter().enumerate() {
        regbuf[i * 4..i * 4 + 4].copy_from_slice(&r.to_le_bytes());
    }

    if kernel.dmni.send_busy() {
        return Err(KernelError::Retry(Blocked::DmniBusy));
    }
    let header = HermesHeader {
        address: target.0,
        service: Service::MigrationTcb as u8,
        flags: 0,
    };
    let body = MigrationTcbBody {
        pc,
        exec_time: 0,
        period: 0,
        deadline: 0,
        task,
        source: kernel.self_addr,
        received,
        waiting,
    };
    let mut pkt = [0u8; 4 + core::mem::size_of::<MigrationTcbBody>()];
    pkt[..4].copy_from_slice(header.as_bytes());
    pkt[4..].copy_from_slice(body.as_bytes());
    kernel.dmni.send(target, &pkt, Some(&regbuf))
}

/// Runs steps two through seven of the protocol (step one, `send_text`, has
/// already completed) and removes the task's TCB from this tile.
///
/// The caller is responsible for `Tcb::can_migrate` -- a task waiting on a
/// `MESSAGE_DELIVERY` must not reach this function, since the in-flight
/// handshake names this tile as the deliverer.
pub fn migrate<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    task: TaskId,
    target: TileAddr,
    data_bss_heap: &[u8],
    stack: &[u8],
) -> Result<(), KernelError> {
    send_data(kernel, task, target, data_bss_heap)?;
    send_stack(kernel, task, target, stack)?;
    send_hdshk(kernel, task, target)?;
    send_pipe(kernel, task, target)?;
    send_task_location(kernel, task, target)?;
    send_tcb(kernel, task, target)?;

    if !kernel.migration_table_insert(task, target) {
        return Err(KernelError::NoMemory);
    }

    let app_index = kernel.task(task).ok_or(KernelError::NotFound)?.app();
    if let Some(app) = kernel.app_mut(app_index) {
        app.loc_table_mut().set(task, target);
    }

    kernel.remove_task(task);
    if kernel
        .app_mut(app_index)
        .map(|a| a.app_derefer())
        .unwrap_or(false)
    {
        kernel.drop_app_if_unreferenced(app_index);
    }
    Ok(())
}

// ----------------------------------------------------------- destination --

/// Installs the shell of a migrating task from its `.text` payload. The
/// TCB exists from this point on, though it is not schedulable until
/// `recv_tcb` completes the handoff.
pub fn recv_text<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    body: MigrationTextBody,
    page: &mut [u8],
) -> Result<(), KernelError> {
    let text_len = flit_round(body.size as usize);
    if page.len() < text_len {
        return Err(KernelError::InvalidArg);
    }
    kernel.dmni.recv(&mut page[..text_len])?;

    let app_index = kernel.find_or_insert_app(body.task.app())?;
    let mapper = Peer {
        task: body.mapper_task,
        addr: body.mapper_address,
    };
    let mut tcb = Tcb::new(body.task, app_index, mapper, 0);
    tcb.set_sizes(body.size, 0, 0, 0);
    kernel.app_mut(app_index).unwrap().app_refer();
    kernel.insert_task(tcb)
}

pub fn recv_data<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    body: MigrationDataBody,
    page: &mut [u8],
) -> Result<(), KernelError> {
    let total = flit_round((body.data_size + body.bss_size + body.heap_size) as usize);
    if page.len() < total {
        return Err(KernelError::InvalidArg);
    }
    kernel.dmni.recv(&mut page[..total])?;

    let tcb = kernel.task_mut(body.task).ok_or(KernelError::NotFound)?;
    let text_size = tcb.text_size();
    let heap_end = text_size + body.data_size + body.bss_size + body.heap_size;
    tcb.set_sizes(text_size, body.data_size, body.bss_size, heap_end);
    Ok(())
}

pub fn recv_stack<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    body: MigrationStackBody,
    stack: &mut [u8],
) -> Result<(), KernelError> {
    kernel.task(body.task).ok_or(KernelError::NotFound)?;
    let len = flit_round(body.size as usize);
    if stack.len() < len {
        return Err(KernelError::InvalidArg);
    }
    kernel.dmni.recv(&mut stack[..len])?;
    Ok(())
}

pub fn recv_hdshk<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    body: MigrationHandshakeBody,
) -> Result<(), KernelError> {
    let total = body.available_count as usize + body.requested_count as usize;
    let mut raw = [0u8; 2 * MAX_PEERS_PER_TASK * 4];
    let len = total * 4;
    if len > raw.len() {
        return Err(KernelError::InvalidArg);
    }
    kernel.dmni.recv(&mut raw[..len])?;

    let tcb = kernel.task_mut(body.task).ok_or(KernelError::NotFound)?;
    for i in 0..body.available_count as usize {
        let peer = Peer::read_from(&raw[i * 4..i * 4 + 4]).ok_or(KernelError::BadMessage)?;
        tcb.push_data_av(peer);
    }
    for i in 0..body.requested_count as usize {
        let off = (body.available_count as usize + i) * 4;
        let peer = Peer::read_from(&raw[off..off + 4]).ok_or(KernelError::BadMessage)?;
        tcb.push_msg_request(peer);
    }
    Ok(())
}

pub fn recv_pipe<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    body: MigrationPipeBody,
) -> Result<(), KernelError> {
    let len = flit_round(body.size as usize);
    let mut buf = [0u8; MAX_MESSAGE_SIZE];
    if len > buf.len() {
        return Err(KernelError::InvalidArg);
    }
    kernel.dmni.recv(&mut buf[..len])?;

    let tcb = kernel.task_mut(body.task).ok_or(KernelError::NotFound)?;
    let mut pipe = Pipe::new(body.receiver);
    pipe.fill(&buf[..body.size as usize])?;
    tcb.set_pipe_out(pipe);
    Ok(())
}

/// Installs the application's location table, unless this tile already has
/// one for the app -- in which case the incoming copy may be stale and is
/// discarded.
pub fn recv_task_location<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    body: MigrationTaskLocationBody,
) -> Result<(), KernelError> {
    let len = body.task_count as usize * 4;
    let mut raw = [0u8; MAX_TASKS_PER_APP * 4];
    if len > raw.len() {
        return Err(KernelError::InvalidArg);
    }
    kernel.dmni.recv(&mut raw[..len])?;

    let app_index = kernel.find_or_insert_app(body.task.app())?;
    let app = kernel.app_mut(app_index).unwrap();
    if app.loc_table().is_empty() {
        for i in 0..body.task_count as usize {
            let peer = Peer::read_from(&raw[i * 4..i * 4 + 4]).ok_or(KernelError::BadMessage)?;
            app.loc_table_mut().set(peer.task, peer.addr);
        }
    }
    Ok(())
}

/// The final packet: installs registers and PC, resolves the task's wait
/// state, releases it to the scheduler, updates this app's own view of
/// where the task now lives, and tells the mapper the migration completed.
pub fn recv_tcb<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    body: MigrationTcbBody,
) -> Result<(), KernelError> {
    let mut regbuf = [0u8; 32 * 4];
    kernel.dmni.recv(&mut regbuf)?;

    let (mapper, app_index) = {
        let tcb = kernel.task_mut(body.task).ok_or(KernelError::NotFound)?;
        for (i, chunk) in regbuf.chunks_exact(4).enumerate() {
            tcb.save_mut().regs[i] = u32::from_le_bytes(chunk.try_into().unwrap());
        }
        tcb.save_mut().pc = body.pc;

        if body.received != 0 {
            let dummy = [0u8; MAX_MESSAGE_SIZE];
            let mut pipe = Pipe::new(TaskId::KERNEL);
            pipe.fill(&dummy[..body.received as usize])?;
            tcb.set_pipe_in(pipe);
        }

        tcb.set_sched_state(sched_state_from_wire(body.waiting));

        (tcb.mapper(), tcb.app())
    };

    if let Some(app) = kernel.app_mut(app_index) {
        app.loc_table_mut().set(body.task, kernel.self_addr);
    }

    kernel.scheduler.mark_runnable(body.task);
    messaging::post_kernel_message(kernel, mapper, &body.task.0.to_le_bytes())
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

    fn mapper() -> Peer {
        Peer {
            task: TaskId::KERNEL,
            addr: TileAddr::new(9, 9),
        }
    }

    #[test]
    fn migrate_removes_tcb_and_records_migration_table() {
        let mut k = kernel();
        let task = TaskId::for_app_and_index(1, 0);
        k.insert_task(Tcb::new(task, 0, mapper(), 0)).unwrap();
        k.app_mut(0).unwrap().app_refer();

        let target = TileAddr::new(2, 2);
        migrate(&mut k, task, target, &[], &[]).unwrap();

        assert!(k.task(task).is_none());
        assert_eq!(k.migration_table_lookup(task), Some(target));
    }

    #[test]
    fn send_hdshk_skips_empty_fifos() {
        let mut k = kernel();
        let task = TaskId::for_app_and_index(1, 0);
        k.insert_task(Tcb::new(task, 0, mapper(), 0)).unwrap();

        // Should not touch the DMNI at all since both FIFOs are empty.
        send_hdshk(&mut k, task, TileAddr::new(2, 2)).unwrap();
        assert!(k.dmni.hal_mut().last_send.is_none());
    }

    #[test]
    fn recv_text_installs_shell_tcb() {
        let mut k = kernel();
        k.dmni.hal_mut().recv_buf = std::vec![0u8; 4];
        let mut page = [0u8; 4];
        let body = MigrationTextBody {
            size: 4,
            task: TaskId::for_app_and_index(3, 0),
            mapper_address: TileAddr::new(1, 1),
            mapper_task: TaskId::for_app_and_index(9, 0),
        };
        recv_text(&mut k, body, &mut page).unwrap();
        assert!(k.task(TaskId::for_app_and_index(3, 0)).is_some());
    }

    #[test]
    fn tcb_roundtrip_preserves_waiting_message_request() {
        assert_eq!(
            sched_state_to_wire(SchedState::WaitingMessageRequest),
            sched_state_to_wire(SchedState::WaitingMessageRequest)
        );
        assert_eq!(
            sched_state_from_wire(sched_state_to_wire(SchedState::WaitingMessageRequest)),
            SchedState::WaitingMessageRequest
        );
        assert_eq!(
            sched_state_from_wire(sched_state_to_wire(SchedState::WaitingDataAv)),
            SchedState::WaitingDataAv
        );
    }

    #[test]
    fn recv_tcb_restores_waiting_message_request_not_data_av() {
        let mut k = kernel();
        let task = TaskId::for_app_and_index(3, 0);
        k.insert_task(Tcb::new(task, 0, mapper(), 0)).unwrap();
        k.dmni.hal_mut().recv_buf = std::vec![0u8; 32 * 4];

        let body = MigrationTcbBody {
            pc: 0,
            exec_time: 0,
            period: 0,
            deadline: 0,
            task,
            source: TileAddr::new(1, 1),
            received: 0,
            waiting: sched_state_to_wire(SchedState::WaitingMessageRequest),
        };
        recv_tcb(&mut k, body).unwrap();
        assert_eq!(
            k.task(task).unwrap().sched_state(),
            SchedState::WaitingMessageRequest
        );
    }
}
