// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The rendezvous messaging core: `write`, `read`, and the two inbound
//! handshake handlers that drive them.
//!
//! Every entry point here returns `Result<Completed<T>, KernelError>`; a
//! `KernelError::Retry(reason)` leaves the calling task's TCB in the
//! matching `SchedState` and the external scheduler picks another task to
//! run. Nothing in this module spins or blocks the CPU -- "blocking" means
//! returning to the caller with the wait recorded, never looping in place.
//!
//! Cross-application addressing (port tables) is out of scope for this
//! module: `resolve_target` only follows an application's own location
//! table. A receiver in a different application must already be resident
//! on this tile, or resolution fails with `NotFound`.

use abi::{
    Blocked, Completed, DeliveryBody, HandshakeBody, HermesHeader, KernelError, Peer, Service,
    TaskId, TileAddr,
};
use zerocopy::AsBytes;

use crate::arch::{BrliteHal, DmniHal, SchedulerHal};
use crate::kernel::Kernel;
use crate::pipe::Pipe;
use crate::{FLIT_SIZE, MAX_MESSAGE_SIZE};

fn flit_round(size: usize) -> usize {
    (size + FLIT_SIZE - 1) / FLIT_SIZE * FLIT_SIZE
}

fn resolve_target<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &Kernel<H, B, S>,
    sender_app: usize,
    receiver: TaskId,
) -> Result<TileAddr, KernelError> {
    if kernel.find_task_index(receiver).is_some() {
        return Ok(kernel.self_addr);
    }
    kernel
        .app(sender_app)
        .and_then(|app| app.loc_table().locate(receiver))
        .ok_or(KernelError::NotFound)
}

fn send_handshake<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    target: TileAddr,
    service: Service,
    sender: TaskId,
    receiver: TaskId,
) -> Result<(), KernelError> {
    if kernel.dmni.send_busy() {
        return Err(KernelError::Retry(Blocked::DmniBusy));
    }
    let header = HermesHeader {
        address: target.0,
        service: service as u8,
        flags: 0,
    };
    let body = HandshakeBody {
        source: u32::from(kernel.self_addr.0),
        receiver,
        sender,
    };
    let mut pkt = [0u8; core::mem::size_of::<HermesHeader>() + core::mem::size_of::<HandshakeBody>()];
    pkt[..4].copy_from_slice(header.as_bytes());
    pkt[4..].copy_from_slice(body.as_bytes());
    kernel.dmni.send(target, &pkt, None)
}

fn send_delivery<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    target: TileAddr,
    sender: TaskId,
    receiver: TaskId,
    now: u64,
    payload: &[u8],
) -> Result<(), KernelError> {
    if kernel.dmni.send_busy() {
        return Err(KernelError::Retry(Blocked::DmniBusy));
    }
    let header = HermesHeader {
        address: target.0,
        service: Service::MessageDelivery as u8,
        flags: 0,
    };
    let body = DeliveryBody {
        handshake: HandshakeBody {
            source: u32::from(kernel.self_addr.0),
            receiver,
            sender,
        },
        timestamp: now as u32,
        size: payload.len() as u32,
    };
    let mut pkt = [0u8; core::mem::size_of::<HermesHeader>() + core::mem::size_of::<DeliveryBody>()];
    pkt[..4].copy_from_slice(header.as_bytes());
    pkt[4..].copy_from_slice(body.as_bytes());

    // `body.size` carries the logical length; the DMNI only accepts whole
    // flits, so the wire payload is zero-padded out to the next one here
    // and trimmed back on the receiving isr's `flit_round(body.size)` recv.
    let mut padded = [0u8; MAX_MESSAGE_SIZE];
    padded[..payload.len()].copy_from_slice(payload);
    kernel
        .dmni
        .send(target, &pkt, Some(&padded[..flit_round(payload.len())]))
}

/// Queues a kernel-originated notification (`TASK_TERMINATED`,
/// `TASK_ALLOCATED`, `PE_HALTED`, ...) for `target`, announcing it with a
/// `DATA_AV` exactly as a user task's `write()` would. The payload itself
/// sits in `kpipe` until the receiver's `MESSAGE_REQUEST` pulls it, rather
/// than in a per-task `pipe_out` slot, since the kernel is not a resident
/// task and has no TCB to hold one.
pub fn post_kernel_message<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    target: Peer,
    msg: &[u8],
) -> Result<(), KernelError> {
    if !kernel.kpipe.add(target, msg) {
        return Err(KernelError::NoMemory);
    }
    if target.addr == kernel.self_addr {
        if let Some(tcb) = kernel.task_mut(target.task) {
            let woke = tcb.push_data_av(Peer {
                task: TaskId::KERNEL,
                addr: kernel.self_addr,
            });
            if woke && tcb.sched_state() == abi::SchedState::WaitingDataAv {
                tcb.set_sched_state(abi::SchedState::Runnable);
                kernel.scheduler.mark_runnable(target.task);
            }
        }
        Ok(())
    } else {
        send_handshake(kernel, target.addr, Service::DataAv, TaskId::KERNEL, target.task)
    }
}

/// Producer-side write, per the six-step algorithm: direct local delivery
/// when a request is already buffered, otherwise arm `pipe_out` and either
/// hand it straight to a matching remote request, announce it with a
/// `DATA_AV`, or leave it armed for a later local request.
pub fn write<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    producer: TaskId,
    buf: &[u8],
    receiver: TaskId,
    sync: bool,
    now: u64,
) -> Result<Completed<usize>, KernelError> {
    let producer_idx = kernel
        .find_task_index(producer)
        .ok_or(KernelError::NotFound)?;
    let producer_app = kernel.tasks()[producer_idx].app();
    let target = resolve_target(kernel, producer_app, receiver)?;
    let receiver_local = kernel.find_task_index(receiver).is_some();

    let buffered_request = kernel.tasks()[producer_idx]
        .msg_requests()
        .iter()
        .find(|p| p.task == receiver)
        .copied();

    if let Some(peer) = buffered_request {
        if receiver_local {
            let (producer_tcb, consumer_tcb) = kernel
                .task_pair_mut(producer, receiver)
                .ok_or(KernelError::NotFound)?;
            producer_tcb.msg_requests_mut().remove(peer.task);
            let mut pipe = Pipe::new(producer);
            pipe.fill(buf)?;
            consumer_tcb.set_pipe_in(pipe);
            consumer_tcb.set_sched_state(abi::SchedState::Runnable);
            kernel.scheduler.mark_runnable(receiver);
            return Ok(buf.len());
        }
    }

    if kernel.tasks()[producer_idx].pipe_out().is_some() {
        kernel
            .task_mut(producer)
            .unwrap()
            .set_sched_state(abi::SchedState::WaitingMessageRequest);
        return Err(KernelError::Retry(Blocked::MessageRequest));
    }

    let remote_request_exists = buffered_request.is_some() && !receiver_local;
    if remote_request_exists || (sync && target != kernel.self_addr) {
        if kernel.dmni.send_busy() {
            return Err(KernelError::Retry(Blocked::DmniBusy));
        }
    }

    let mut pipe_out = Pipe::new(receiver);
    pipe_out.fill(buf)?;

    if let Some(peer) = buffered_request {
        if !receiver_local {
            send_delivery(kernel, target, producer, receiver, now, buf)?;
            kernel
                .task_mut(producer)
                .unwrap()
                .msg_requests_mut()
                .remove(peer.task);
            return Ok(buf.len());
        }
    }

    if sync && receiver_local {
        let addr = kernel.self_addr;
        let (_, consumer_tcb) = kernel
            .task_pair_mut(producer, receiver)
            .ok_or(KernelError::NotFound)?;
        let woke = consumer_tcb.push_data_av(Peer {
            task: producer,
            addr,
        });
        if !woke {
            return Err(KernelError::NoMemory);
        }
        if consumer_tcb.sched_state() == abi::SchedState::WaitingDataAv {
            consumer_tcb.set_sched_state(abi::SchedState::Runnable);
            kernel.scheduler.mark_runnable(receiver);
        }
        kernel.task_mut(producer).unwrap().set_pipe_out(pipe_out);
        return Ok(buf.len());
    } else if sync {
        send_handshake(kernel, target, Service::DataAv, producer, receiver)?;
        kernel.task_mut(producer).unwrap().set_pipe_out(pipe_out);
        return Ok(buf.len());
    }

    kernel.task_mut(producer).unwrap().set_pipe_out(pipe_out);
    Ok(buf.len())
}

/// Consumer-side read, per the eight-step algorithm.
pub fn read<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    consumer: TaskId,
    buf: &mut [u8],
    producer: TaskId,
    sync: bool,
) -> Result<Completed<usize>, KernelError> {
    {
        let tcb = kernel.task_mut(consumer).ok_or(KernelError::NotFound)?;
        if let Some(p) = tcb.pipe_in() {
            if p.is_read() {
                let mut pipe = tcb.take_pipe_in().unwrap();
                return Ok(pipe.drain(buf));
            }
        }
    }

    let resolved_producer = if sync {
        let tcb = kernel.task_mut(consumer).ok_or(KernelError::NotFound)?;
        match tcb.data_avs_mut().pop_front() {
            Some(peer) => Some(peer.task),
            None => {
                tcb.set_pipe_in(Pipe::new(TaskId::KERNEL));
                tcb.set_sched_state(abi::SchedState::WaitingDataAv);
                return Err(KernelError::Retry(Blocked::DataAv));
            }
        }
    } else {
        Some(producer)
    };
    let producer = resolved_producer.unwrap();

    let producer_local_idx = kernel.find_task_index(producer);
    if producer_local_idx.is_some() {
        let matches = kernel
            .task(producer)
            .and_then(|t| t.pipe_out())
            .map(|p| p.peer() == consumer)
            .unwrap_or(false);
        if matches {
            let (producer_tcb, _) = kernel
                .task_pair_mut(producer, consumer)
                .ok_or(KernelError::NotFound)?;
            let mut pipe = producer_tcb.take_pipe_out().unwrap();
            let n = pipe.drain(buf);
            if producer_tcb.sched_state() == abi::SchedState::WaitingMessageRequest {
                producer_tcb.set_sched_state(abi::SchedState::Runnable);
                kernel.scheduler.mark_runnable(producer);
            }
            return Ok(n);
        }
    }

    kernel
        .task_mut(consumer)
        .unwrap()
        .set_pipe_in(Pipe::new(producer));

    if producer_local_idx.is_some() {
        let addr = kernel.self_addr;
        kernel
            .task_mut(producer)
            .unwrap()
            .push_msg_request(Peer {
                task: consumer,
                addr,
            });
    } else {
        let target = resolve_target(kernel, kernel.task(consumer).unwrap().app(), producer)?;
        send_handshake(kernel, target, Service::MessageRequest, consumer, producer)?;
    }

    kernel
        .task_mut(consumer)
        .unwrap()
        .set_sched_state(abi::SchedState::WaitingMessageDelivery);
    Err(KernelError::Retry(Blocked::Delivery))
}

/// Inbound `DATA_AV` handler: append to the receiver's `data_avs`, waking
/// it if it was blocked waiting for one.
pub fn recv_data_av<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    header_source: TileAddr,
    body: HandshakeBody,
) -> Result<(), KernelError> {
    let tcb = kernel.task_mut(body.receiver).ok_or(KernelError::NotFound)?;
    if !tcb.push_data_av(Peer {
        task: body.sender,
        addr: header_source,
    }) {
        return Err(KernelError::NoMemory);
    }
    if tcb.sched_state() == abi::SchedState::WaitingDataAv {
        tcb.take_pipe_in();
        tcb.set_sched_state(abi::SchedState::Runnable);
        kernel.scheduler.mark_runnable(body.receiver);
    }
    Ok(())
}

/// Inbound `MESSAGE_REQUEST` handler: if the addressed producer has a
/// matching armed `pipe_out`, deliver it immediately; otherwise buffer the
/// request.
///
/// A request addressed to `TaskId::KERNEL` is pulling a kernel-originated
/// notification (`TASK_TERMINATED`, `TASK_ALLOCATED`, `PE_HALTED`, ...)
/// queued in `kpipe` rather than a user task's `pipe_out` -- see
/// `post_kernel_message`.
pub fn recv_message_request<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    header_source: TileAddr,
    body: HandshakeBody,
    now: u64,
) -> Result<(), KernelError> {
    let producer = body.receiver;
    let consumer = body.sender;

    if producer == TaskId::KERNEL {
        let entry = match kernel.kpipe.find(consumer) {
            Some(e) => e,
            None => return Ok(()),
        };
        let mut tmp = [0u8; crate::MAX_MESSAGE_SIZE];
        let n = entry.buf().len();
        tmp[..n].copy_from_slice(entry.buf());
        kernel.kpipe.remove(consumer);
        return send_delivery(kernel, header_source, TaskId::KERNEL, consumer, now, &tmp[..n]);
    }

    let matches = kernel
        .task(producer)
        .and_then(|t| t.pipe_out())
        .map(|p| p.peer() == consumer)
        .unwrap_or(false);

    if matches {
        let mut tmp = [0u8; crate::MAX_MESSAGE_SIZE];
        let n = {
            let mut pipe = kernel.task_mut(producer).unwrap().take_pipe_out().unwrap();
            pipe.drain(&mut tmp)
        };
        send_delivery(kernel, header_source, producer, consumer, now, &tmp[..n])?;
        let tcb = kernel.task_mut(producer).unwrap();
        if tcb.sched_state() == abi::SchedState::WaitingMessageRequest {
            tcb.set_sched_state(abi::SchedState::Runnable);
            kernel.scheduler.mark_runnable(producer);
        }
        Ok(())
    } else {
        let tcb = kernel.task_mut(producer).ok_or(KernelError::NotFound)?;
        if !tcb.push_msg_request(Peer {
            task: consumer,
            addr: header_source,
        }) {
            return Err(KernelError::NoMemory);
        }
        Ok(())
    }
}

/// Inbound `MESSAGE_DELIVERY` handler: find the receiver's `pipe_in`,
/// drain the payload into it, mark it read, and wake the consumer.
pub fn recv_delivery<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    body: DeliveryBody,
    payload: &[u8],
) -> Result<(), KernelError> {
    let receiver = body.handshake.receiver;
    let tcb = kernel.task_mut(receiver).ok_or(KernelError::NotFound)?;
    if tcb.pipe_in().is_none() {
        return Err(KernelError::InvalidArg);
    }
    let mut pipe = Pipe::new(body.handshake.sender);
    pipe.fill(payload)?;
    tcb.set_pipe_in(pipe);
    tcb.set_sched_state(abi::SchedState::Runnable);
    kernel.scheduler.mark_runnable(receiver);
    Ok(())
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
            addr: TileAddr::new(0, 0),
        }
    }

    #[test]
    fn same_tile_request_then_write_delivers_directly() {
        let mut k = kernel();
        let producer = TaskId::for_app_and_index(1, 0);
        let consumer = TaskId::for_app_and_index(1, 1);
        k.insert_task(Tcb::new(producer, 0, mapper(), 0)).unwrap();
        k.insert_task(Tcb::new(consumer, 0, mapper(), 0)).unwrap();

        // Consumer requests first (as read() would, sans packet since local).
        match read(&mut k, consumer, &mut [0u8; 16], producer, false) {
            Err(KernelError::Retry(Blocked::Delivery)) => {}
            other => panic!("expected Retry(Delivery), got {other:?}"),
        }

        let mut dst = [0u8; 16];
        let n = write(&mut k, producer, b"hello", consumer, true, 0).unwrap();
        assert_eq!(n, 5);

        let consumer_tcb = k.task(consumer).unwrap();
        assert!(consumer_tcb.pipe_in().unwrap().is_read());

        let n2 = read(&mut k, consumer, &mut dst, producer, false).unwrap();
        assert_eq!(&dst[..n2], b"hello");
    }

    #[test]
    fn same_tile_write_then_read_uses_data_av_path() {
        let mut k = kernel();
        let producer = TaskId::for_app_and_index(1, 0);
        let consumer = TaskId::for_app_and_index(1, 1);
        k.insert_task(Tcb::new(producer, 0, mapper(), 0)).unwrap();
        k.insert_task(Tcb::new(consumer, 0, mapper(), 0)).unwrap();

        let n = write(&mut k, producer, b"hi", consumer, true, 0).unwrap();
        assert_eq!(n, 2);
        assert!(k.task(consumer).unwrap().data_avs().contains(producer));

        let mut dst = [0u8; 8];
        let n2 = read(&mut k, consumer, &mut dst, producer, true).unwrap();
        assert_eq!(&dst[..n2], b"hi");
    }

    #[test]
    fn second_write_while_pipe_out_armed_blocks() {
        let mut k = kernel();
        let producer = TaskId::for_app_and_index(1, 0);
        let consumer = TaskId::for_app_and_index(1, 1);
        k.insert_task(Tcb::new(producer, 0, mapper(), 0)).unwrap();
        k.insert_task(Tcb::new(consumer, 0, mapper(), 0)).unwrap();

        write(&mut k, producer, b"first", consumer, true, 0).unwrap();
        let result = write(&mut k, producer, b"second", consumer, true, 0);
        assert_eq!(result, Err(KernelError::Retry(Blocked::MessageRequest)));
    }
}
