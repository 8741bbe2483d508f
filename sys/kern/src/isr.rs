// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Top-level interrupt dispatcher.
//!
//! Entered once per interrupt with a snapshot of which sources are
//! pending; routes by priority (BrLite, then Hermes, then the pending
//! FIFO, then the timer) to exactly one handler, and reports back whether
//! the scheduler should reconsider which task runs next. CPU trap entry,
//! the interrupt controller, and deciding which bits to snapshot are all
//! board concerns that sit above this function.

use abi::{KernelError, Packet, Peer, Service, TaskId, TileAddr};

use crate::arch::{BrliteHal, DmniHal, MemoryHal, SchedulerHal, TimerHal};
use crate::kernel::Kernel;
use crate::log::{self, klog, Event};
use crate::pending::PendingKind;
use crate::{alloc, hermes, messaging, migration, rpc};
use crate::{FLIT_SIZE, MAX_MESSAGE_SIZE};

fn flit_round(size: usize) -> usize {
    (size + FLIT_SIZE - 1) / FLIT_SIZE * FLIT_SIZE
}

/// Which interrupt sources are asserted this entry. The board computes
/// these from its own interrupt-controller registers; the kernel only
/// ever sees the boolean result.
#[derive(Copy, Clone, Debug, Default)]
pub struct IsrSources {
    pub brlite: bool,
    pub hermes: bool,
    pub pending: bool,
    pub timer: bool,
}

/// What the ISR learned this entry that the HAL's return-to-scheduler
/// path needs to act on.
#[derive(Copy, Clone, Debug, Default)]
pub struct IsrOutcome {
    /// A wait condition cleared, a task was aborted, or the timer fired --
    /// the HAL should run the scheduler before resuming a task.
    pub run_scheduler: bool,
}

/// Dispatches one interrupt. `current_task` and `stack_overflowed` name
/// the running task and whether its stack guard tripped, both board
/// observations made before this call; `memory` lends the task-image
/// buffers a Hermes or migration packet might need to drain into or read
/// out of.
pub fn dispatch<H: DmniHal, B: BrliteHal, S: SchedulerHal, T: TimerHal, M: MemoryHal>(
    kernel: &mut Kernel<H, B, S>,
    timer: &T,
    memory: &mut M,
    sources: IsrSources,
    current_task: Option<TaskId>,
    stack_overflowed: bool,
) -> IsrOutcome {
    let mut outcome = IsrOutcome::default();

    if sources.brlite && kernel.brlite.recv_pending() {
        let _ = handle_brlite(kernel, &mut outcome);
    } else if sources.hermes {
        let _ = handle_hermes(kernel, timer, memory, &mut outcome);
    } else if sources.pending && !kernel.pending.is_empty() {
        let _ = handle_pending(kernel, timer, &mut outcome);
    } else if sources.timer {
        handle_timer(kernel, current_task, stack_overflowed, &mut outcome);
    }

    outcome
}

fn handle_brlite<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    outcome: &mut IsrOutcome,
) -> Result<(), KernelError> {
    let (service, pkt) = kernel.brlite.recv()?;
    rpc::dispatch_broadcast(kernel, service, pkt.src_addr, pkt.payload)?;
    if service == Service::HaltPe || service == Service::AppTerminated {
        outcome.run_scheduler = true;
    }
    Ok(())
}

fn handle_hermes<H: DmniHal, B: BrliteHal, S: SchedulerHal, T: TimerHal, M: MemoryHal>(
    kernel: &mut Kernel<H, B, S>,
    timer: &T,
    memory: &mut M,
    outcome: &mut IsrOutcome,
) -> Result<(), KernelError> {
    let packet = hermes::decode(&mut kernel.dmni)?;

    match packet {
        Packet::DataAv { body, .. } => {
            if kernel.dmni.send_busy() {
                if !kernel.pending.push_back(PendingKind::DataAv, body) {
                    klog!(Event::Error {
                        where_: "isr::data_av",
                        err: KernelError::NoMemory
                    });
                }
                klog!(Event::Deferred {
                    service: Service::DataAv as u8
                });
            } else {
                messaging::recv_data_av(kernel, TileAddr(body.source as u16), body)?;
                outcome.run_scheduler = true;
            }
        }
        Packet::MessageRequest { body, .. } => {
            if kernel.dmni.send_busy() {
                if !kernel.pending.push_back(PendingKind::MessageRequest, body) {
                    klog!(Event::Error {
                        where_: "isr::message_request",
                        err: KernelError::NoMemory
                    });
                }
                klog!(Event::Deferred {
                    service: Service::MessageRequest as u8
                });
            } else {
                messaging::recv_message_request(kernel, TileAddr(body.source as u16), body, timer.now())?;
                outcome.run_scheduler = true;
            }
        }
        Packet::MessageDelivery { body, .. } => {
            let len = flit_round(body.size as usize);
            if len > MAX_MESSAGE_SIZE {
                return Err(KernelError::InvalidArg);
            }
            let mut buf = [0u8; MAX_MESSAGE_SIZE];
            kernel.dmni.recv(&mut buf[..len])?;
            messaging::recv_delivery(kernel, body, &buf[..body.size as usize])?;
            outcome.run_scheduler = true;
        }
        Packet::TaskAllocation { body, .. } => {
            let len = flit_round(body.text_size as usize) + flit_round(body.data_size as usize);
            let page = memory
                .task_image_mut(body.task, len)
                .ok_or(KernelError::NoMemory)?;
            alloc::allocate(kernel, body, page)?;
        }
        Packet::MigrationText { body, .. } => {
            let len = flit_round(body.size as usize);
            let page = memory
                .task_image_mut(body.task, len)
                .ok_or(KernelError::NoMemory)?;
            migration::recv_text(kernel, body, page)?;
        }
        Packet::MigrationData { body, .. } => {
            let len = flit_round((body.data_size + body.bss_size + body.heap_size) as usize);
            let page = memory
                .task_image_mut(body.task, len)
                .ok_or(KernelError::NoMemory)?;
            migration::recv_data(kernel, body, page)?;
        }
        Packet::MigrationStack { body, .. } => {
            let len = flit_round(body.size as usize);
            let stack = memory
                .task_stack_mut(body.task, len)
                .ok_or(KernelError::NoMemory)?;
            migration::recv_stack(kernel, body, stack)?;
        }
        Packet::MigrationHdshk { body, .. } => {
            migration::recv_hdshk(kernel, body)?;
        }
        Packet::MigrationPipe { body, .. } => {
            migration::recv_pipe(kernel, body)?;
        }
        Packet::MigrationTaskLocation { body, .. } => {
            migration::recv_task_location(kernel, body)?;
        }
        Packet::MigrationTcb { body, .. } => {
            migration::recv_tcb(kernel, body)?;
            outcome.run_scheduler = true;
        }
        Packet::TaskRelease { body, .. } => {
            rpc::recv_task_release(kernel, body)?;
            outcome.run_scheduler = true;
        }
        Packet::AbortTask { body, .. } => {
            rpc::recv_abort_task(kernel, body)?;
            outcome.run_scheduler = true;
        }
        Packet::TaskMigration { body, .. } => {
            if let Some(tcb) = kernel.task(body.task) {
                let text_len = tcb.text_size() as usize;
                let total_len = text_len + (tcb.heap_end() - tcb.text_size()) as usize;
                let sp = tcb.save().sp;
                let image = memory
                    .task_image(body.task, total_len)
                    .ok_or(KernelError::NoMemory)?;
                let (text, data_bss_heap) = image.split_at(text_len);
                let stack = memory.task_stack(body.task, sp).ok_or(KernelError::NoMemory)?;
                rpc::recv_task_migration(kernel, body, text, data_bss_heap, stack)?;
            }
        }
    }
    Ok(())
}

fn handle_pending<H: DmniHal, B: BrliteHal, S: SchedulerHal, T: TimerHal>(
    kernel: &mut Kernel<H, B, S>,
    timer: &T,
    outcome: &mut IsrOutcome,
) -> Result<(), KernelError> {
    let entry = match kernel.pending.pop_front() {
        Some(e) => e,
        None => return Ok(()),
    };
    let src = TileAddr(entry.body.source as u16);
    match entry.kind {
        PendingKind::DataAv => messaging::recv_data_av(kernel, src, entry.body)?,
        PendingKind::MessageRequest => {
            messaging::recv_message_request(kernel, src, entry.body, timer.now())?
        }
    }
    outcome.run_scheduler = true;
    Ok(())
}

/// Aborts the running task if its stack guard tripped, otherwise just
/// flags a reschedule -- a timer IRQ always ends a task's time slice.
fn handle_timer<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    current_task: Option<TaskId>,
    stack_overflowed: bool,
    outcome: &mut IsrOutcome,
) {
    outcome.run_scheduler = true;
    if !stack_overflowed {
        return;
    }
    let task = match current_task {
        Some(t) => t,
        None => return,
    };
    let tcb = match kernel.task(task) {
        Some(t) => t,
        None => return,
    };
    let app_index = tcb.app();
    let mapper = tcb.mapper();
    kernel.remove_task(task);
    if kernel
        .app_mut(app_index)
        .map(|a| a.app_derefer())
        .unwrap_or(false)
    {
        kernel.drop_app_if_unreferenced(app_index);
    }
    let _ = messaging::post_kernel_message(kernel, mapper, &task.0.to_le_bytes());
    log::event_error("isr::stack_overflow", KernelError::InvalidArg);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::fake::{FakeBrlite, FakeDmni, FakeMemory, FakeScheduler, FakeTimer};
    use crate::task::Tcb;
    use abi::{HandshakeBody, HermesHeader, TaskId};
    use zerocopy::AsBytes;

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
    fn hermes_data_av_defers_when_send_busy() {
        let mut k = kernel();
        k.insert_task(Tcb::new(TaskId::for_app_and_index(1, 0), 0, mapper(), 0))
            .unwrap();
        k.dmni.hal_mut().send_active = true;

        let header = HermesHeader {
            address: 0,
            service: Service::DataAv as u8,
            flags: 0,
        };
        let body = HandshakeBody {
            source: 0x0102,
            receiver: TaskId::for_app_and_index(1, 0),
            sender: TaskId::KERNEL,
        };
        let mut bytes = std::vec::Vec::new();
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(body.as_bytes());
        k.dmni.hal_mut().recv_buf = bytes;

        let timer = FakeTimer::default();
        let mut mem = FakeMemory::default();
        let outcome = dispatch(
            &mut k,
            &timer,
            &mut mem,
            IsrSources {
                hermes: true,
                ..Default::default()
            },
            None,
            false,
        );
        assert_eq!(k.pending.len(), 1);
        assert!(!outcome.run_scheduler);
    }

    #[test]
    fn brlite_priority_wins_over_hermes() {
        let mut k = kernel();
        k.brlite = crate::brlite::Brlite::new(FakeBrlite {
            send_busy: false,
            recv_pending: true,
            recv_value: (Service::AnnounceMonitor as u8, TileAddr::new(2, 2), 0),
            sent: None,
        });
        k.dmni.hal_mut().recv_buf = std::vec::Vec::new();

        let timer = FakeTimer::default();
        let mut mem = FakeMemory::default();
        let outcome = dispatch(
            &mut k,
            &timer,
            &mut mem,
            IsrSources {
                brlite: true,
                hermes: true,
                ..Default::default()
            },
            None,
            false,
        );
        assert!(!outcome.run_scheduler);
    }

    #[test]
    fn timer_fires_run_scheduler() {
        let mut k = kernel();
        let timer = FakeTimer::default();
        let mut mem = FakeMemory::default();
        let outcome = dispatch(
            &mut k,
            &timer,
            &mut mem,
            IsrSources {
                timer: true,
                ..Default::default()
            },
            None,
            false,
        );
        assert!(outcome.run_scheduler);
    }

    #[test]
    fn timer_with_stack_overflow_aborts_current_task() {
        let mut k = kernel();
        let task = TaskId::for_app_and_index(1, 0);
        k.insert_task(Tcb::new(task, 0, mapper(), 0)).unwrap();
        k.app_mut(k.find_or_insert_app(1).unwrap())
            .unwrap()
            .app_refer();

        let timer = FakeTimer::default();
        let mut mem = FakeMemory::default();
        let outcome = dispatch(
            &mut k,
            &timer,
            &mut mem,
            IsrSources {
                timer: true,
                ..Default::default()
            },
            Some(task),
            true,
        );
        assert!(outcome.run_scheduler);
        assert!(k.task(task).is_none());
    }
}
