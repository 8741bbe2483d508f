// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task allocation: installs a new TCB from an inbound `TASK_ALLOCATION`
//! packet and the text/data payload that follows it on the wire.
//!
//! Acquiring the physical page a task's text and data land in is a board
//! concern -- this module is handed an already-sized destination slice and
//! owns only draining the payload into it, installing the TCB, and
//! announcing the result to the mapper.

use abi::{AllocationBody, KernelError, Peer, TaskId};

use crate::arch::{BrliteHal, DmniHal, SchedulerHal};
use crate::kernel::Kernel;
use crate::messaging;
use crate::task::Tcb;
use crate::FLIT_SIZE;

fn flit_round(size: u32) -> usize {
    let size = size as usize;
    (size + FLIT_SIZE - 1) / FLIT_SIZE * FLIT_SIZE
}

/// Installs a new task from `body`, draining its text and data payload
/// into `page` (which must be at least `text_size + data_size` bytes,
/// each rounded up to a flit multiple, long).
///
/// A mapper task id of `TaskId::KERNEL` means the task was injected
/// directly rather than mapped, so it is released to the scheduler
/// immediately instead of waiting on a `TASK_RELEASE`.
pub fn allocate<H: DmniHal, B: BrliteHal, S: SchedulerHal>(
    kernel: &mut Kernel<H, B, S>,
    body: AllocationBody,
    page: &mut [u8],
) -> Result<(), KernelError> {
    let text_len = flit_round(body.text_size);
    let data_len = flit_round(body.data_size);
    if page.len() < text_len + data_len {
        return Err(KernelError::InvalidArg);
    }

    kernel.dmni.recv(&mut page[..text_len])?;
    kernel.dmni.recv(&mut page[text_len..text_len + data_len])?;

    let app_index = kernel.find_or_insert_app(body.task.app())?;
    let mapper = Peer {
        task: body.mapper_task,
        addr: body.mapper_address,
    };

    let mut tcb = Tcb::new(body.task, app_index, mapper, body.entry_point);
    let heap_end = body.entry_point + body.data_size + body.bss_size;
    tcb.set_sizes(body.text_size, body.data_size, body.bss_size, heap_end);

    kernel.app_mut(app_index).unwrap().app_refer();
    kernel.insert_task(tcb)?;

    if body.mapper_task == TaskId::KERNEL {
        kernel.scheduler.mark_runnable(body.task);
        return Ok(());
    }

    // TASK_ALLOCATED notice: just the allocated task's id, so the mapper
    // can match it against the request it sent.
    messaging::post_kernel_message(kernel, mapper, &body.task.0.to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::fake::{FakeBrlite, FakeDmni, FakeScheduler};
    use abi::TileAddr;

    fn kernel() -> Kernel<FakeDmni, FakeBrlite, FakeScheduler> {
        Kernel::new(
            TileAddr::new(0, 0),
            FakeDmni::default(),
            FakeBrlite::default(),
            FakeScheduler::default(),
        )
    }

    fn body(mapper_task: TaskId) -> AllocationBody {
        AllocationBody {
            entry_point: 0x1000,
            text_size: 4,
            data_size: 4,
            bss_size: 8,
            task: TaskId::for_app_and_index(2, 0),
            mapper_address: TileAddr::new(1, 1),
            mapper_task,
        }
    }

    #[test]
    fn injected_task_is_released_immediately() {
        let mut k = kernel();
        k.dmni.hal_mut().recv_buf = std::vec![0u8; 8];
        let mut page = [0u8; 8];
        allocate(&mut k, body(TaskId::KERNEL), &mut page).unwrap();

        assert!(k.task(TaskId::for_app_and_index(2, 0)).is_some());
        assert_eq!(k.scheduler.runnable, std::vec![TaskId::for_app_and_index(2, 0)]);
    }

    #[test]
    fn mapped_task_is_announced_instead_of_released() {
        let mut k = kernel();
        k.dmni.hal_mut().recv_buf = std::vec![0u8; 8];
        let mut page = [0u8; 8];
        let mapper = TaskId::for_app_and_index(9, 0);
        allocate(&mut k, body(mapper), &mut page).unwrap();

        assert!(k.scheduler.runnable.is_empty());
        assert!(!k.kpipe.is_empty());
    }

    #[test]
    fn undersized_page_is_rejected() {
        let mut k = kernel();
        let mut page = [0u8; 4];
        assert_eq!(
            allocate(&mut k, body(TaskId::KERNEL), &mut page),
            Err(KernelError::InvalidArg)
        );
    }
}
