// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Narrow hardware boundary the portable kernel logic is built against.
//!
//! Everything here is a trait plus the plain data a board-support layer
//! fills in. Register-level CPU save/restore, the MPU/PMP, and the timer's
//! tick math are the board's problem; the kernel only stores and forwards
//! the bytes.

use abi::TileAddr;

/// Register file saved across a context switch. The kernel never
/// interprets its contents except during migration, where it is copied
/// verbatim into `MIGRATION_TCB`'s payload and restored verbatim on the
/// destination.
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct SavedState {
    pub regs: [u32; 32],
    pub pc: u32,
    pub sp: u32,
}

/// DMA Network Interface register access, per `spec.md` §4.1. Exactly one
/// implementation exists per board; `dmni::Dmni` wraps it with the
/// ownership-tracking and serialization logic that is architecture
/// independent.
pub trait DmniHal {
    /// True while the receive-active bit is set.
    fn recv_active(&self) -> bool;
    /// True while the send-active bit is set.
    fn send_active(&self) -> bool;
    /// Copies `dst.len()` bytes (a multiple of `FLIT_SIZE`) from the
    /// receive channel into `dst`.
    fn recv_flits(&mut self, dst: &mut [u8]);
    /// Discards `size` bytes from the receive channel without copying them
    /// anywhere.
    fn drop_flits(&mut self, size: usize);
    /// Programs a send of `pkt` followed by `pld` (if any) to `target`.
    fn program_send(&mut self, target: TileAddr, pkt: &[u8], pld: Option<&[u8]>);
}

/// BrLite broadcast register access.
pub trait BrliteHal {
    /// True while the broadcast send channel is busy.
    fn send_busy(&self) -> bool;
    /// Sends one packet; returns `false` if the channel was busy.
    fn send(&mut self, service: u8, payload: u16) -> bool;
    /// True while an inbound broadcast packet is waiting.
    fn recv_pending(&self) -> bool;
    /// Reads one inbound packet: `(service, src_addr, payload)`.
    fn recv(&mut self) -> (u8, TileAddr, u16);
}

/// Timer/RTC access, used only to stamp `MESSAGE_DELIVERY`'s timestamp
/// field and a migrating task's real-time parameters.
pub trait TimerHal {
    fn now(&self) -> u64;
}

/// Access to a tile's task-image memory: the physical page a task's
/// text/data/bss/heap and stack live in. Acquiring and mapping that page is
/// a board concern (MPU/PMP regions, the DMNI's page-size registers); the
/// kernel only ever asks for a slice sized by fields already carried on the
/// packet or the TCB.
pub trait MemoryHal {
    /// A destination for draining `len` bytes of `task`'s inbound image
    /// (a fresh allocation, or an inbound migration's data/bss/heap).
    /// `None` if the board has nowhere to put it.
    fn task_image_mut(&mut self, task: abi::TaskId, len: usize) -> Option<&mut [u8]>;
    /// A read-only view of `task`'s current image, to migrate it out.
    fn task_image(&self, task: abi::TaskId, len: usize) -> Option<&[u8]>;
    /// A destination for draining `len` bytes of `task`'s inbound stack.
    fn task_stack_mut(&mut self, task: abi::TaskId, len: usize) -> Option<&mut [u8]>;
    /// A read-only view of `task`'s current stack, from its saved stack
    /// pointer `sp` to the end of its data page -- the same way the
    /// original firmware sizes an outbound `MIGRATION_STACK` payload from
    /// the live stack pointer rather than a tracked size.
    fn task_stack(&self, task: abi::TaskId, sp: u32) -> Option<&[u8]>;
}

/// The scheduler is an external collaborator: an opaque handle the kernel
/// sets the wait reason on, never reads back from. Modeled as a trait so
/// tests can supply a fake without pulling in a real scheduler.
pub trait SchedulerHal {
    /// Records that `task` is now runnable and should be considered for
    /// scheduling on the next timer tick.
    fn mark_runnable(&mut self, task: abi::TaskId);
    /// Records that `task` has entered `reason` and should not be scheduled
    /// until the matching event clears it.
    fn mark_waiting(&mut self, task: abi::TaskId, reason: abi::SchedState);
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use abi::TaskId;

    #[derive(Default)]
    pub struct FakeDmni {
        pub recv_active: bool,
        pub send_active: bool,
        pub recv_buf: std::vec::Vec<u8>,
        pub last_send: Option<(TileAddr, std::vec::Vec<u8>, Option<std::vec::Vec<u8>>)>,
    }

    impl DmniHal for FakeDmni {
        fn recv_active(&self) -> bool {
            self.recv_active
        }
        fn send_active(&self) -> bool {
            self.send_active
        }
        fn recv_flits(&mut self, dst: &mut [u8]) {
            let n = dst.len().min(self.recv_buf.len());
            dst[..n].copy_from_slice(&self.recv_buf[..n]);
            self.recv_buf.drain(..n);
        }
        fn drop_flits(&mut self, size: usize) {
            let n = size.min(self.recv_buf.len());
            self.recv_buf.drain(..n);
        }
        fn program_send(&mut self, target: TileAddr, pkt: &[u8], pld: Option<&[u8]>) {
            self.last_send = Some((target, pkt.to_vec(), pld.map(|p| p.to_vec())));
        }
    }

    #[derive(Default)]
    pub struct FakeScheduler {
        pub runnable: std::vec::Vec<TaskId>,
        pub waiting: std::vec::Vec<(TaskId, abi::SchedState)>,
    }

    impl SchedulerHal for FakeScheduler {
        fn mark_runnable(&mut self, task: TaskId) {
            self.runnable.push(task);
        }
        fn mark_waiting(&mut self, task: TaskId, reason: abi::SchedState) {
            self.waiting.push((task, reason));
        }
    }

    #[derive(Default)]
    pub struct FakeBrlite {
        pub send_busy: bool,
        pub recv_pending: bool,
        pub recv_value: (u8, TileAddr, u16),
        pub sent: Option<(u8, u16)>,
    }

    impl BrliteHal for FakeBrlite {
        fn send_busy(&self) -> bool {
            self.send_busy
        }
        fn send(&mut self, service: u8, payload: u16) -> bool {
            if self.send_busy {
                return false;
            }
            self.sent = Some((service, payload));
            true
        }
        fn recv_pending(&self) -> bool {
            self.recv_pending
        }
        fn recv(&mut self) -> (u8, TileAddr, u16) {
            self.recv_value
        }
    }

    #[derive(Default)]
    pub struct FakeTimer {
        pub now: u64,
    }

    impl super::TimerHal for FakeTimer {
        fn now(&self) -> u64 {
            self.now
        }
    }

    /// A single fixed-size arena standing in for per-tile task memory.
    /// Every `task_*` accessor hands back the same backing storage
    /// regardless of `task`, which is enough to exercise the ISR's
    /// buffer-sizing logic without modeling a real page table.
    pub struct FakeMemory {
        pub image: std::vec::Vec<u8>,
        pub stack: std::vec::Vec<u8>,
        pub refuse: bool,
    }

    impl Default for FakeMemory {
        fn default() -> Self {
            Self {
                image: std::vec![0u8; 65536],
                stack: std::vec![0u8; 65536],
                refuse: false,
            }
        }
    }

    impl super::MemoryHal for FakeMemory {
        fn task_image_mut(&mut self, _task: TaskId, len: usize) -> Option<&mut [u8]> {
            if self.refuse || len > self.image.len() {
                return None;
            }
            Some(&mut self.image[..len])
        }
        fn task_image(&self, _task: TaskId, len: usize) -> Option<&[u8]> {
            if self.refuse || len > self.image.len() {
                return None;
            }
            Some(&self.image[..len])
        }
        fn task_stack_mut(&mut self, _task: TaskId, len: usize) -> Option<&mut [u8]> {
            if self.refuse || len > self.stack.len() {
                return None;
            }
            Some(&mut self.stack[..len])
        }
        fn task_stack(&self, _task: TaskId, sp: u32) -> Option<&[u8]> {
            if self.refuse {
                return None;
            }
            let len = (self.stack.len() as u32).saturating_sub(sp) as usize;
            self.stack.get(..len)
        }
    }
}
