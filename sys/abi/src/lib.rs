// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire and ABI definitions shared between the kernel and every task on a
//! tile: addresses, the service catalog, Hermes/BrLite packet layouts, and
//! the kernel's error taxonomy. No behavior lives here, only the shapes
//! both sides of a syscall or a packet agree on.

#![no_std]

use core::marker::PhantomData;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use zerocopy::{AsBytes, FromBytes, Unaligned};

/// A task id: upper 8 bits are the application id, lower 8 bits are the
/// task's index within that application. `-1` in either field denotes
/// "kernel", which falls neatly out of the all-ones sentinel below.
#[derive(
    Copy, Clone, Eq, PartialEq, Default, Serialize, Deserialize, FromBytes, AsBytes, Unaligned,
)]
#[repr(transparent)]
pub struct TaskId(pub u16);

impl TaskId {
    /// The all-ones `TaskId` denotes the virtual kernel task: app id `0xFF`,
    /// task index `0xFF`, i.e. `-1` in both fields.
    pub const KERNEL: Self = Self(0xFFFF);

    pub const fn for_app_and_index(app: u8, index: u8) -> Self {
        Self(((app as u16) << 8) | index as u16)
    }

    pub const fn app(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub const fn index(self) -> u8 {
        self.0 as u8
    }

    pub const fn is_kernel(self) -> bool {
        self.0 == Self::KERNEL.0
    }
}

impl core::fmt::Debug for TaskId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_kernel() {
            write!(f, "TaskId(KERNEL)")
        } else {
            write!(f, "TaskId(app={}, index={})", self.app(), self.index())
        }
    }
}

/// A tile address, `XXYY`: upper byte is the X coordinate, lower byte is Y.
#[derive(
    Copy, Clone, Eq, PartialEq, Default, Serialize, Deserialize, FromBytes, AsBytes, Unaligned,
)]
#[repr(transparent)]
pub struct TileAddr(pub u16);

impl TileAddr {
    pub const fn new(x: u8, y: u8) -> Self {
        Self(((x as u16) << 8) | y as u16)
    }

    pub const fn x(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub const fn y(self) -> u8 {
        self.0 as u8
    }
}

impl core::fmt::Debug for TileAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "TileAddr({:#04x},{:#04x})", self.x(), self.y())
    }
}

/// A handshake destination: a tile, plus whether the peer at that tile is
/// the kernel itself rather than a user task on it. The `kernel_msg` bit
/// rides in the Hermes header's `flags` byte on the wire (`HermesFlags::
/// KERNEL_MSG`); `TileAddr` has no spare bits to OR it into.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct HandshakeTarget {
    pub tile: TileAddr,
    pub kernel_msg: bool,
}

bitflags! {
    /// Routing flags carried in a Hermes header. Bit 7 and bits 6:5 are the
    /// wire's existing `force_io`/`io_ports` fields and are preserved
    /// bit-exact; bit 0 is free in the source format and is used here for
    /// `KERNEL_MSG`.
    #[derive(Default, FromBytes, AsBytes, Unaligned)]
    #[repr(transparent)]
    pub struct HermesFlags: u8 {
        const KERNEL_MSG = 1 << 0;
        const IO_PORT_MASK = 0b0110_0000;
        const FORCE_IO = 1 << 7;
    }
}

/// Closed set of service codes shared by every tile. Numeric values below
/// `0x80` are unicast (Hermes) services; values with the high bit set are
/// legal on the broadcast network (BrLite) as well, per the wire format in
/// use.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum Service {
    DataAv = 0x20,
    MessageRequest = 0x21,
    MessageDelivery = 0x22,
    TaskAllocation = 0x23,
    TaskRelease = 0x24,
    TaskTerminated = 0x25,
    TaskAllocated = 0x26,
    TaskMigrated = 0x27,
    TaskAborted = 0x28,
    MigrationText = 0x29,
    MigrationData = 0x2A,
    MigrationStack = 0x2B,
    MigrationHdshk = 0x2C,
    MigrationPipe = 0x2D,
    MigrationTaskLocation = 0x2E,
    MigrationTcb = 0x2F,
    AbortTask = 0x30,
    TaskMigration = 0x31,
    /// Broadcast-only services, high bit set, middle nibble zero.
    AnnounceMonitor = 0x80,
    ReleasePeripheral = 0x81,
    AppTerminated = 0x82,
    HaltPe = 0x83,
    PeHalted = 0x84,
    ClearMonTable = 0x85,
    Monitor = 0x86,
}

impl Service {
    /// True for the services legal to originate from a user task on the
    /// broadcast network: high bit set, middle nibble zero.
    pub const fn is_user_broadcastable(code: u8) -> bool {
        (code & 0x80) != 0 && (code & 0x70) == 0
    }
}

/// We use an explicit `TryFrom` instead of a derive so unknown codes (e.g. a
/// corrupted or future service) fail cleanly instead of panicking.
impl core::convert::TryFrom<u8> for Service {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        use Service::*;
        Ok(match x {
            0x20 => DataAv,
            0x21 => MessageRequest,
            0x22 => MessageDelivery,
            0x23 => TaskAllocation,
            0x24 => TaskRelease,
            0x25 => TaskTerminated,
            0x26 => TaskAllocated,
            0x27 => TaskMigrated,
            0x28 => TaskAborted,
            0x29 => MigrationText,
            0x2A => MigrationData,
            0x2B => MigrationStack,
            0x2C => MigrationHdshk,
            0x2D => MigrationPipe,
            0x2E => MigrationTaskLocation,
            0x2F => MigrationTcb,
            0x30 => AbortTask,
            0x31 => TaskMigration,
            0x80 => AnnounceMonitor,
            0x81 => ReleasePeripheral,
            0x82 => AppTerminated,
            0x83 => HaltPe,
            0x84 => PeHalted,
            0x85 => ClearMonTable,
            0x86 => Monitor,
            _ => return Err(()),
        })
    }
}

/// Hermes packet header: 4 bytes, little-endian, address first. This
/// mirrors the original C `hermes_t`'s in-memory layout exactly (the
/// `{flags, service, address}` wire-order note in that header refers to
/// conceptual field significance, not byte order).
#[derive(Copy, Clone, Debug, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct HermesHeader {
    pub address: u16,
    pub service: u8,
    pub flags: u8,
}

/// Handshake body, used by `DATA_AV` and `MESSAGE_REQUEST`.
#[derive(Copy, Clone, Debug, Default, PartialEq, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct HandshakeBody {
    pub source: u32,
    pub receiver: TaskId,
    pub sender: TaskId,
}

/// `MESSAGE_DELIVERY` body: a handshake plus a send timestamp and payload
/// size; the payload itself follows on the wire.
#[derive(Copy, Clone, Debug, Default, PartialEq, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct DeliveryBody {
    pub handshake: HandshakeBody,
    pub timestamp: u32,
    pub size: u32,
}

/// `TASK_ALLOCATION` body; text+data+bss payload follows.
#[derive(Copy, Clone, Debug, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct AllocationBody {
    pub entry_point: u32,
    pub text_size: u32,
    pub data_size: u32,
    pub bss_size: u32,
    pub task: TaskId,
    pub mapper_address: TileAddr,
    pub mapper_task: TaskId,
}

/// `MIGRATION_TEXT` body; code payload follows.
#[derive(Copy, Clone, Debug, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct MigrationTextBody {
    pub size: u32,
    pub task: TaskId,
    pub mapper_address: TileAddr,
    pub mapper_task: TaskId,
}

/// `MIGRATION_DATA` body; data+bss+heap payload follows.
#[derive(Copy, Clone, Debug, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct MigrationDataBody {
    pub data_size: u32,
    pub bss_size: u32,
    pub heap_size: u32,
    pub task: TaskId,
}

/// `MIGRATION_STACK` body; stack payload follows.
#[derive(Copy, Clone, Debug, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct MigrationStackBody {
    pub size: u32,
    pub task: TaskId,
}

/// `MIGRATION_HDSHK` body; a vector of `(peer_task, peer_addr)` pairs
/// follows: `data_avs` entries then `msg_requests` entries.
#[derive(Copy, Clone, Debug, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct MigrationHandshakeBody {
    pub task: TaskId,
    pub available_count: u8,
    pub requested_count: u8,
}

/// `MIGRATION_PIPE` body; `pipe_out` buffer follows, if one was present.
#[derive(Copy, Clone, Debug, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct MigrationPipeBody {
    pub task: TaskId,
    pub receiver: TaskId,
    pub size: u32,
}

/// `MIGRATION_TASK_LOCATION` body; the app's location vector follows.
#[derive(Copy, Clone, Debug, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct MigrationTaskLocationBody {
    pub task: TaskId,
    pub task_count: u8,
}

/// `MIGRATION_TCB` body; the register file follows as payload.
#[derive(Copy, Clone, Debug, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct MigrationTcbBody {
    pub pc: u32,
    pub exec_time: u32,
    pub period: u32,
    pub deadline: i32,
    pub task: TaskId,
    pub source: TileAddr,
    pub received: u16,
    pub waiting: u8,
}

/// `TASK_RELEASE` body: releases an already-allocated task to run, carrying
/// the app's initial location table so siblings can find each other. The
/// location payload follows on the wire in the same shape
/// `MIGRATION_TASK_LOCATION` uses.
#[derive(Copy, Clone, Debug, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct TaskReleaseBody {
    pub task: TaskId,
    pub task_count: u8,
}

/// `ABORT_TASK` body: names the task to terminate, wherever it currently
/// lives -- a tile that no longer hosts it must forward this to the
/// migration destination recorded in its migration table.
#[derive(Copy, Clone, Debug, Default, PartialEq, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct AbortTaskBody {
    pub task: TaskId,
}

/// `TASK_MIGRATION` body: the mapper's instruction to move `task` to
/// `target_addr`.
#[derive(Copy, Clone, Debug, Default, PartialEq, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct TaskMigrationBody {
    pub task: TaskId,
    pub target_addr: TileAddr,
}

/// A peer task/tile pair, as stored in `msg_requests`/`data_avs` and
/// shipped whole in `MIGRATION_HDSHK`'s payload.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct Peer {
    pub task: TaskId,
    pub addr: TileAddr,
}

/// BrLite broadcast packet: service, source tile, 16-bit payload. This is
/// the newer, 16-bit-payload wire format (see Design Notes).
#[derive(Copy, Clone, Debug, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct BrlitePacket {
    pub service: u8,
    pub src_addr: TileAddr,
    pub payload: u16,
}

/// Tagged union over every packet the kernel can receive, replacing a
/// void-pointer-plus-switch decode with a type the compiler checks.
#[derive(Clone, Debug)]
pub enum Packet {
    DataAv {
        header: HermesHeader,
        body: HandshakeBody,
    },
    MessageRequest {
        header: HermesHeader,
        body: HandshakeBody,
    },
    MessageDelivery {
        header: HermesHeader,
        body: DeliveryBody,
    },
    TaskAllocation {
        header: HermesHeader,
        body: AllocationBody,
    },
    MigrationText {
        header: HermesHeader,
        body: MigrationTextBody,
    },
    MigrationData {
        header: HermesHeader,
        body: MigrationDataBody,
    },
    MigrationStack {
        header: HermesHeader,
        body: MigrationStackBody,
    },
    MigrationHdshk {
        header: HermesHeader,
        body: MigrationHandshakeBody,
    },
    MigrationPipe {
        header: HermesHeader,
        body: MigrationPipeBody,
    },
    MigrationTaskLocation {
        header: HermesHeader,
        body: MigrationTaskLocationBody,
    },
    MigrationTcb {
        header: HermesHeader,
        body: MigrationTcbBody,
    },
    TaskRelease {
        header: HermesHeader,
        body: TaskReleaseBody,
    },
    AbortTask {
        header: HermesHeader,
        body: AbortTaskBody,
    },
    TaskMigration {
        header: HermesHeader,
        body: TaskMigrationBody,
    },
}

/// The reason a syscall returned `KernelError::Retry`: the wait state the
/// calling task was just placed in, and the event that will clear it.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Blocked {
    /// Waiting for a free `pipe_out` slot (a write is already buffered).
    MessageRequest,
    /// Waiting for a `DATA_AV` to arrive.
    DataAv,
    /// Waiting for a `MESSAGE_DELIVERY` to arrive.
    Delivery,
    /// The DMNI send channel is busy; retry once it frees.
    DmniBusy,
    /// `halt_try` preconditions not yet satisfied.
    Halt,
}

/// Error taxonomy shared by every kernel entry point.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum KernelError {
    /// Malformed size (non-multiple of flit), null required pointer,
    /// out-of-range app id.
    InvalidArg,
    /// Task not resident and not migrated.
    NotFound,
    /// Allocation failure for a packet or a pipe slot.
    NoMemory,
    /// Same-tile pipe copy mismatch (size or receiver).
    BadMessage,
    /// Must re-issue on the next interrupt; see `Blocked` for why.
    Retry(Blocked),
    /// A user task attempted a management-only operation.
    Unauthorized,
}

impl From<Blocked> for KernelError {
    fn from(b: Blocked) -> Self {
        KernelError::Retry(b)
    }
}

/// Syscall numbers a task traps into the kernel with, carried in `a7` on the
/// `ecall` that crosses the M-mode boundary. Grounded in the original
/// `sys_syscall` dispatch table (`src/include/syscall.h`), narrowed to the
/// operations this kernel actually implements: the messaging rendezvous
/// pair, real-time registration, management broadcast send, and the three
/// read-only identity/time queries. File I/O, `brk`, raw-packet send,
/// `end_simulation`, and `safelog` are present in the original but outside
/// this kernel's scope.
#[repr(u32)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Sysnum {
    Write = 0,
    Read = 1,
    Realtime = 2,
    BroadcastSend = 3,
    GetLocation = 4,
    GetPid = 5,
    GetTick = 6,
}

impl core::convert::TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Write),
            1 => Ok(Self::Read),
            2 => Ok(Self::Realtime),
            3 => Ok(Self::BroadcastSend),
            4 => Ok(Self::GetLocation),
            5 => Ok(Self::GetPid),
            6 => Ok(Self::GetTick),
            _ => Err(()),
        }
    }
}

/// A value a syscall produced when it ran to completion, as opposed to
/// blocking. Plain alias: the "completed" half of `Result<Completed<T>,
/// KernelError>`, with the `Blocked` cause folded into `KernelError::Retry`
/// rather than kept as a second error type, so one `?`-able `Result`
/// threads through every messaging entry point.
pub type Completed<T> = T;

/// Scheduler-visible wait state of a TCB, set by the messaging core and
/// read (never written) by the external scheduler.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum SchedState {
    #[default]
    Runnable,
    WaitingDataAv,
    WaitingMessageRequest,
    WaitingMessageDelivery,
    Stopped,
}

/// Whether an ISR handler wants the scheduler invoked before returning to
/// user code. Combines like a boolean OR across however many handlers ran
/// during one dispatch.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct ScheduleHint(pub bool);

impl ScheduleHint {
    pub const NONE: Self = Self(false);
    pub const RUN: Self = Self(true);

    pub fn combine(self, other: Self) -> Self {
        Self(self.0 || other.0)
    }
}

/// A typed, unresolved user-space pointer: a task id and a byte offset
/// within that task's address space. Replaces "OR the raw pointer with the
/// page offset": the only way to get a real pointer back out is through
/// `as_kernel_ptr`, which takes the task's current page offset explicitly.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct UserPtr<T> {
    pub task: TaskId,
    pub offset: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> UserPtr<T> {
    pub const fn new(task: TaskId, offset: u32) -> Self {
        Self {
            task,
            offset,
            _marker: PhantomData,
        }
    }

    /// Resolves this pointer against `page_offset`, the base address of the
    /// owning task's data page. Callers are responsible for having checked
    /// that `offset..offset + size_of::<T>()` lies within the task's page
    /// before dereferencing the result.
    ///
    /// # Safety
    /// The caller must ensure `page_offset + self.offset` is a valid,
    /// correctly-aligned address for `T` within the owning task's memory.
    pub unsafe fn as_kernel_ptr(&self, page_offset: u32) -> *mut T {
        (page_offset.wrapping_add(self.offset)) as *mut T
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_kernel_is_all_ones_in_both_fields() {
        assert_eq!(TaskId::KERNEL.app(), 0xFF);
        assert_eq!(TaskId::KERNEL.index(), 0xFF);
        assert!(TaskId::KERNEL.is_kernel());
    }

    #[test]
    fn task_id_round_trips_app_and_index() {
        let id = TaskId::for_app_and_index(3, 7);
        assert_eq!(id.app(), 3);
        assert_eq!(id.index(), 7);
        assert!(!id.is_kernel());
    }

    #[test]
    fn tile_addr_round_trips_xy() {
        let a = TileAddr::new(2, 9);
        assert_eq!(a.x(), 2);
        assert_eq!(a.y(), 9);
    }

    #[test]
    fn service_round_trips_through_try_from() {
        use core::convert::TryFrom;
        assert_eq!(Service::try_from(0x20), Ok(Service::DataAv));
        assert_eq!(Service::try_from(0x31), Ok(Service::TaskMigration));
        assert_eq!(Service::try_from(0xEE), Err(()));
    }

    #[test]
    fn broadcast_eligibility_matches_high_bit_rule() {
        assert!(Service::is_user_broadcastable(0x80));
        assert!(!Service::is_user_broadcastable(0x20));
        assert!(!Service::is_user_broadcastable(0x90)); // middle nibble set
    }

    #[test]
    fn sysnum_round_trips_through_try_from() {
        use core::convert::TryFrom;
        assert_eq!(Sysnum::try_from(0), Ok(Sysnum::Write));
        assert_eq!(Sysnum::try_from(6), Ok(Sysnum::GetTick));
        assert_eq!(Sysnum::try_from(99), Err(()));
    }

    #[test]
    fn schedule_hint_combines_as_or() {
        assert_eq!(ScheduleHint::NONE.combine(ScheduleHint::NONE), ScheduleHint::NONE);
        assert_eq!(ScheduleHint::NONE.combine(ScheduleHint::RUN), ScheduleHint::RUN);
        assert_eq!(ScheduleHint::RUN.combine(ScheduleHint::RUN), ScheduleHint::RUN);
    }
}
