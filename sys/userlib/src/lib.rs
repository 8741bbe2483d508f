// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! User application support library: syscall stubs, the task entry point,
//! and the panic handler every task links against.
//!
//! This re-exports `abi`, the wire vocabulary shared with the kernel, and
//! adds the handful of functions that actually cross the M-mode boundary.
//!
//! # Syscall stubs
//!
//! Each syscall is one function containing a single inline `asm!` block:
//! load the syscall number into `a7`, `ecall`, and the result is already in
//! `a0` when control returns. There is no register-spill dance here the way
//! there is on some architectures -- the RISC-V calling convention already
//! puts the first eight integer arguments in `a0`..`a7`, which are all
//! directly nameable from `asm!`, so the wrapper function's own arguments
//! land exactly where the trap needs them with nothing to shuffle.

#![no_std]
#![feature(asm)]
#![feature(naked_functions)]

pub use abi::*;

pub mod critical_section;
pub mod hl;

use core::arch::asm;

/// Errors a syscall can report back across the `ecall` boundary. This is
/// narrower than the kernel's own `KernelError`: `Retry` never crosses the
/// boundary (the kernel re-runs a blocked task's `ecall` instruction itself
/// once the event it is waiting on arrives, so from user code a blocking
/// syscall simply takes a while to return), and `NoMemory` is a
/// kernel-internal allocation failure a task never triggers directly.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SyscallError {
    InvalidArg,
    NotFound,
    BadMessage,
    Unauthorized,
    /// `maestro_broadcast_send` only: the BrLite send channel was busy.
    Busy,
}

const RC_INVALID_ARG: i32 = -1;
const RC_NOT_FOUND: i32 = -2;
const RC_BAD_MESSAGE: i32 = -3;
const RC_UNAUTHORIZED: i32 = -4;

fn decode_rc(rc: i32) -> Result<usize, SyscallError> {
    if rc >= 0 {
        return Ok(rc as usize);
    }
    Err(match rc {
        RC_INVALID_ARG => SyscallError::InvalidArg,
        RC_NOT_FOUND => SyscallError::NotFound,
        RC_BAD_MESSAGE => SyscallError::BadMessage,
        _ => SyscallError::Unauthorized,
    })
}

/// Writes `buf` to `receiver`, per the rendezvous write algorithm (`spec.md`
/// §4.3). If `sync` is set the call does not return until `receiver` has
/// posted a matching read; otherwise the kernel buffers the message in
/// `pipe_out` and returns once it has been handed to the DMNI or queued.
#[inline(always)]
pub fn maestro_write(receiver: TaskId, buf: &[u8], sync: bool) -> Result<usize, SyscallError> {
    let rc: i32;
    unsafe {
        asm!(
            "ecall",
            in("a0") receiver.0 as u32,
            in("a1") buf.as_ptr(),
            in("a2") buf.len(),
            in("a3") sync as u32,
            in("a7") Sysnum::Write as u32,
            lateout("a0") rc,
        );
    }
    decode_rc(rc)
}

/// Reads into `buf` from `producer`, the read half of the same algorithm.
#[inline(always)]
pub fn maestro_read(
    producer: TaskId,
    buf: &mut [u8],
    sync: bool,
) -> Result<usize, SyscallError> {
    let rc: i32;
    unsafe {
        asm!(
            "ecall",
            in("a0") producer.0 as u32,
            in("a1") buf.as_mut_ptr(),
            in("a2") buf.len(),
            in("a3") sync as u32,
            in("a7") Sysnum::Read as u32,
            lateout("a0") rc,
        );
    }
    decode_rc(rc)
}

/// Registers this task's real-time scheduling parameters: `period` and
/// `deadline` in tick units, `exec_time` the task's own estimate of its
/// worst-case execution time. Always succeeds for a resident task.
#[inline(always)]
pub fn maestro_realtime(period: u32, deadline: u32, exec_time: u32) {
    unsafe {
        asm!(
            "ecall",
            in("a0") period,
            in("a1") deadline,
            in("a2") exec_time,
            in("a7") Sysnum::Realtime as u32,
            lateout("a0") _,
        );
    }
}

/// Sends one BrLite broadcast packet. Management-only: a non-management
/// task gets `Unauthorized`. `Busy` means the send channel was already
/// occupied; unlike `maestro_write`/`maestro_read` the kernel does not park
/// the caller waiting for it to free, matching the original firmware's
/// three-way `sys_br_send` return.
#[inline(always)]
pub fn maestro_broadcast_send(service: u8, payload: u16) -> Result<(), SyscallError> {
    let rc: i32;
    unsafe {
        asm!(
            "ecall",
            in("a0") service as u32,
            in("a1") payload as u32,
            in("a7") Sysnum::BroadcastSend as u32,
            lateout("a0") rc,
        );
    }
    match rc {
        0 => Ok(()),
        1 => Err(SyscallError::Busy),
        _ => Err(SyscallError::Unauthorized),
    }
}

/// This tile's own address on the mesh.
#[inline(always)]
pub fn maestro_get_location() -> TileAddr {
    let rc: u32;
    unsafe {
        asm!(
            "ecall",
            in("a7") Sysnum::GetLocation as u32,
            lateout("a0") rc,
        );
    }
    TileAddr(rc as u16)
}

/// The calling task's own id.
#[inline(always)]
pub fn maestro_getpid() -> TaskId {
    let rc: u32;
    unsafe {
        asm!(
            "ecall",
            in("a7") Sysnum::GetPid as u32,
            lateout("a0") rc,
        );
    }
    TaskId(rc as u16)
}

/// The kernel's free-running tick counter.
#[inline(always)]
pub fn maestro_get_tick() -> u32 {
    let rc: u32;
    unsafe {
        asm!(
            "ecall",
            in("a7") Sysnum::GetTick as u32,
            lateout("a0") rc,
        );
    }
    rc
}

#[no_mangle]
#[link_section = ".text.start"]
#[naked]
pub unsafe extern "C" fn _start() -> ! {
    // Provided by the user program:
    extern "Rust" {
        fn main() -> !;
    }

    asm!(
        "
        // Copy data initialization image into the data section, then zero
        // bss. Both sections are assumed word-aligned and padded to a
        // 4-byte boundary by the linker script.
        la   t0, __sidata
        la   t1, __sdata
        la   t2, __edata
    1:  bge  t1, t2, 2f
        lw   t3, 0(t0)
        sw   t3, 0(t1)
        addi t0, t0, 4
        addi t1, t1, 4
        j    1b

    2:  la   t0, __sbss
        la   t1, __ebss
    3:  bge  t0, t1, 4f
        sw   zero, 0(t0)
        addi t0, t0, 4
        j    3b

    4:  call {main}
        // main() never returns; trap if it somehow does.
        unimp
        ",
        main = sym main,
        options(noreturn),
    )
}

/// This architecture has no panic-message syscall: the original firmware's
/// syscall table has nothing playing that role, since a crashing task is
/// expected to fault rather than call out. `ebreak` raises the same illegal
/// instruction/fault condition the kernel's fault-abort path already
/// handles for a stack overflow or unknown syscall number (`spec.md` §4.7),
/// which aborts the task and posts `TASK_ABORTED` to its mapper.
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe {
        asm!("ebreak", options(noreturn));
    }
}
