// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An implementation to support the `critical-section` crate within a task
//! running on this kernel.
//!
//! A task has no threads and no non-local control flow of its own: the only
//! thing that can interrupt it is the kernel itself, on a trap or the timer
//! tick, and the kernel does not resume the task mid-critical-section behind
//! its own back. So within a single task there is nothing to generate code
//! for -- a critical section already holds by construction.
//!
//! Opt out of this if you're doing something unusual with memory shared
//! outside the task's own control flow; by default nothing here depends on
//! it.

use critical_section::RawRestoreState;

struct TaskCriticalSection;
critical_section::set_impl!(TaskCriticalSection);

unsafe impl critical_section::Impl for TaskCriticalSection {
    #[inline(always)]
    unsafe fn acquire() -> RawRestoreState {
        // No action required.
    }

    #[inline(always)]
    unsafe fn release(_token: RawRestoreState) {
        // Again, no action required.
    }
}
