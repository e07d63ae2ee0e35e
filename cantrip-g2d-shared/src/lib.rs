// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![cfg_attr(not(test), no_std)]

// Data structures used throughout the Cantrip G2D implementation that do
// not depend on the scheduler or on any particular hardware backend.

use modular_bitfield::prelude::*;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use static_assertions::const_assert;

/// The number of jobs the G2D job manager can hold at once. Each job is
/// identified to the hardware by one bit of a JobMask.
pub const MAX_JOBS: usize = 16;

/// Default number of task records in the pool.
pub const DEFAULT_NUM_TASKS: usize = MAX_JOBS;

/// Depth of the stamp ring. Must be a power of two so the write index can
/// be masked instead of divided.
pub const MAX_STAMPS: usize = 1024;

/// Upper bound on register writes carried by a single task.
pub const MAX_COMMANDS: usize = 1024;

/// Number of source layers the hardware composes (Layer0..Layer15).
pub const MAX_IMAGES: usize = 16;

/// Size of the register file; command offsets must fall inside it.
pub const REG_SPACE_SIZE: u32 = 0x1_0000;

/// Time a job may occupy the hardware before the watchdog steps in.
pub const HW_TIMEOUT_MSEC: u64 = 500;

pub type JobId = u32;
pub type JobMask = u32;
// Microseconds on the scheduler's clock.
pub type Ticks = u64;

const_assert!(MAX_JOBS <= JobMask::BITS as usize);
const_assert!(MAX_STAMPS.is_power_of_two());
const_assert!(DEFAULT_NUM_TASKS > 0);

#[inline]
pub fn job_bit(id: JobId) -> JobMask { 1 << id }

/// Iterates the job ids set in |mask|, lowest first. Bits at or above
/// MAX_JOBS are ignored.
pub fn job_ids(mask: JobMask) -> impl Iterator<Item = JobId> {
    (0..MAX_JOBS as JobId).filter(move |id| (mask & job_bit(*id)) != 0)
}

/// Scheduler-side task state. The numeric values are what the stamp ring
/// records, so they must stay stable.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
pub enum TaskState {
    Free = 0,
    Prepared,
    Queueing,
    Running,
    Suspending,
    Done,
    Killed,
    Error,
}
impl TaskState {
    /// True once the task has been retired, whatever the outcome.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Killed | TaskState::Error)
    }
}

/// Job state as reported by the hardware job manager.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
pub enum JobState {
    Idle = 0,
    Queueing,
    Running,
    Suspending,
    Done,
}

/// Events recorded in the stamp ring.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
pub enum StampEvent {
    Begin = 0,
    Push,
    Int,
    Done,
    TimeoutHw,
    ErrInt,
    MmuFault,
    GlobalReset,
    ShutdownS,
    ShutdownE,
    SuspendS,
    SuspendE,
    Resume,
    PmResume,
    PmSuspend,
}
impl StampEvent {
    /// Events that warrant dumping the task that caused them.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            StampEvent::TimeoutHw | StampEvent::ErrInt | StampEvent::MmuFault
        )
    }
}

bitflags::bitflags! {
    pub struct TaskFlags: u32 {
        /// Return to the caller as soon as the task is handed to the hardware.
        const NONBLOCK = 0b00000001;
    }
}

/// Layout of the error interrupt status register. Only used to make the
/// error log readable; recovery does not depend on which bit fired.
#[bitfield]
#[derive(Debug)]
pub struct ErrStatus {
    pub read_fault: bool,
    pub write_fault: bool,
    pub afbc_fault: bool,
    pub sfr_fault: bool,
    pub secure_fault: bool,
    #[skip]
    _unused: B27,
}
impl From<u32> for ErrStatus {
    fn from(status: u32) -> Self { ErrStatus::from_bytes(status.to_ne_bytes()) }
}
