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

extern crate alloc;
use alloc::vec::Vec;
use cantrip_g2d_shared::*;
use core::time::Duration;
use num_enum::{FromPrimitive, IntoPrimitive};
use serde::{Deserialize, Serialize};

/// Errors that can occur when interacting with the G2D scheduler.
#[repr(usize)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromPrimitive, IntoPrimitive)]
pub enum G2dError {
    Success = 0,
    Busy,
    Fault,
    InvalidInput,
    NoSuchTask,
    Timeout,
    HardwareError,
    Shutdown,
    DeserializeError,
    SerializeError,
    #[default]
    UnknownError,
}
impl G2dError {
    /// The (negated) errno an ioctl-style caller expects.
    pub fn errno(&self) -> i32 {
        match self {
            G2dError::Success => 0,
            G2dError::Busy => -16,        // EBUSY
            G2dError::Fault => -14,       // EFAULT
            G2dError::InvalidInput => -22, // EINVAL
            G2dError::NoSuchTask => -2,   // ENOENT
            G2dError::Timeout => -110,    // ETIMEDOUT
            G2dError::HardwareError => -5, // EIO
            G2dError::Shutdown => -19,    // ENODEV
            G2dError::DeserializeError => -14,
            G2dError::SerializeError => -14,
            G2dError::UnknownError => -5,
        }
    }
}
impl From<G2dError> for Result<(), G2dError> {
    fn from(err: G2dError) -> Result<(), G2dError> {
        if err == G2dError::Success {
            Ok(())
        } else {
            Err(err)
        }
    }
}

/// The hardware refused a job handed to it by push.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HwError {
    /// The job manager already holds a job with this id.
    SlotBusy,
    /// The command list could not be loaded.
    Rejected,
}

/// A job as handed to the hardware: the job id it will be tracked under
/// and the register writes that program it.
pub struct HwJob<'a> {
    pub job_id: JobId,
    pub commands: &'a [Command],
}

/// Register-level access to the G2D job manager. Every method is a short,
/// non-blocking register operation; callers must hold the device lock as
/// the register file is not otherwise safe to share.
pub trait G2dHardware {
    /// Returns the hardware version word, read once at probe.
    fn version(&mut self) -> u32;
    /// Queues |job| for execution.
    fn push(&mut self, job: &HwJob) -> Result<(), HwError>;
    /// Forcibly aborts |job_id|; the hardware signals completion (or not)
    /// through the normal interrupt path.
    fn kill(&mut self, job_id: JobId);
    /// Re-initializes the whole block, discarding every queued job.
    fn global_reset(&mut self);
    /// Bitmask of jobs whose completion interrupt is pending.
    fn finished_job_ids(&mut self) -> JobMask;
    /// Acknowledges completion of the jobs in |mask|.
    fn clear_job_ids(&mut self, mask: JobMask);
    /// Pending error interrupt bits; zero when no error is latched.
    fn errint_status(&mut self) -> u32;
    /// Acknowledges the error interrupt bits in |status|.
    fn clear_int(&mut self, status: u32);
    /// The job the hardware is executing, if any.
    fn current_job_id(&mut self) -> Option<JobId>;
    fn job_state(&mut self, job_id: JobId) -> JobState;
    /// Detaches the IOMMU; called once on final shutdown.
    fn iommu_deactivate(&mut self) {}
}

/// A monotonic clock that can raise an interrupt at a deadline.
pub trait HardwareTimer {
    fn setup(&self) {}
    fn ack_interrupt(&self) {}
    // The current value of the timer.
    fn now(&self) -> Ticks;
    // Return the deadline `duration` in the future, in Ticks.
    fn deadline(&self, duration: Duration) -> Ticks {
        self.now() + duration.as_micros() as Ticks
    }
    fn set_alarm(&self, deadline: Ticks);
}

/// One register write: |value| goes to |offset| in the register file.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct Command {
    pub offset: u32,
    pub value: u32,
}

/// A buffer shared by the caller's memory subsystem. The scheduler only
/// carries the reference; it never maps or owns the memory.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct BufferRef {
    pub handle: u32,
    pub offset: u64,
    pub length: u64,
}

/// Everything a caller supplies for one G2D job.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct TaskData {
    /// Raw TaskFlags bits; unknown bits are rejected.
    pub flags: u32,
    pub commands: Vec<Command>,
    pub sources: Vec<BufferRef>,
    pub target: BufferRef,
}
impl TaskData {
    pub fn is_nonblocking(&self) -> bool { (self.flags & TaskFlags::NONBLOCK.bits()) != 0 }
}

/// Identifies one submission. |slot| names the pool entry, |seq| the
/// particular use of that entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct Ticket {
    pub slot: u32,
    pub seq: u64,
}

/// What a caller learns about a submission.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct CompletionInfo {
    pub ticket: Ticket,
    /// Raw TaskState; terminal once the job has been retired.
    pub state: u32,
    /// The hardware job id used for the run, if it reached the hardware.
    pub job_id: Option<JobId>,
    pub begin: Ticks,
    pub end: Ticks,
}
impl CompletionInfo {
    pub fn task_state(&self) -> TaskState {
        TaskState::try_from(self.state).unwrap_or(TaskState::Error)
    }

    pub fn elapsed_us(&self) -> Ticks { self.end.saturating_sub(self.begin) }
}

/// Requests accepted by the G2D component.
#[derive(Debug, Deserialize, Serialize)]
pub enum G2dRequest {
    Process(TaskData), // -> ProcessResponse
    Poll(Ticket),      // -> PollResponse

    // Returns a bit vector, where a 1 in bit N indicates job N has finished
    // since the last call. Outstanding bits are reset during this call.
    CompletedJobs, // -> CompletedJobsResponse

    DebugState,
    DumpStamps,

    // 0: quiet, 1: log each job's duration, 2: dump each finished task.
    SetDebugLevel(u32),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ProcessResponse {
    pub info: CompletionInfo,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PollResponse {
    pub info: Option<CompletionInfo>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CompletedJobsResponse {
    pub job_mask: JobMask,
}

// Size of the data buffer used to pass a serialized G2dRequest. Large
// enough for a full command list: each Command encodes in at most 10 bytes.
pub const G2D_REQUEST_DATA_SIZE: usize = 12 * 1024;
