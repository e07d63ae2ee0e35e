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

//! fake-g2d-core is an in-memory stand-in for the G2D job manager. It
//! models a single execution pipe fed by a FIFO of queued jobs, latches
//! completion and error bits the way the register file does, and records
//! every push/kill/reset so tests can check what the scheduler asked for.
//!
//! Clones share state: hand one clone to the scheduler and drive the
//! hardware from another.

extern crate alloc;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use cantrip_g2d_interface::{G2dHardware, HardwareTimer, HwError, HwJob};
use cantrip_g2d_shared::*;
use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use log::trace;
use spin::Mutex;

pub const FAKE_VERSION: u32 = 0x0510_0000;

#[derive(Default)]
struct FakeState {
    jobs: [Option<JobState>; MAX_JOBS],
    // Jobs accepted but not yet executing, in push order.
    queue: VecDeque<JobId>,
    running: Option<JobId>,
    finished: JobMask,
    errint: u32,
    fail_next_push: Option<HwError>,
    // Kill aborts the job and raises its completion bit.
    honor_kill: bool,

    pushed: Vec<JobId>,
    killed: Vec<JobId>,
    resets: usize,
    cleared_job_ids: JobMask,
    cleared_int: u32,
    iommu_deactivations: usize,
}
impl FakeState {
    // Starts the oldest queued job if the pipe is idle.
    fn advance(&mut self) {
        if self.running.is_some() {
            return;
        }
        if let Some(next) = self.queue.pop_front() {
            self.jobs[next as usize] = Some(JobState::Running);
            self.running = Some(next);
        }
    }

    fn finish(&mut self, job_id: JobId) {
        self.queue.retain(|id| *id != job_id);
        if self.running == Some(job_id) {
            self.running = None;
        }
        self.jobs[job_id as usize] = Some(JobState::Done);
        self.finished |= job_bit(job_id);
        self.advance();
    }
}

#[derive(Clone, Default)]
pub struct FakeG2dCore {
    state: Arc<Mutex<FakeState>>,
}
impl FakeG2dCore {
    pub fn new() -> Self { Self::default() }

    /// Completes |job_id| as if the hardware had finished it.
    pub fn complete(&self, job_id: JobId) { self.state.lock().finish(job_id); }

    /// Raises a completion bit without touching job state, e.g. to replay
    /// an interrupt for a job that was already retired.
    pub fn raise_finished(&self, mask: JobMask) { self.state.lock().finished |= mask; }

    /// Latches |status| in the error interrupt register.
    pub fn raise_error(&self, status: u32) { self.state.lock().errint |= status; }

    pub fn set_job_state(&self, job_id: JobId, job_state: JobState) {
        self.state.lock().jobs[job_id as usize] = Some(job_state);
    }

    pub fn fail_next_push(&self, err: HwError) { self.state.lock().fail_next_push = Some(err); }

    pub fn set_honor_kill(&self, honor: bool) { self.state.lock().honor_kill = honor; }

    pub fn running(&self) -> Option<JobId> { self.state.lock().running }
    pub fn pushed(&self) -> Vec<JobId> { self.state.lock().pushed.clone() }
    pub fn killed(&self) -> Vec<JobId> { self.state.lock().killed.clone() }
    pub fn resets(&self) -> usize { self.state.lock().resets }
    pub fn cleared_job_ids(&self) -> JobMask { self.state.lock().cleared_job_ids }
    pub fn cleared_int(&self) -> u32 { self.state.lock().cleared_int }
    pub fn iommu_deactivations(&self) -> usize { self.state.lock().iommu_deactivations }

    /// Bitmask of jobs the hardware currently holds, queued or running.
    pub fn occupied(&self) -> JobMask {
        let state = self.state.lock();
        let mut mask = 0;
        for (id, job) in state.jobs.iter().enumerate() {
            if matches!(job, Some(JobState::Queueing | JobState::Running)) {
                mask |= job_bit(id as JobId);
            }
        }
        mask
    }
}

impl G2dHardware for FakeG2dCore {
    fn version(&mut self) -> u32 { FAKE_VERSION }

    fn push(&mut self, job: &HwJob) -> Result<(), HwError> {
        let mut state = self.state.lock();
        if let Some(err) = state.fail_next_push.take() {
            return Err(err);
        }
        let slot = &mut state.jobs[job.job_id as usize];
        if matches!(slot, Some(JobState::Queueing | JobState::Running)) {
            return Err(HwError::SlotBusy);
        }
        trace!("PUSH job {} ({} commands)", job.job_id, job.commands.len());
        *slot = Some(JobState::Queueing);
        state.pushed.push(job.job_id);
        state.queue.push_back(job.job_id);
        state.advance();
        Ok(())
    }

    fn kill(&mut self, job_id: JobId) {
        let mut state = self.state.lock();
        trace!("KILL job {}", job_id);
        state.killed.push(job_id);
        if state.honor_kill {
            state.finish(job_id);
        }
    }

    fn global_reset(&mut self) {
        let mut state = self.state.lock();
        trace!("GLOBAL RESET");
        state.jobs = [None; MAX_JOBS];
        state.queue.clear();
        state.running = None;
        state.finished = 0;
        state.errint = 0;
        state.resets += 1;
    }

    fn finished_job_ids(&mut self) -> JobMask { self.state.lock().finished }

    fn clear_job_ids(&mut self, mask: JobMask) {
        let mut state = self.state.lock();
        state.finished &= !mask;
        state.cleared_job_ids |= mask;
        for id in job_ids(mask) {
            if state.jobs[id as usize] == Some(JobState::Done) {
                state.jobs[id as usize] = None;
            }
        }
    }

    fn errint_status(&mut self) -> u32 { self.state.lock().errint }

    fn clear_int(&mut self, status: u32) {
        let mut state = self.state.lock();
        state.errint &= !status;
        state.cleared_int |= status;
    }

    fn current_job_id(&mut self) -> Option<JobId> { self.state.lock().running }

    fn job_state(&mut self, job_id: JobId) -> JobState {
        self.state.lock().jobs[job_id as usize].unwrap_or(JobState::Idle)
    }

    fn iommu_deactivate(&mut self) { self.state.lock().iommu_deactivations += 1; }
}

/// A manually advanced clock. Time only moves when a test says so.
#[derive(Clone)]
pub struct FakeTimer {
    now: Arc<AtomicU64>,
    alarm: Arc<AtomicU64>,
}
impl Default for FakeTimer {
    fn default() -> Self {
        Self {
            now: Arc::new(AtomicU64::new(0)),
            alarm: Arc::new(AtomicU64::new(Ticks::MAX)),
        }
    }
}
impl FakeTimer {
    pub fn new() -> Self { Self::default() }

    pub fn advance(&self, duration: Duration) {
        self.now
            .fetch_add(duration.as_micros() as Ticks, Ordering::SeqCst);
    }

    /// The deadline most recently armed, if any.
    pub fn alarm(&self) -> Option<Ticks> {
        match self.alarm.load(Ordering::SeqCst) {
            Ticks::MAX => None,
            deadline => Some(deadline),
        }
    }

    /// True once the armed deadline has passed.
    pub fn alarm_expired(&self) -> bool {
        self.alarm()
            .map_or(false, |deadline| deadline <= self.now.load(Ordering::SeqCst))
    }
}
impl HardwareTimer for FakeTimer {
    fn ack_interrupt(&self) { self.alarm.store(Ticks::MAX, Ordering::SeqCst); }

    fn now(&self) -> Ticks { self.now.load(Ordering::SeqCst) }

    fn set_alarm(&self, deadline: Ticks) { self.alarm.store(deadline, Ordering::SeqCst); }
}
