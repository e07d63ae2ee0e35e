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

//! Per-job hardware deadlines.
//!
//! A running job holds exactly one deadline, indexed by its job id, so the
//! table never grows and servicing it never allocates. The hardware timer
//! is always armed for the earliest outstanding deadline.

use cantrip_g2d_interface::HardwareTimer;
use cantrip_g2d_shared::*;
use core::time::Duration;

pub struct Watchdog {
    deadlines: [Option<Ticks>; MAX_JOBS],
}
impl Watchdog {
    pub const fn new() -> Self {
        Watchdog {
            deadlines: [None; MAX_JOBS],
        }
    }

    /// Arms (or re-arms) |job_id| to expire |timeout| from now.
    pub fn arm(&mut self, job_id: JobId, timeout: Duration, timer: &impl HardwareTimer) {
        self.deadlines[job_id as usize] = Some(timer.deadline(timeout));
        self.set_alarm(timer);
    }

    /// Drops the deadline for |job_id|. Returns false if none was pending.
    pub fn cancel(&mut self, job_id: JobId) -> bool {
        match self.deadlines.get_mut(job_id as usize) {
            Some(deadline) => deadline.take().is_some(),
            None => false,
        }
    }

    /// Removes and returns the earliest deadline that has passed at |now|.
    pub fn pop_expired(&mut self, now: Ticks) -> Option<JobId> {
        let (job_id, _) = self
            .deadlines
            .iter()
            .enumerate()
            .filter_map(|(id, deadline)| deadline.map(|d| (id, d)))
            .filter(|(_, deadline)| *deadline <= now)
            .min_by_key(|(_, deadline)| *deadline)?;
        self.deadlines[job_id] = None;
        Some(job_id as JobId)
    }

    pub fn next_deadline(&self) -> Option<Ticks> { self.deadlines.iter().flatten().min().copied() }

    // Next deadline is always what the hardware timer waits for.
    pub fn set_alarm(&self, timer: &impl HardwareTimer) {
        if let Some(deadline) = self.next_deadline() {
            timer.set_alarm(deadline);
        }
    }
}
