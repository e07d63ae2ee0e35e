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

//! Hardware job id allocation. The job manager tracks at most MAX_JOBS
//! jobs, each named by one bit of a JobMask; this maps those ids onto the
//! tasks that currently hold them.

use crate::task::TaskIdx;
use cantrip_g2d_shared::*;

pub struct JobSlots {
    busy: JobMask,
    owner: [Option<TaskIdx>; MAX_JOBS],
}
impl JobSlots {
    pub const fn new() -> Self {
        JobSlots {
            busy: 0,
            owner: [None; MAX_JOBS],
        }
    }

    /// Claims the lowest free job id for |idx|.
    pub fn alloc(&mut self, idx: TaskIdx) -> Option<JobId> {
        let free = !self.busy & full_mask();
        if free == 0 {
            return None;
        }
        let job_id = free.trailing_zeros();
        self.busy |= job_bit(job_id);
        self.owner[job_id as usize] = Some(idx);
        Some(job_id)
    }

    /// Returns |job_id| to the allocator along with the task that held it.
    pub fn release(&mut self, job_id: JobId) -> Option<TaskIdx> {
        if (job_id as usize) >= MAX_JOBS {
            return None;
        }
        self.busy &= !job_bit(job_id);
        self.owner[job_id as usize].take()
    }

    pub fn owner(&self, job_id: JobId) -> Option<TaskIdx> {
        self.owner.get(job_id as usize).copied().flatten()
    }

    pub fn busy(&self) -> JobMask { self.busy }
}

fn full_mask() -> JobMask {
    if MAX_JOBS == JobMask::BITS as usize {
        JobMask::MAX
    } else {
        (1 << MAX_JOBS) - 1
    }
}
