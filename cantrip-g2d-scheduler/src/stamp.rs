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

//! A fixed-size ring of timestamped scheduler events.
//!
//! Unlike a FIFO this never refuses a write: once the ring is full the
//! oldest stamp is overwritten. Storage is reserved up front so stamping
//! from the interrupt path does not allocate.

use cantrip_g2d_shared::*;
use log::info;

/// One recorded event. |seq| and |job_id| are None for device-wide events
/// (power management, global reset).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Stamp {
    pub time: Ticks,
    pub seq: Option<u64>,
    pub job_id: Option<JobId>,
    pub state: TaskState,
    pub event: StampEvent,
    pub val: u32,
}

pub struct StampRing {
    entries: Vec<Stamp>,
    capacity: usize,
    // Index the next stamp is written to.
    next: usize,
}
impl StampRing {
    /// |capacity| is rounded up to a power of two.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            next: 0,
        }
    }

    pub fn capacity(&self) -> usize { self.capacity }
    pub fn len(&self) -> usize { self.entries.len() }

    pub fn push(&mut self, stamp: Stamp) {
        if self.entries.len() < self.capacity {
            self.entries.push(stamp);
        } else {
            self.entries[self.next] = stamp;
        }
        self.next = (self.next + 1) & (self.capacity - 1);
    }

    /// Iterates stamps oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Stamp> {
        // Until the ring wraps |next| == len and the first half is empty.
        let (newer, older) = if self.entries.len() < self.capacity {
            (&self.entries[..], &self.entries[..0])
        } else {
            self.entries.split_at(self.next)
        };
        older.iter().chain(newer.iter())
    }

    /// Logs every stamp in chronological order.
    pub fn dump(&self) {
        for (i, stamp) in self.iter().enumerate() {
            info!(
                target: "",
                "[{}] {}:{}@{:?} ({:?}/{:#x}) {:06}",
                i,
                stamp.seq.map_or(-1, |seq| seq as i64),
                stamp.job_id.map_or(-1, |id| id as i64),
                stamp.event,
                stamp.state,
                stamp.val,
                stamp.time
            );
        }
    }
}
