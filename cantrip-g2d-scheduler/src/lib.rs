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

// G2D job scheduler: admits caller jobs into a fixed task pool, feeds them
// to the hardware job manager as job slots free up, and recovers from
// hangs and error interrupts.

use cantrip_g2d_shared::*;
use core::time::Duration;
use static_assertions::const_assert;

mod device;
mod job_slots;
mod stamp;
mod task;
mod wait;
mod watchdog;

pub use device::{DeviceState, G2dDevice, Statistics, TaskCounts};
pub use stamp::Stamp;
pub use task::TaskIdx;

// A job queued behind every other slot must get its turn before the
// re-arm limit kills it.
const_assert!(DEFAULT_MAX_QUEUE_REARMS as usize >= MAX_JOBS);

/// Number of consecutive timeouts a job may spend queued behind others.
pub const DEFAULT_MAX_QUEUE_REARMS: u32 = 2 * MAX_JOBS as u32;

/// Highest accepted debug level.
pub const MAX_DEBUG_LEVEL: u32 = 2;

/// Runtime knobs for a G2dDevice.
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// Size of the task pool. May exceed MAX_JOBS; the surplus waits on the
    /// prepared list.
    pub num_tasks: usize,
    /// How long a job may run before it is killed.
    pub hw_timeout: Duration,
    /// Timeouts a never-started job is re-armed for; None re-arms forever.
    pub max_queue_rearms: Option<u32>,
    /// 0: quiet, 1: log each job's duration, 2: dump each finished task
    /// instead. Adjustable later through G2dDevice::set_debug_level.
    pub debug_level: u32,
}
impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            num_tasks: DEFAULT_NUM_TASKS,
            hw_timeout: Duration::from_millis(HW_TIMEOUT_MSEC),
            max_queue_rearms: Some(DEFAULT_MAX_QUEUE_REARMS),
            debug_level: if cfg!(feature = "CONFIG_DEBUG_BUILD") { 1 } else { 0 },
        }
    }
}
