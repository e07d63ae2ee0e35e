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

// G2D component: decodes request buffers for the scheduler and runs the
// timer service that drives its watchdog.

use cantrip_g2d_interface::*;
use cantrip_g2d_scheduler::{DeviceConfig, G2dDevice};
use cantrip_g2d_shared::*;
use fake_g2d_core::{FakeG2dCore, FakeTimer};
use log::{error, info, trace};
use spin::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Period of the timer service loop.
pub const TIMER_TICK: Duration = Duration::from_millis(10);

/// A timer whose alarm line the timer service can sample.
pub trait TimerIrq {
    /// True once the armed deadline has passed and is not yet acked.
    fn irq_pending(&self) -> bool;
}

/// Monotonic clock for hosted builds, counting from construction. Clones
/// share the alarm.
#[derive(Clone)]
pub struct HostTimer {
    epoch: Instant,
    alarm: Arc<AtomicU64>,
}
impl HostTimer {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            alarm: Arc::new(AtomicU64::new(Ticks::MAX)),
        }
    }

    pub fn alarm_expired(&self) -> bool { self.alarm.load(Ordering::Acquire) <= self.now() }
}
impl Default for HostTimer {
    fn default() -> Self { Self::new() }
}
impl HardwareTimer for HostTimer {
    fn ack_interrupt(&self) { self.alarm.store(Ticks::MAX, Ordering::Release); }
    fn now(&self) -> Ticks { self.epoch.elapsed().as_micros() as Ticks }
    fn set_alarm(&self, deadline: Ticks) { self.alarm.store(deadline, Ordering::Release); }
}

impl TimerIrq for HostTimer {
    fn irq_pending(&self) -> bool { self.alarm_expired() }
}
impl TimerIrq for FakeTimer {
    fn irq_pending(&self) -> bool { self.alarm_expired() }
}

pub type HostedG2d = G2dComponent<FakeG2dCore, HostTimer>;

pub struct G2dComponent<HW, HT> {
    device: Arc<G2dDevice<HW, HT>>,
    // Shares the alarm with the timer inside the device.
    timer: HT,
    running: Arc<AtomicBool>,
    timer_thread: Mutex<Option<JoinHandle<()>>>,
}

impl HostedG2d {
    /// Builds a component over the in-memory G2D core. The returned handle
    /// shares state with the one inside the device.
    pub fn hosted(config: DeviceConfig) -> Result<(Self, FakeG2dCore), G2dError> {
        let hw = FakeG2dCore::new();
        Ok((Self::new(hw.clone(), HostTimer::new(), config)?, hw))
    }
}

impl<HW, HT> G2dComponent<HW, HT>
where
    HW: G2dHardware + Send + 'static,
    HT: HardwareTimer + TimerIrq + Clone + Send + 'static,
{
    pub fn new(hw: HW, timer: HT, config: DeviceConfig) -> Result<Self, G2dError> {
        let device = G2dDevice::new(hw, timer.clone(), config)?;
        Ok(Self {
            device: Arc::new(device),
            timer,
            running: Arc::new(AtomicBool::new(false)),
            timer_thread: Mutex::new(None),
        })
    }

    pub fn device(&self) -> &Arc<G2dDevice<HW, HT>> { &self.device }

    /// Starts the thread that samples the timer alarm every |tick| and
    /// services the watchdog when it has fired. Does nothing if it is
    /// already running.
    pub fn start_timer_service(&self, tick: Duration) {
        let mut timer_thread = self.timer_thread.lock();
        if timer_thread.is_some() {
            return;
        }
        self.running.store(true, Ordering::Release);
        let device = self.device.clone();
        let running = self.running.clone();
        let timer = self.timer.clone();
        *timer_thread = Some(thread::spawn(move || {
            trace!("G2D timer service running");
            while running.load(Ordering::Acquire) {
                thread::sleep(tick);
                if timer.irq_pending() {
                    device.handle_timer_interrupt();
                }
            }
        }));
    }

    pub fn stop_timer_service(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.timer_thread.lock().take() {
            if handle.join().is_err() {
                error!("G2D timer service panicked");
            }
        }
    }

    // Interrupt glue; the platform calls these from its IRQ loop.
    pub fn handle_irq(&self) { self.device.handle_irq(); }
    pub fn handle_mmu_fault(&self, addr: u64) { self.device.handle_mmu_fault(addr); }

    /// Decodes one request from |request_buffer|, runs it and encodes any
    /// reply into |reply_buffer|. Returns the length of the reply.
    pub fn dispatch(
        &self,
        request_buffer: &[u8],
        reply_buffer: &mut [u8],
    ) -> Result<usize, G2dError> {
        let request = match postcard::from_bytes::<G2dRequest>(request_buffer) {
            Ok(request) => request,
            Err(_) => return Err(G2dError::Fault),
        };

        match request {
            G2dRequest::Process(data) => self.process_request(&data, reply_buffer),
            G2dRequest::Poll(ticket) => self.poll_request(ticket, reply_buffer),
            G2dRequest::CompletedJobs => self.completed_jobs_request(reply_buffer),
            G2dRequest::DebugState => self.debug_state_request(),
            G2dRequest::DumpStamps => self.dump_stamps_request(),
            G2dRequest::SetDebugLevel(level) => self.set_debug_level_request(level),
        }
    }

    fn process_request(&self, data: &TaskData, reply_buffer: &mut [u8]) -> Result<usize, G2dError> {
        let info = self.device.process(data)?;
        let reply_slice = postcard::to_slice(&ProcessResponse { info }, reply_buffer)
            .or(Err(G2dError::SerializeError))?;
        Ok(reply_slice.len())
    }

    fn poll_request(&self, ticket: Ticket, reply_buffer: &mut [u8]) -> Result<usize, G2dError> {
        let info = self.device.poll(ticket)?;
        let reply_slice = postcard::to_slice(&PollResponse { info }, reply_buffer)
            .or(Err(G2dError::SerializeError))?;
        Ok(reply_slice.len())
    }

    fn completed_jobs_request(&self, reply_buffer: &mut [u8]) -> Result<usize, G2dError> {
        let job_mask = self.device.completed_jobs();
        let reply_slice = postcard::to_slice(&CompletedJobsResponse { job_mask }, reply_buffer)
            .or(Err(G2dError::SerializeError))?;
        Ok(reply_slice.len())
    }

    fn debug_state_request(&self) -> Result<usize, G2dError> {
        self.device.debug_state();
        Ok(0)
    }

    fn set_debug_level_request(&self, level: u32) -> Result<usize, G2dError> {
        self.device.set_debug_level(level)?;
        info!("G2D debug level {}", level);
        Ok(0)
    }

    fn dump_stamps_request(&self) -> Result<usize, G2dError> {
        info!(target: "", "G2D stamps:");
        self.device.dump_stamps();
        Ok(0)
    }
}

impl<HW, HT> Drop for G2dComponent<HW, HT> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.timer_thread.get_mut().take() {
            let _ = handle.join();
        }
    }
}
