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

//! The G2D device: task lists, job slots, the watchdog and the hardware,
//! all behind one lock.
//!
//! Callers enter through process/poll; the platform enters through
//! handle_irq, handle_timer_interrupt, handle_mmu_fault and the power
//! management hooks. Every entry point does its work under the device lock
//! and wakes sleepers only after the lock is dropped. Nothing on the
//! interrupt paths allocates.

use crate::job_slots::JobSlots;
use crate::stamp::{Stamp, StampRing};
use crate::task::{TaskIdx, TaskList, TaskPool};
use crate::wait::WaitQueue;
use crate::watchdog::Watchdog;
use crate::DeviceConfig;
use crate::MAX_DEBUG_LEVEL;
use cantrip_g2d_interface::*;
use cantrip_g2d_shared::*;
use log::{error, info, trace, warn};
use spin::Mutex;

bitflags::bitflags! {
    pub struct DeviceState: u32 {
        /// Dispatch is stopped; prepared tasks wait for resume.
        const SUSPEND = 0b00000001;
        /// Final; new submissions are refused.
        const SHUTDOWN = 0b00000010;
        const IOVMM_DISABLED = 0b00000100;
    }
}

/// Statistics on non-happy-path events.
#[derive(Clone, Debug, Default)]
pub struct Statistics {
    pub busy_rejects: u32,
    pub push_failures: u32,
    pub spurious_finishes: u32,
    pub error_interrupts: u32,
    pub timeouts: u32,
    pub double_timeouts: u32,
    pub global_resets: u32,
    pub lost_interrupts: u32,
    pub mmu_faults: u32,
}

/// What a finished task leaves in the log at each debug level.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum DoneReport {
    Quiet,
    Duration,
    Dump,
}
impl DoneReport {
    fn for_level(debug_level: u32) -> Self {
        match debug_level {
            1 => DoneReport::Duration,
            2 => DoneReport::Dump,
            _ => DoneReport::Quiet,
        }
    }
}

/// Occupancy of the three task lists.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TaskCounts {
    pub free: usize,
    pub prepared: usize,
    pub active: usize,
}

struct G2dCore<HW, HT> {
    hw: HW,
    timer: HT,
    config: DeviceConfig,
    version: u32,
    state: DeviceState,
    pool: TaskPool,
    slots: JobSlots,
    watchdog: Watchdog,
    stamps: StampRing,
    /// Last outcome of a non-blocking task, per pool slot.
    outcomes: Vec<Option<CompletionInfo>>,
    /// Bitmask of job ids retired since the last completed_jobs call.
    completed_job_mask: JobMask,
    statistics: Statistics,
}

impl<HW: G2dHardware, HT: HardwareTimer> G2dCore<HW, HT> {
    fn stamp(&mut self, idx: Option<TaskIdx>, event: StampEvent, val: u32) {
        let time = self.timer.now();
        let task = idx.map(|idx| self.pool.task(idx));
        self.stamps.push(Stamp {
            time,
            seq: task.map(|t| t.seq),
            job_id: task.and_then(|t| t.job_id),
            state: task.map_or(TaskState::Free, |t| t.state),
            event,
            val,
        });
        let task = match task {
            Some(task) => task,
            None => return,
        };
        if event == StampEvent::Done {
            match DoneReport::for_level(self.config.debug_level) {
                DoneReport::Duration => info!(
                    "G2D: job {:?} took {} usec",
                    task.job_id,
                    task.end.saturating_sub(task.begin)
                ),
                DoneReport::Dump => task.dump(),
                DoneReport::Quiet => {}
            }
        }
        if event.is_fault() {
            task.dump();
        }
    }

    fn is_suspended(&self) -> bool { self.state.contains(DeviceState::SUSPEND) }

    // Hands prepared tasks to the hardware while job slots are free.
    fn schedule(&mut self) {
        if self.is_suspended() {
            return;
        }
        while let Some(idx) = self.pool.front_prepared() {
            let job_id = match self.slots.alloc(idx) {
                Some(job_id) => job_id,
                None => break, // Deferred until a job retires.
            };
            self.pool.pop_prepared();

            let task = self.pool.task_mut(idx);
            task.job_id = Some(job_id);
            task.state = TaskState::Queueing;
            let result = self.hw.push(&HwJob {
                job_id,
                commands: &task.commands,
            });
            match result {
                Ok(()) => {
                    task.state = TaskState::Running;
                    self.pool.push_active(idx);
                    self.watchdog
                        .arm(job_id, self.config.hw_timeout, &self.timer);
                    self.stamp(Some(idx), StampEvent::Push, job_id);
                }
                Err(e) => {
                    error!("Push of job {} failed: {:?}", job_id, e);
                    self.statistics.push_failures += 1;
                    self.retire(idx, TaskState::Error);
                }
            }
        }
    }

    // Takes |idx| off the hardware for good. A task already KILLED stays
    // KILLED whatever the outcome.
    fn retire(&mut self, idx: TaskIdx, outcome: TaskState) {
        self.pool.remove_active(idx);
        let now = self.timer.now();
        let task = self.pool.task_mut(idx);
        if let Some(job_id) = task.job_id {
            self.slots.release(job_id);
            self.watchdog.cancel(job_id);
        }
        if task.state != TaskState::Killed {
            task.state = outcome;
        }
        task.end = now;
        self.stamp(Some(idx), StampEvent::Done, outcome.into());

        let task = self.pool.task_mut(idx);
        if task.is_nonblocking() {
            // Nobody is waiting; record the result and recycle the task.
            if let Some(job_id) = task.job_id {
                self.completed_job_mask |= job_bit(job_id);
            }
            self.outcomes[idx] = Some(task.info(idx));
            self.pool.release_task(idx);
        } else {
            task.retired = true;
        }
    }

    fn flush_all(&mut self, outcome: TaskState) {
        while let Some(idx) = self.pool.active().first().copied() {
            self.retire(idx, outcome);
        }
    }

    fn global_reset(&mut self) {
        self.hw.global_reset();
        self.statistics.global_resets += 1;
        self.stamp(None, StampEvent::GlobalReset, 0);
    }

    fn current_task(&mut self) -> (Option<JobId>, Option<TaskIdx>) {
        let job_id = self.hw.current_job_id();
        (job_id, job_id.and_then(|id| self.slots.owner(id)))
    }

    fn process_irq(&mut self) {
        let finished = self.hw.finished_job_ids();
        if finished != 0 {
            for job_id in job_ids(finished) {
                match self.slots.owner(job_id) {
                    Some(idx) => {
                        self.stamp(Some(idx), StampEvent::Int, finished);
                        self.retire(idx, TaskState::Done);
                    }
                    None => {
                        // Already retired by a reset or a lost-interrupt
                        // recovery; the bit is stale.
                        warn!("Finish interrupt for idle job {}", job_id);
                        self.statistics.spurious_finishes += 1;
                    }
                }
            }
            self.hw.clear_job_ids(finished);
        }

        let status = self.hw.errint_status();
        if status != 0 {
            let (job_id, idx) = self.current_task();
            error!(
                "Error interrupt {:#010x} on job {:?}: {:?}",
                status,
                job_id,
                ErrStatus::from(status)
            );
            self.statistics.error_interrupts += 1;
            self.stamp(idx, StampEvent::ErrInt, status);
            self.flush_all(TaskState::Error);
            self.global_reset();
            self.hw.clear_int(status);
        }

        self.schedule();
    }

    fn job_timeout(&mut self, job_id: JobId) {
        let idx = match self.slots.owner(job_id) {
            Some(idx) => idx,
            None => return, // Retired while the deadline was in flight.
        };

        if self.hw.job_state(job_id) == JobState::Done {
            // The completion interrupt should be on its way. Give it one
            // more period before retiring the job without it.
            let task = self.pool.task_mut(idx);
            if !task.done_unreported {
                task.done_unreported = true;
                self.watchdog
                    .arm(job_id, self.config.hw_timeout, &self.timer);
                return;
            }
            warn!("Job {} finished without an interrupt", job_id);
            self.statistics.lost_interrupts += 1;
            self.retire(idx, TaskState::Done);
            self.hw.clear_job_ids(job_bit(job_id));
            return;
        }

        if self.pool.task(idx).state == TaskState::Killed {
            error!("Job {} ignored kill, resetting G2D", job_id);
            self.statistics.double_timeouts += 1;
            self.global_reset();
            self.flush_all(TaskState::Error);
            return;
        }

        self.watchdog
            .arm(job_id, self.config.hw_timeout, &self.timer);
        if self.hw.job_state(job_id) != JobState::Running {
            // Still queued behind other jobs.
            let task = self.pool.task_mut(idx);
            task.rearms += 1;
            match self.config.max_queue_rearms {
                Some(max) if task.rearms > max => {
                    warn!("Job {} never started after {} timeouts", job_id, task.rearms);
                }
                _ => {
                    trace!("Job {} still queued, timeout re-armed", job_id);
                    return;
                }
            }
        }

        error!("Job {} timed out", job_id);
        self.statistics.timeouts += 1;
        self.stamp(Some(idx), StampEvent::TimeoutHw, job_id);
        self.pool.task_mut(idx).state = TaskState::Killed;
        self.hw.kill(job_id);
    }

    fn process_timeouts(&mut self) {
        self.timer.ack_interrupt();
        let now = self.timer.now();
        while let Some(job_id) = self.watchdog.pop_expired(now) {
            self.job_timeout(job_id);
        }
        self.schedule();
        self.watchdog.set_alarm(&self.timer);
    }

    // Finds |ticket| among live tasks or recorded outcomes.
    fn lookup(&self, ticket: Ticket) -> Option<CompletionInfo> {
        let idx = ticket.slot as usize;
        let task = self.pool.get(idx)?;
        if task.seq == ticket.seq && task.list != TaskList::Free {
            return Some(task.info(idx));
        }
        self.outcomes
            .get(idx)
            .copied()
            .flatten()
            .filter(|info| info.ticket == ticket)
    }

    fn counts(&self) -> TaskCounts {
        TaskCounts {
            free: self.pool.num_free(),
            prepared: self.pool.num_prepared(),
            active: self.pool.num_active(),
        }
    }
}

pub struct G2dDevice<HW, HT> {
    core: Mutex<G2dCore<HW, HT>>,
    /// Submitters blocked on their task.
    task_wait: WaitQueue,
    /// Suspend and shutdown blocked on the active list draining.
    freeze_wait: WaitQueue,
}

impl<HW: G2dHardware, HT: HardwareTimer> G2dDevice<HW, HT> {
    /// Probes the hardware and creates the task pool.
    pub fn new(mut hw: HW, timer: HT, config: DeviceConfig) -> Result<Self, G2dError> {
        if config.num_tasks == 0 {
            error!("G2D needs at least one task");
            return Err(G2dError::InvalidInput);
        }
        if config.debug_level > MAX_DEBUG_LEVEL {
            error!("G2D debug level {} out of range", config.debug_level);
            return Err(G2dError::InvalidInput);
        }
        timer.setup();
        let version = hw.version();
        info!("Probed G2D version {:#010x}", version);
        Ok(Self {
            core: Mutex::new(G2dCore {
                hw,
                timer,
                version,
                state: DeviceState::empty(),
                pool: TaskPool::new(config.num_tasks),
                slots: JobSlots::new(),
                watchdog: Watchdog::new(),
                stamps: StampRing::new(MAX_STAMPS),
                outcomes: vec![None; config.num_tasks],
                completed_job_mask: 0,
                statistics: Statistics::default(),
                config,
            }),
            task_wait: WaitQueue::new("g2d-task"),
            freeze_wait: WaitQueue::new("g2d-freeze"),
        })
    }

    fn wake_all(&self) {
        self.task_wait.wake_all();
        self.freeze_wait.wake_all();
    }

    fn wait_for_idle(&self) {
        trace!("Waiting on {}", self.freeze_wait.name());
        let patience = self.core.lock().config.hw_timeout * 2;
        while !self
            .freeze_wait
            .wait_until_timeout(patience, || self.core.lock().pool.num_active() == 0)
        {
            // The watchdog should have retired these by now.
            warn!("Still waiting on {} active G2D jobs", self.core.lock().pool.num_active());
        }
    }

    /// Runs one G2D job. Blocking callers sleep until the job retires and
    /// get its outcome as the result; non-blocking callers get the task's
    /// current state and poll its ticket later.
    pub fn process(&self, data: &TaskData) -> Result<CompletionInfo, G2dError> {
        let mut core = self.core.lock();
        if core.state.contains(DeviceState::SHUTDOWN) {
            return Err(G2dError::Shutdown);
        }
        let idx = match core.pool.acquire_free_task() {
            Some(idx) => idx,
            None => {
                core.statistics.busy_rejects += 1;
                trace!("No free G2D task");
                return Err(G2dError::Busy);
            }
        };
        let now = core.timer.now();
        if let Err(e) = core.pool.prepare(idx, data, now) {
            core.pool.release_task(idx);
            return Err(e);
        }
        core.stamp(Some(idx), StampEvent::Begin, 0);
        core.pool.push_prepared(idx);
        core.schedule();

        let ticket = core.pool.task(idx).ticket(idx);
        if data.is_nonblocking() {
            let info = core.lookup(ticket);
            drop(core);
            self.wake_all();
            return info.ok_or(G2dError::UnknownError);
        }
        drop(core);

        trace!("Waiting on {} for {:?}", self.task_wait.name(), ticket);
        self.task_wait
            .wait_until(|| self.core.lock().pool.task(idx).retired);

        let mut core = self.core.lock();
        let task = core.pool.task(idx);
        let info = task.info(idx);
        let reached_hw = task.job_id.is_some();
        core.pool.release_task(idx);
        drop(core);

        match info.task_state() {
            TaskState::Done => Ok(info),
            TaskState::Killed => Err(G2dError::Timeout),
            _ if !reached_hw => Err(G2dError::Shutdown),
            _ => Err(G2dError::HardwareError),
        }
    }

    /// Reports on a submission. Ok(None) means the ticket has been
    /// superseded by a later use of its slot.
    pub fn poll(&self, ticket: Ticket) -> Result<Option<CompletionInfo>, G2dError> {
        let core = self.core.lock();
        if ticket.slot as usize >= core.pool.len() {
            return Err(G2dError::NoSuchTask);
        }
        Ok(core.lookup(ticket))
    }

    /// Returns a bit vector, where a 1 in bit N indicates non-blocking job
    /// N has retired since the last call. The mask is reset by this call.
    pub fn completed_jobs(&self) -> JobMask {
        let mut core = self.core.lock();
        let mask = core.completed_job_mask;
        core.completed_job_mask = 0;
        mask
    }

    /// Services the G2D interrupt: retires finished jobs and recovers from
    /// error interrupts. Safe to call when nothing is pending.
    pub fn handle_irq(&self) {
        self.core.lock().process_irq();
        self.wake_all();
    }

    /// Services expired watchdog deadlines.
    pub fn handle_timer_interrupt(&self) {
        self.core.lock().process_timeouts();
        self.wake_all();
    }

    /// Records an MMU fault against the running task. Recovery happens in
    /// the error interrupt that follows.
    pub fn handle_mmu_fault(&self, addr: u64) {
        let mut core = self.core.lock();
        let (job_id, idx) = core.current_task();
        error!("G2D MMU fault at {:#x} on job {:?}", addr, job_id);
        core.statistics.mmu_faults += 1;
        core.stamp(idx, StampEvent::MmuFault, addr as u32);
    }

    /// Stops dispatch and waits for running jobs to drain.
    pub fn prepare_suspend(&self) {
        {
            let mut core = self.core.lock();
            core.state.insert(DeviceState::SUSPEND);
            core.stamp(None, StampEvent::SuspendS, 0);
        }
        self.wait_for_idle();
        self.core.lock().stamp(None, StampEvent::SuspendE, 0);
    }

    /// Resumes dispatch after prepare_suspend.
    pub fn suspend_finish(&self) {
        {
            let mut core = self.core.lock();
            if !core.state.contains(DeviceState::SHUTDOWN) {
                core.state
                    .remove(DeviceState::SUSPEND | DeviceState::IOVMM_DISABLED);
            }
            core.stamp(None, StampEvent::Resume, 0);
            core.schedule();
        }
        self.wake_all();
    }

    /// Final teardown: refuses new work, fails tasks that never reached
    /// the hardware and waits for the rest to retire.
    pub fn shutdown(&self) {
        {
            let mut core = self.core.lock();
            core.stamp(None, StampEvent::ShutdownS, 0);
            core.state
                .insert(DeviceState::SHUTDOWN | DeviceState::SUSPEND);
            while let Some(idx) = core.pool.pop_prepared() {
                core.retire(idx, TaskState::Error);
            }
        }
        self.wake_all();
        self.wait_for_idle();

        let mut core = self.core.lock();
        if !core.state.contains(DeviceState::IOVMM_DISABLED) {
            core.state.insert(DeviceState::IOVMM_DISABLED);
            core.hw.iommu_deactivate();
        }
        core.stamp(None, StampEvent::ShutdownE, 0);
    }

    pub fn runtime_suspend(&self) { self.core.lock().stamp(None, StampEvent::PmSuspend, 0); }

    pub fn runtime_resume(&self) { self.core.lock().stamp(None, StampEvent::PmResume, 0); }

    /// Changes how much each finished task logs; see DeviceConfig.
    pub fn set_debug_level(&self, debug_level: u32) -> Result<(), G2dError> {
        if debug_level > MAX_DEBUG_LEVEL {
            return Err(G2dError::InvalidInput);
        }
        self.core.lock().config.debug_level = debug_level;
        Ok(())
    }
    pub fn debug_level(&self) -> u32 { self.core.lock().config.debug_level }

    pub fn version(&self) -> u32 { self.core.lock().version }
    pub fn device_state(&self) -> DeviceState { self.core.lock().state }
    pub fn task_counts(&self) -> TaskCounts { self.core.lock().counts() }
    pub fn busy_job_mask(&self) -> JobMask { self.core.lock().slots.busy() }
    pub fn statistics(&self) -> Statistics { self.core.lock().statistics.clone() }

    /// Copies out the stamp ring, oldest first.
    pub fn stamps(&self) -> Vec<Stamp> { self.core.lock().stamps.iter().copied().collect() }

    pub fn dump_stamps(&self) { self.core.lock().stamps.dump(); }

    pub fn debug_state(&self) {
        let core = self.core.lock();
        info!(target: "", "G2D version {:#010x} state {:?}", core.version, core.state);
        info!(target: "", "Job slots busy: {:#06x}", core.slots.busy());
        info!(target: "", "Tasks: {:?}", core.counts());
        info!(target: "", "Active tasks:");
        for idx in core.pool.active() {
            let task = core.pool.task(*idx);
            info!(
                target: "",
                "  [{}] seq {} job {:?} {:?}",
                idx,
                task.seq,
                task.job_id,
                task.state
            );
        }
        info!(target: "", "Prepared tasks:");
        for idx in core.pool.prepared() {
            info!(target: "", "  [{}] seq {}", idx, core.pool.task(*idx).seq);
        }
        if let Some(deadline) = core.watchdog.next_deadline() {
            info!(target: "", "Next deadline: {}", deadline);
        }
        info!(
            target: "",
            "Stamps: {}/{}",
            core.stamps.len(),
            core.stamps.capacity()
        );
        info!(target: "", "{:?}", core.statistics);
    }
}
