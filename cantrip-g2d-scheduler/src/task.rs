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

//! The task pool. Tasks are created once and recycled; a task is always on
//! exactly one of the free, prepared or active lists except while a
//! submitter holds it (between acquire and submit, and between retirement
//! and release of a blocking task).

use cantrip_g2d_interface::{BufferRef, Command, CompletionInfo, G2dError, TaskData, Ticket};
use cantrip_g2d_shared::*;
use log::{error, info};
use std::collections::VecDeque;

// The index of a task in TaskPool.tasks
pub type TaskIdx = usize;

/// Which list, if any, a task is linked on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskList {
    Free,
    Prepared,
    Active,
    /// Held by the submitting caller.
    Owned,
}

#[derive(Debug)]
pub struct Task {
    pub seq: u64,
    pub state: TaskState,
    pub list: TaskList,
    pub job_id: Option<JobId>,
    pub flags: TaskFlags,
    pub commands: Vec<Command>,
    pub sources: Vec<BufferRef>,
    pub target: BufferRef,
    pub begin: Ticks,
    pub end: Ticks,
    /// Set once the task has left the hardware for good.
    pub retired: bool,
    /// Consecutive timeouts spent waiting behind other jobs.
    pub rearms: u32,
    /// The watchdog found the job done but no interrupt arrived.
    pub done_unreported: bool,
}
impl Task {
    fn new() -> Self {
        Self {
            seq: 0,
            state: TaskState::Free,
            list: TaskList::Free,
            job_id: None,
            flags: TaskFlags::empty(),
            // Reserved up front so copying a request in never allocates.
            commands: Vec::with_capacity(MAX_COMMANDS),
            sources: Vec::with_capacity(MAX_IMAGES),
            target: BufferRef::default(),
            begin: 0,
            end: 0,
            retired: false,
            rearms: 0,
            done_unreported: false,
        }
    }

    fn reset(&mut self) {
        self.state = TaskState::Free;
        self.job_id = None;
        self.flags = TaskFlags::empty();
        self.commands.clear();
        self.sources.clear();
        self.target = BufferRef::default();
        self.begin = 0;
        self.end = 0;
        self.retired = false;
        self.rearms = 0;
        self.done_unreported = false;
    }

    pub fn is_nonblocking(&self) -> bool { self.flags.contains(TaskFlags::NONBLOCK) }

    pub fn ticket(&self, idx: TaskIdx) -> Ticket {
        Ticket {
            slot: idx as u32,
            seq: self.seq,
        }
    }

    pub fn info(&self, idx: TaskIdx) -> CompletionInfo {
        CompletionInfo {
            ticket: self.ticket(idx),
            state: self.state.into(),
            job_id: self.job_id,
            begin: self.begin,
            end: self.end,
        }
    }

    /// Logs the task and its command list.
    pub fn dump(&self) {
        info!(
            target: "",
            "G2D: task seq {} job {:?} {:?} flags {:?} {} sources",
            self.seq,
            self.job_id,
            self.state,
            self.flags,
            self.sources.len()
        );
        for (i, cmd) in self.commands.iter().enumerate() {
            info!(target: "", "G2D: CMD[{:03}] {:#06x}, {:#010x}", i, cmd.offset, cmd.value);
        }
    }
}

// Checks a caller-supplied description without touching any task.
pub fn validate(data: &TaskData) -> Result<TaskFlags, G2dError> {
    let flags = TaskFlags::from_bits(data.flags).ok_or(G2dError::InvalidInput)?;
    if data.commands.is_empty() || data.commands.len() > MAX_COMMANDS {
        return Err(G2dError::InvalidInput);
    }
    if data
        .commands
        .iter()
        .any(|cmd| cmd.offset % 4 != 0 || cmd.offset >= REG_SPACE_SIZE)
    {
        return Err(G2dError::InvalidInput);
    }
    if data.sources.len() > MAX_IMAGES {
        return Err(G2dError::InvalidInput);
    }
    let valid_buffer =
        |buf: &BufferRef| buf.length != 0 && buf.offset.checked_add(buf.length).is_some();
    if !data.sources.iter().all(valid_buffer) || !valid_buffer(&data.target) {
        return Err(G2dError::InvalidInput);
    }
    Ok(flags)
}

pub struct TaskPool {
    tasks: Vec<Task>,
    free: VecDeque<TaskIdx>,
    prepared: VecDeque<TaskIdx>,
    active: Vec<TaskIdx>,
    next_seq: u64,
}
impl TaskPool {
    pub fn new(num_tasks: usize) -> Self {
        let mut active = Vec::new();
        active.reserve(MAX_JOBS);
        Self {
            tasks: (0..num_tasks).map(|_| Task::new()).collect(),
            free: (0..num_tasks).collect(),
            prepared: VecDeque::with_capacity(num_tasks),
            active,
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize { self.tasks.len() }
    pub fn task(&self, idx: TaskIdx) -> &Task { &self.tasks[idx] }
    pub fn task_mut(&mut self, idx: TaskIdx) -> &mut Task { &mut self.tasks[idx] }
    pub fn get(&self, idx: TaskIdx) -> Option<&Task> { self.tasks.get(idx) }

    pub fn num_free(&self) -> usize { self.free.len() }
    pub fn num_prepared(&self) -> usize { self.prepared.len() }
    pub fn num_active(&self) -> usize { self.active.len() }
    pub fn active(&self) -> &[TaskIdx] { &self.active }
    pub fn prepared(&self) -> impl Iterator<Item = &TaskIdx> { self.prepared.iter() }

    /// Takes a task off the free list. The caller owns it until it is
    /// submitted or released.
    pub fn acquire_free_task(&mut self) -> Option<TaskIdx> {
        let idx = self.free.pop_front()?;
        let task = &mut self.tasks[idx];
        task.list = TaskList::Owned;
        task.seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        Some(idx)
    }

    /// Copies |data| into an acquired task and marks it PREPARED.
    pub fn prepare(&mut self, idx: TaskIdx, data: &TaskData, now: Ticks) -> Result<(), G2dError> {
        let flags = validate(data)?;
        let task = &mut self.tasks[idx];
        debug_assert_eq!(task.list, TaskList::Owned);
        task.flags = flags;
        task.commands.extend_from_slice(&data.commands);
        task.sources.extend_from_slice(&data.sources);
        task.target = data.target;
        task.begin = now;
        task.state = TaskState::Prepared;
        Ok(())
    }

    /// Clears a task and puts it back on the free list.
    pub fn release_task(&mut self, idx: TaskIdx) {
        let task = &mut self.tasks[idx];
        debug_assert!(
            task.list == TaskList::Owned,
            "release of task {} on the {:?} list",
            idx,
            task.list
        );
        if task.list != TaskList::Owned {
            error!("Task {} released from the {:?} list", idx, task.list);
            return;
        }
        task.reset();
        task.list = TaskList::Free;
        self.free.push_back(idx);
    }

    pub fn push_prepared(&mut self, idx: TaskIdx) {
        self.tasks[idx].list = TaskList::Prepared;
        self.prepared.push_back(idx);
    }

    pub fn front_prepared(&self) -> Option<TaskIdx> { self.prepared.front().copied() }

    pub fn pop_prepared(&mut self) -> Option<TaskIdx> {
        let idx = self.prepared.pop_front()?;
        self.tasks[idx].list = TaskList::Owned;
        Some(idx)
    }

    pub fn push_active(&mut self, idx: TaskIdx) {
        debug_assert!(self.active.len() < MAX_JOBS);
        self.tasks[idx].list = TaskList::Active;
        self.active.push(idx);
    }

    /// Unlinks |idx| from the active list; the caller now owns it.
    pub fn remove_active(&mut self, idx: TaskIdx) -> bool {
        match self.active.iter().position(|i| *i == idx) {
            Some(pos) => {
                self.active.remove(pos);
                self.tasks[idx].list = TaskList::Owned;
                true
            }
            None => false,
        }
    }
}
