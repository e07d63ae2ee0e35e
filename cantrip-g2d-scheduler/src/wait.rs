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

//! A wait queue for callers that must sleep until the scheduler changes
//! state. The condition itself lives under the device lock; the queue only
//! carries a generation count so a wake that lands between checking the
//! condition and going to sleep is never lost.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct WaitQueue {
    name: &'static str,
    generation: Mutex<u64>,
    cond: Condvar,
}
impl WaitQueue {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            generation: Mutex::new(0),
            cond: Condvar::new(),
        }
    }
    pub fn name(&self) -> &str { self.name }

    fn lock(&self) -> MutexGuard<'_, u64> {
        // The count stays meaningful even if a waker panicked.
        self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until |cond| returns true. |cond| must take whatever lock
    /// protects the state it reads and must not be called with it held.
    pub fn wait_until<F: FnMut() -> bool>(&self, mut cond: F) {
        loop {
            let seen = *self.lock();
            if cond() {
                return;
            }
            let mut generation = self.lock();
            while *generation == seen {
                generation = self
                    .cond
                    .wait(generation)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
    }

    /// Like wait_until but gives up after |timeout|. Returns the final value
    /// of |cond|.
    pub fn wait_until_timeout<F: FnMut() -> bool>(&self, timeout: Duration, mut cond: F) -> bool {
        let give_up = Instant::now() + timeout;
        loop {
            let seen = *self.lock();
            if cond() {
                return true;
            }
            let mut generation = self.lock();
            while *generation == seen {
                let now = Instant::now();
                if now >= give_up {
                    drop(generation);
                    return cond();
                }
                generation = self
                    .cond
                    .wait_timeout(generation, give_up - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        }
    }

    /// Wakes every waiter so each re-checks its condition.
    pub fn wake_all(&self) {
        *self.lock() += 1;
        self.cond.notify_all();
    }
}
