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

// End-to-end scheduler tests against the fake G2D core.

#![allow(dead_code)]

#[cfg(test)]
mod tests {
    use assert_hex::assert_eq_hex;
    use cantrip_g2d_component::{G2dComponent, HostedG2d};
    use cantrip_g2d_interface::*;
    use cantrip_g2d_scheduler::*;
    use cantrip_g2d_shared::*;
    use fake_g2d_core::{FakeG2dCore, FakeTimer};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    const TIMEOUT: Duration = Duration::from_millis(HW_TIMEOUT_MSEC);

    type Device = Arc<G2dDevice<FakeG2dCore, FakeTimer>>;

    fn device(num_tasks: usize) -> (Device, FakeG2dCore, FakeTimer) {
        let hw = FakeG2dCore::new();
        let timer = FakeTimer::new();
        let config = DeviceConfig {
            num_tasks,
            ..Default::default()
        };
        let device = G2dDevice::new(hw.clone(), timer.clone(), config).unwrap();
        (Arc::new(device), hw, timer)
    }

    fn task_data(flags: TaskFlags) -> TaskData {
        TaskData {
            flags: flags.bits(),
            commands: vec![
                Command {
                    offset: 0x0104,
                    value: 0x1,
                },
                Command {
                    offset: 0x0000,
                    value: 0x1,
                },
            ],
            sources: vec![BufferRef {
                handle: 7,
                offset: 0,
                length: 1920 * 1080 * 4,
            }],
            target: BufferRef {
                handle: 8,
                offset: 0,
                length: 1920 * 1080 * 4,
            },
        }
    }

    fn nonblocking() -> TaskData { task_data(TaskFlags::NONBLOCK) }
    fn blocking() -> TaskData { task_data(TaskFlags::empty()) }

    // Polls |cond| until it holds; fails the test after a few seconds.
    fn wait_for<F: FnMut() -> bool>(mut cond: F) {
        let give_up = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < give_up, "condition never became true");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn state_of(device: &Device, ticket: Ticket) -> TaskState {
        device.poll(ticket).unwrap().unwrap().task_state()
    }

    // Scenario A: a blocking submitter is released with success once the
    // completion interrupt lands.
    #[test]
    fn blocking_job_completes() {
        let (device, hw, _) = device(2);
        let submitter = {
            let device = device.clone();
            thread::spawn(move || device.process(&blocking()))
        };
        wait_for(|| hw.running() == Some(0));
        assert_eq!(device.task_counts().active, 1);

        hw.complete(0);
        device.handle_irq();
        let info = submitter.join().unwrap().unwrap();
        assert_eq!(info.task_state(), TaskState::Done);
        assert_eq!(info.job_id, Some(0));
        assert!(info.end >= info.begin);
        assert_eq_hex!(hw.cleared_job_ids(), 0b1);
        assert_eq!(
            device.task_counts(),
            TaskCounts {
                free: 2,
                prepared: 0,
                active: 0
            }
        );
    }

    // Scenario B: no interrupt ever fires; the watchdog kills the job once.
    #[test]
    fn hung_job_is_killed_once() {
        let (device, hw, timer) = device(1);
        let info = device.process(&nonblocking()).unwrap();

        timer.advance(TIMEOUT - Duration::from_millis(1));
        device.handle_timer_interrupt();
        assert!(hw.killed().is_empty());

        timer.advance(Duration::from_millis(1));
        device.handle_timer_interrupt();
        device.handle_timer_interrupt();
        assert_eq!(hw.killed(), vec![0]);
        assert_eq!(state_of(&device, info.ticket), TaskState::Killed);
        assert_eq!(device.statistics().timeouts, 1);
        // Another deadline is pending to catch a kill that never lands.
        assert!(timer.alarm().is_some());
    }

    #[test]
    fn blocking_caller_sees_timeout() {
        let (device, hw, timer) = device(1);
        hw.set_honor_kill(true);
        let submitter = {
            let device = device.clone();
            thread::spawn(move || device.process(&blocking()))
        };
        wait_for(|| hw.running() == Some(0));

        timer.advance(TIMEOUT);
        device.handle_timer_interrupt();
        assert_eq!(hw.killed(), vec![0]);
        // The aborted job reports through the normal interrupt.
        device.handle_irq();
        assert_eq!(submitter.join().unwrap(), Err(G2dError::Timeout));
        assert_eq!(device.task_counts().free, 1);
    }

    // Scenario C: an error interrupt fails every active job with a single
    // reset.
    #[test]
    fn error_interrupt_flushes_all() {
        let (device, hw, _) = device(2);
        let first = device.process(&nonblocking()).unwrap();
        let second = device.process(&nonblocking()).unwrap();
        assert_eq!(device.task_counts().active, 2);

        hw.raise_error(0b10);
        device.handle_irq();
        assert_eq!(state_of(&device, first.ticket), TaskState::Error);
        assert_eq!(state_of(&device, second.ticket), TaskState::Error);
        assert_eq!(hw.resets(), 1);
        assert_eq_hex!(hw.cleared_int(), 0b10);
        assert_eq!(device.task_counts().free, 2);
        assert_eq!(device.busy_job_mask(), 0);

        let events: Vec<StampEvent> = device.stamps().iter().map(|s| s.event).collect();
        assert!(events.contains(&StampEvent::ErrInt));
        assert!(events.contains(&StampEvent::GlobalReset));
    }

    #[test]
    fn error_interrupt_wakes_blocking_caller() {
        let (device, hw, _) = device(1);
        let submitter = {
            let device = device.clone();
            thread::spawn(move || device.process(&blocking()))
        };
        wait_for(|| hw.running() == Some(0));
        hw.raise_error(0b1);
        device.handle_irq();
        assert_eq!(submitter.join().unwrap(), Err(G2dError::HardwareError));
    }

    // Scenario D: an exhausted pool refuses work without touching hardware.
    #[test]
    fn exhausted_pool_is_busy() {
        let (device, hw, _) = device(1);
        device.process(&nonblocking()).unwrap();
        assert_eq!(device.process(&nonblocking()), Err(G2dError::Busy));
        assert_eq!(device.process(&blocking()), Err(G2dError::Busy));
        assert_eq!(hw.pushed(), vec![0]);
        assert_eq!(device.statistics().busy_rejects, 2);
        assert_eq!(G2dError::Busy.errno(), -16);
    }

    // Scenario E: a job that ignores kill gets the whole block reset.
    #[test]
    fn double_timeout_resets() {
        let (device, hw, timer) = device(2);
        let hung = device.process(&nonblocking()).unwrap();
        let queued = device.process(&nonblocking()).unwrap();

        timer.advance(TIMEOUT);
        device.handle_timer_interrupt();
        assert_eq!(hw.killed(), vec![0]);
        assert_eq!(hw.resets(), 0);

        timer.advance(TIMEOUT);
        device.handle_timer_interrupt();
        assert_eq!(hw.resets(), 1);
        assert_eq!(state_of(&device, hung.ticket), TaskState::Killed);
        assert_eq!(state_of(&device, queued.ticket), TaskState::Error);
        assert_eq!(device.task_counts().active, 0);
        assert_eq!(device.statistics().double_timeouts, 1);
        assert_eq!(timer.alarm(), None);
    }

    #[test]
    fn repeated_finish_bit_is_ignored() {
        let (device, hw, _) = device(2);
        device.process(&nonblocking()).unwrap();
        hw.complete(0);
        device.handle_irq();
        assert_eq!(device.task_counts().free, 2);

        hw.raise_finished(0b1);
        device.handle_irq();
        assert_eq!(device.task_counts().free, 2);
        assert_eq!(device.statistics().spurious_finishes, 1);

        // Both tasks are still usable.
        device.process(&nonblocking()).unwrap();
        device.process(&nonblocking()).unwrap();
        assert_eq!(device.task_counts().free, 0);
    }

    #[test]
    fn spurious_irq_is_noop() {
        let (device, hw, _) = device(1);
        device.handle_irq();
        assert!(device.stamps().is_empty());
        assert_eq!(hw.resets(), 0);
    }

    // The job finishes just as its deadline expires; the timeout path must
    // leave it to the interrupt.
    #[test]
    fn completion_beats_timeout() {
        let (device, hw, timer) = device(1);
        let info = device.process(&nonblocking()).unwrap();
        hw.complete(0);
        timer.advance(TIMEOUT);
        device.handle_timer_interrupt();
        assert!(hw.killed().is_empty());

        device.handle_irq();
        assert_eq!(state_of(&device, info.ticket), TaskState::Done);
        assert_eq!(device.statistics().lost_interrupts, 0);
    }

    // The completion interrupt retires the job; a deadline that fires
    // afterwards finds nothing to time out.
    #[test]
    fn interrupt_then_deadline() {
        let (device, hw, timer) = device(1);
        let info = device.process(&nonblocking()).unwrap();
        hw.complete(0);
        device.handle_irq();

        timer.advance(3 * TIMEOUT);
        device.handle_timer_interrupt();
        assert!(hw.killed().is_empty());
        assert_eq!(hw.resets(), 0);
        assert_eq!(state_of(&device, info.ticket), TaskState::Done);
        assert_eq!(device.task_counts().free, 1);
        assert_eq!(device.statistics().lost_interrupts, 0);
    }

    // Completion and timer interrupts land together on different threads.
    // Whichever order the lock grants, the waiter sees a clean completion.
    #[test]
    fn irq_and_timer_race() {
        for _ in 0..200 {
            let (device, hw, timer) = device(1);
            let submitter = {
                let device = device.clone();
                thread::spawn(move || device.process(&blocking()))
            };
            wait_for(|| hw.running() == Some(0));
            hw.complete(0);
            timer.advance(TIMEOUT);

            let irq = {
                let device = device.clone();
                thread::spawn(move || device.handle_irq())
            };
            let tick = {
                let device = device.clone();
                thread::spawn(move || device.handle_timer_interrupt())
            };
            irq.join().unwrap();
            tick.join().unwrap();

            let info = submitter.join().unwrap().unwrap();
            assert_eq!(info.task_state(), TaskState::Done);
            assert!(hw.killed().is_empty());
            assert_eq!(hw.resets(), 0);
            assert_eq!(device.task_counts().free, 1);
        }
    }

    #[test]
    fn dispatch_deferred_until_slot_frees() {
        let (device, hw, _) = device(MAX_JOBS + 2);
        let tickets: Vec<Ticket> = (0..MAX_JOBS + 2)
            .map(|_| device.process(&nonblocking()).unwrap().ticket)
            .collect();
        assert_eq_hex!(device.busy_job_mask(), 0xffff);
        assert_eq!(device.task_counts().active, MAX_JOBS);
        assert_eq!(device.task_counts().prepared, 2);
        assert_eq!(state_of(&device, tickets[MAX_JOBS]), TaskState::Prepared);

        hw.complete(0);
        device.handle_irq();
        assert_eq!(device.task_counts().active, MAX_JOBS);
        assert_eq!(device.task_counts().prepared, 1);
        let info = device.poll(tickets[MAX_JOBS]).unwrap().unwrap();
        assert_eq!(info.job_id, Some(0));
        assert_eq!(hw.pushed().iter().filter(|id| **id == 0).count(), 2);

        // Drain everything, checking the active bound along the way.
        while device.task_counts().active > 0 {
            let running = hw.running().unwrap();
            hw.complete(running);
            device.handle_irq();
            assert!(device.task_counts().active <= MAX_JOBS);
        }
        assert_eq!(device.task_counts().free, MAX_JOBS + 2);
        for ticket in tickets {
            assert_eq!(state_of(&device, ticket), TaskState::Done);
        }
    }

    #[test]
    fn suspend_defers_dispatch() {
        let (device, hw, _) = device(2);
        device.prepare_suspend();
        assert!(device.device_state().contains(DeviceState::SUSPEND));

        let info = device.process(&nonblocking()).unwrap();
        assert_eq!(info.task_state(), TaskState::Prepared);
        assert!(hw.pushed().is_empty());

        device.suspend_finish();
        assert!(device.device_state().is_empty());
        assert_eq!(hw.pushed(), vec![0]);
        assert_eq!(state_of(&device, info.ticket), TaskState::Running);
    }

    #[test]
    fn suspend_waits_for_active_jobs() {
        let (device, hw, _) = device(1);
        device.process(&nonblocking()).unwrap();
        let suspender = {
            let device = device.clone();
            thread::spawn(move || device.prepare_suspend())
        };
        wait_for(|| device.device_state().contains(DeviceState::SUSPEND));
        thread::sleep(Duration::from_millis(20));
        assert!(!suspender.is_finished());

        hw.complete(0);
        device.handle_irq();
        suspender.join().unwrap();
        let events: Vec<StampEvent> = device.stamps().iter().map(|s| s.event).collect();
        assert_eq!(events.last(), Some(&StampEvent::SuspendE));
    }

    #[test]
    fn shutdown_rejects_new_work() {
        let (device, hw, _) = device(1);
        device.shutdown();
        assert_eq!(hw.iommu_deactivations(), 1);
        assert_eq!(device.process(&nonblocking()), Err(G2dError::Shutdown));

        device.shutdown();
        assert_eq!(hw.iommu_deactivations(), 1);
        // Resume never reopens a shut down device.
        device.suspend_finish();
        assert!(device.device_state().contains(DeviceState::SHUTDOWN));
        assert_eq!(device.process(&blocking()), Err(G2dError::Shutdown));
    }

    #[test]
    fn shutdown_fails_deferred_task() {
        let (device, hw, _) = device(1);
        device.prepare_suspend();
        let submitter = {
            let device = device.clone();
            thread::spawn(move || device.process(&blocking()))
        };
        wait_for(|| device.task_counts().prepared == 1);

        device.shutdown();
        assert_eq!(submitter.join().unwrap(), Err(G2dError::Shutdown));
        assert!(hw.pushed().is_empty());
        assert_eq!(device.task_counts().free, 1);

        let events: Vec<StampEvent> = device.stamps().iter().map(|s| s.event).collect();
        assert!(events.contains(&StampEvent::ShutdownS));
        assert_eq!(events.last(), Some(&StampEvent::ShutdownE));
    }

    #[test]
    fn states_only_move_forward() {
        let (device, hw, timer) = device(4);
        hw.set_honor_kill(true);
        for _ in 0..4 {
            device.process(&nonblocking()).unwrap();
        }
        hw.complete(0);
        device.handle_irq();
        // Job 1 is now running and hangs.
        timer.advance(TIMEOUT);
        device.handle_timer_interrupt();
        device.handle_irq();
        hw.raise_error(0b1);
        device.handle_irq();

        let stamps = device.stamps();
        let mut seqs: Vec<u64> = stamps.iter().filter_map(|s| s.seq).collect();
        seqs.sort_unstable();
        seqs.dedup();
        assert_eq!(seqs.len(), 4);
        for seq in seqs {
            let states: Vec<u32> = stamps
                .iter()
                .filter(|s| s.seq == Some(seq))
                .map(|s| s.state.into())
                .collect();
            assert!(states.windows(2).all(|w| w[0] <= w[1]), "{:?}", states);
            let last = stamps.iter().rev().find(|s| s.seq == Some(seq)).unwrap();
            assert!(last.state.is_terminal());
        }
    }

    #[test]
    fn stamp_ring_keeps_newest() {
        let (device, hw, timer) = device(1);
        for _ in 0..MAX_STAMPS {
            device.process(&nonblocking()).unwrap();
            timer.advance(Duration::from_micros(10));
            hw.complete(0);
            device.handle_irq();
        }
        let stamps = device.stamps();
        assert_eq!(stamps.len(), MAX_STAMPS);
        assert!(stamps.windows(2).all(|w| w[0].time <= w[1].time));
        assert_eq!(stamps.last().unwrap().event, StampEvent::Done);
    }

    #[test]
    fn concurrent_blocking_submitters() {
        const SUBMITTERS: usize = 4;
        const JOBS: usize = 10;
        let (device, hw, _) = device(SUBMITTERS);
        let submitters: Vec<_> = (0..SUBMITTERS)
            .map(|_| {
                let device = device.clone();
                thread::spawn(move || {
                    for _ in 0..JOBS {
                        let info = device.process(&blocking()).unwrap();
                        assert_eq!(info.task_state(), TaskState::Done);
                    }
                })
            })
            .collect();

        // Plays the hardware until every submitter is done.
        while !submitters.iter().all(|s| s.is_finished()) {
            if let Some(job_id) = hw.running() {
                hw.complete(job_id);
            }
            device.handle_irq();
            assert!(device.task_counts().active <= MAX_JOBS);
            thread::yield_now();
        }
        for submitter in submitters {
            submitter.join().unwrap();
        }
        assert_eq!(device.task_counts().free, SUBMITTERS);
        assert_eq!(hw.pushed().len(), SUBMITTERS * JOBS);
    }

    fn request(req: &G2dRequest) -> Vec<u8> {
        let mut buf = vec![0u8; G2D_REQUEST_DATA_SIZE];
        let len = postcard::to_slice(req, &mut buf).unwrap().len();
        buf.truncate(len);
        buf
    }

    #[test]
    fn component_round_trip() {
        let (g2d, hw) = HostedG2d::hosted(DeviceConfig::default()).unwrap();
        let mut reply = [0u8; 128];

        let len = g2d
            .dispatch(&request(&G2dRequest::Process(nonblocking())), &mut reply)
            .unwrap();
        let info = postcard::from_bytes::<ProcessResponse>(&reply[..len])
            .unwrap()
            .info;
        assert_eq!(info.task_state(), TaskState::Running);

        hw.complete(0);
        g2d.handle_irq();
        let len = g2d
            .dispatch(&request(&G2dRequest::Poll(info.ticket)), &mut reply)
            .unwrap();
        let polled = postcard::from_bytes::<PollResponse>(&reply[..len])
            .unwrap()
            .info
            .unwrap();
        assert_eq!(polled.task_state(), TaskState::Done);

        let len = g2d
            .dispatch(&request(&G2dRequest::CompletedJobs), &mut reply)
            .unwrap();
        let done = postcard::from_bytes::<CompletedJobsResponse>(&reply[..len]).unwrap();
        assert_eq_hex!(done.job_mask, 0b1);

        assert_eq!(g2d.dispatch(&request(&G2dRequest::DebugState), &mut reply), Ok(0));
        assert_eq!(g2d.dispatch(&request(&G2dRequest::DumpStamps), &mut reply), Ok(0));
    }

    #[test]
    fn component_rejects_malformed_requests() {
        let (g2d, hw) = HostedG2d::hosted(DeviceConfig::default()).unwrap();
        let mut reply = [0u8; 64];
        let mut truncated = request(&G2dRequest::Process(nonblocking()));
        truncated.truncate(truncated.len() / 2);
        assert_eq!(g2d.dispatch(&truncated, &mut reply), Err(G2dError::Fault));
        assert_eq!(g2d.dispatch(&[], &mut reply), Err(G2dError::Fault));

        let mut bad = nonblocking();
        bad.commands[0].offset = 0x3;
        assert_eq!(
            g2d.dispatch(&request(&G2dRequest::Process(bad)), &mut reply),
            Err(G2dError::InvalidInput)
        );
        assert!(hw.pushed().is_empty());
    }

    #[test]
    fn timer_service_kills_hung_job() {
        let config = DeviceConfig {
            hw_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let (g2d, hw) = HostedG2d::hosted(config).unwrap();
        g2d.start_timer_service(Duration::from_millis(2));
        let info = g2d.device().process(&nonblocking()).unwrap();
        wait_for(|| !hw.killed().is_empty());
        g2d.stop_timer_service();
        assert_eq!(hw.killed(), vec![0]);
        let killed = g2d.device().poll(info.ticket).unwrap().unwrap();
        assert_eq!(killed.task_state(), TaskState::Killed);
    }

    // The service only touches the watchdog once the timer raises its
    // alarm, even when a deadline has already passed.
    #[test]
    fn timer_service_waits_for_alarm() {
        let hw = FakeG2dCore::new();
        let timer = FakeTimer::new();
        let g2d = G2dComponent::new(hw.clone(), timer.clone(), DeviceConfig::default()).unwrap();
        g2d.start_timer_service(Duration::from_millis(1));
        let info = g2d.device().process(&nonblocking()).unwrap();
        assert!(timer.alarm().is_some());

        // Drop the pending alarm before time passes the deadline.
        timer.ack_interrupt();
        timer.advance(TIMEOUT);
        thread::sleep(Duration::from_millis(30));
        assert!(hw.killed().is_empty());
        assert_eq!(state_of(g2d.device(), info.ticket), TaskState::Running);

        timer.set_alarm(timer.now());
        wait_for(|| !hw.killed().is_empty());
        g2d.stop_timer_service();
        assert_eq!(hw.killed(), vec![0]);
    }
}
