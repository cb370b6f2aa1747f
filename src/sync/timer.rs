/*
    Copyright (C) 2020-2022  Rafal Michalski

    This file is part of BEERUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error};

use crate::throttle::{Recalibrator, ThrottleConfig, ThrottleState};
use super::SyncError;

const RECALIBRATE_SLICE: Duration = Duration::from_millis(50);

/// Levels the wall-clock time of a periodic thread with a desired period by sleeping.
#[derive(Clone, Copy, Debug)]
pub struct PeriodTimer {
    /// The start time of the current period.
    pub time: Instant,
    /// The desired duration of a single period.
    pub period: Duration,
}

impl PeriodTimer {
    pub fn new(period: Duration) -> Self {
        PeriodTimer { time: Instant::now(), period }
    }
    /// Sleeps until the end of the current period.
    ///
    /// Returns `Err(missed_periods)` without sleeping if the current period has already passed,
    /// in this instance the next period starts now.
    pub fn synchronize_thread_to_period(&mut self) -> Result<(), u32> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.time);
        if let Some(duration) = self.period.checked_sub(elapsed) {
            thread::sleep(duration);
            self.time += self.period;
            Ok(())
        }
        else {
            let missed = (elapsed.as_secs_f64() / self.period.as_secs_f64()).trunc() as u32;
            self.time = now;
            Err(missed)
        }
    }
}

/// The host timer threads driving a [ThrottleState].
///
/// The tick thread calls [ThrottleState::on_timer_tick] every timer period and the
/// recalibration thread re-measures the actual period of the ticks. Both threads are stopped
/// and joined when the instance is dropped.
#[derive(Debug)]
pub struct HostTimers {
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl HostTimers {
    /// Spawns the timer threads.
    pub fn start(state: Arc<ThrottleState>, config: &ThrottleConfig) -> Result<Self, SyncError> {
        let stop = Arc::new(AtomicBool::new(false));
        let mut timers = HostTimers { stop, threads: Vec::with_capacity(2) };

        let period = config.timer_period();
        let tick_state = Arc::clone(&state);
        let tick_stop = Arc::clone(&timers.stop);
        timers.spawn("beerusty-tick", move || {
            let mut timer = PeriodTimer::new(period);
            while !tick_stop.load(Ordering::Acquire) {
                if let Err(missed) = timer.synchronize_thread_to_period() {
                    if missed > 1 {
                        debug!("timer: missed {} periods", missed);
                    }
                }
                tick_state.on_timer_tick();
            }
        })?;

        let recalibrate_period = config.recalibrate_period();
        let recal_stop = Arc::clone(&timers.stop);
        timers.spawn("beerusty-recalibrate", move || {
            let mut recalibrator = Recalibrator::new();
            let mut since = Instant::now();
            while !recal_stop.load(Ordering::Acquire) {
                thread::sleep(RECALIBRATE_SLICE);
                if since.elapsed() >= recalibrate_period {
                    since = Instant::now();
                    recalibrator.poll(&state, since);
                }
            }
        })?;
        Ok(timers)
    }

    fn spawn<F: FnOnce() + Send + 'static>(&mut self, name: &str, f: F) -> Result<(), SyncError> {
        match thread::Builder::new().name(name.into()).spawn(f) {
            Ok(handle) => {
                self.threads.push(handle);
                Ok(())
            }
            Err(e) => {
                error!("can't start the {} thread: {}", name, e);
                self.stop();
                Err(SyncError::TimerInstall(e))
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !self.threads.is_empty()
    }
    /// Stops the timer threads and waits for them to finish.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("a timer thread panicked");
            }
        }
    }
}

impl Drop for HostTimers {
    fn drop(&mut self) {
        self.stop();
    }
}
