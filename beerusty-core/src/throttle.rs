/*
    Copyright (C) 2020-2022  Rafal Michalski

    This file is part of BEERUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! The speed throttle controller keeping the emulation in step with the host's wall-clock.
//!
//! A host timer calls [ThrottleState::on_timer_tick] at a fixed nominal period. Each tick adds
//! the number of CPU cycles the period is worth to a signed cycle-debt accumulator. The emulation
//! loop subtracts the cycles it has executed on every synchronization pass with
//! [ThrottleState::sync_pass].
//!
//! * When the debt falls below `-catchup_point` the emulation is ahead of time and the pass
//!   spin-waits until the debt becomes non-negative again.
//! * When the debt rises above `overrun_ceiling` the host can't keep up: the video controller
//!   update granularity is increased and, once it reaches its maximum, the video clock division
//!   factor is doubled.
//! * After `lag_threshold` consecutive waiting passes the adjustments are relaxed back towards
//!   the saved pre-throttle pair, in reverse order.
//!
//! [ThrottleState] consists of atomics only, so it can be shared between the emulation thread
//! and the timer contexts as an `Arc<ThrottleState>` without any locks.
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use core::time::Duration;
use std::time::Instant;

use log::{debug, info};
#[cfg(feature = "snapshot")]
use serde::{Serialize, Deserialize};

use crate::clock::{nanos_to_cycles, CycleBudget, DEFAULT_CPU_HZ, MIN_CPU_HZ, MAX_CPU_HZ};
use crate::config::{clamp_setting, floor_power_of_two};

pub const MIN_TIMER_PERIOD_US: u32 = 1_000;
pub const MAX_TIMER_PERIOD_US: u32 = 100_000;
pub const MAX_CATCHUP_POINT: u32 = 10_000_000;
pub const MAX_GRANULARITY: u32 = 64;
pub const MAX_DIVISION: u32 = 64;

/// Speed throttle configuration.
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "snapshot", serde(default))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThrottleConfig {
    /// Whether the emulation is throttled to the real time at start-up.
    pub enabled: bool,
    /// The nominal period of the host timer in microseconds.
    pub timer_period_us: u32,
    /// How many cycles the emulation may run ahead of time before a pass waits.
    pub catchup_point: u32,
    /// The debt at which the accumulator is pulled back.
    pub debt_ceiling: u32,
    /// The value the accumulator is pulled back to.
    pub debt_pullback: u32,
    /// The debt above which the update granularity is degraded.
    pub overrun_ceiling: u32,
    pub granularity_min: u32,
    pub granularity_max: u32,
    pub division_min: u32,
    pub division_max: u32,
    /// The number of consecutive waiting passes after which the adjustments are relaxed.
    pub lag_threshold: u32,
    /// The period of the timer recalibration in seconds.
    pub recalibrate_secs: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        ThrottleConfig {
            enabled: true,
            timer_period_us: 10_000,
            catchup_point: 0,
            debt_ceiling: 337_500,
            debt_pullback: 33_750,
            overrun_ceiling: 67_500,
            granularity_min: 1,
            granularity_max: 8,
            division_min: 1,
            division_max: 8,
            lag_threshold: 5,
            recalibrate_secs: 2,
        }
    }
}

impl ThrottleConfig {
    /// Returns the configuration with every value clamped to its accepted range.
    ///
    /// Division factors are rounded down to powers of two.
    pub fn clamped(self) -> Self {
        let timer_period_us = clamp_setting("throttle.timer_period_us", self.timer_period_us,
                                            MIN_TIMER_PERIOD_US, MAX_TIMER_PERIOD_US);
        let catchup_point = clamp_setting("throttle.catchup_point", self.catchup_point, 0, MAX_CATCHUP_POINT);
        let debt_ceiling = clamp_setting("throttle.debt_ceiling", self.debt_ceiling, 1, i32::MAX as u32);
        let debt_pullback = clamp_setting("throttle.debt_pullback", self.debt_pullback, 0, debt_ceiling);
        let overrun_ceiling = clamp_setting("throttle.overrun_ceiling", self.overrun_ceiling, 1, i32::MAX as u32);
        let granularity_min = clamp_setting("throttle.granularity_min", self.granularity_min, 1, MAX_GRANULARITY);
        let granularity_max = clamp_setting("throttle.granularity_max", self.granularity_max,
                                            granularity_min, MAX_GRANULARITY);
        let division_min = floor_power_of_two(
                        clamp_setting("throttle.division_min", self.division_min, 1, MAX_DIVISION));
        let division_max = floor_power_of_two(
                        clamp_setting("throttle.division_max", self.division_max, division_min, MAX_DIVISION));
        let lag_threshold = clamp_setting("throttle.lag_threshold", self.lag_threshold, 1, u32::MAX);
        let recalibrate_secs = clamp_setting("throttle.recalibrate_secs", self.recalibrate_secs, 1, 60);
        ThrottleConfig {
            enabled: self.enabled,
            timer_period_us, catchup_point, debt_ceiling, debt_pullback, overrun_ceiling,
            granularity_min, granularity_max, division_min, division_max,
            lag_threshold, recalibrate_secs
        }
    }

    pub fn timer_period(&self) -> Duration {
        Duration::from_micros(self.timer_period_us as u64)
    }

    pub fn recalibrate_period(&self) -> Duration {
        Duration::from_secs(self.recalibrate_secs as u64)
    }
}

/// The video controller update parameters for a single synchronization pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThrottleDecision {
    /// The number of passes whose cycles are batched into one video controller update.
    pub granularity: u32,
    /// The video controller clock division factor.
    pub division: u32,
    /// Whether the pass that produced this decision had to wait for the host.
    pub waited: bool,
}

/// A snapshot of the throttle counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThrottleStats {
    pub ticks: u64,
    pub timer_period: Duration,
    pub cycles_per_tick: u64,
    pub debt: i64,
    pub granularity: u32,
    pub division: u32,
    pub wait_streak: u32,
    pub enabled: bool,
    pub paused: bool,
}

/// The state of the speed throttle controller shared between the emulation loop and the host timers.
#[derive(Debug)]
pub struct ThrottleState {
    config: ThrottleConfig,
    debt: AtomicI64,
    enabled: AtomicBool,
    paused: AtomicBool,
    interrupt: AtomicBool,
    granularity: AtomicU32,
    division: AtomicU32,
    saved_granularity: AtomicU32,
    saved_division: AtomicU32,
    wait_streak: AtomicU32,
    ticks: AtomicU64,
    cpu_hz: AtomicU32,
    timer_period_ns: AtomicU64,
    cycles_per_tick: AtomicU64,
}

impl Default for ThrottleState {
    fn default() -> Self {
        ThrottleState::new(ThrottleConfig::default(), DEFAULT_CPU_HZ)
    }
}

impl ThrottleState {
    /// Creates a new throttle state from the `config` for the CPU running at `cpu_hz`.
    pub fn new(config: ThrottleConfig, cpu_hz: u32) -> Self {
        let config = config.clamped();
        let cpu_hz = clamp_setting("cpu_hz", cpu_hz, MIN_CPU_HZ, MAX_CPU_HZ);
        let timer_period_ns = config.timer_period_us as u64 * 1_000;
        ThrottleState {
            debt: AtomicI64::new(0),
            enabled: AtomicBool::new(config.enabled),
            paused: AtomicBool::new(false),
            interrupt: AtomicBool::new(false),
            granularity: AtomicU32::new(config.granularity_min),
            division: AtomicU32::new(config.division_min),
            saved_granularity: AtomicU32::new(config.granularity_min),
            saved_division: AtomicU32::new(config.division_min),
            wait_streak: AtomicU32::new(0),
            ticks: AtomicU64::new(0),
            cpu_hz: AtomicU32::new(cpu_hz),
            timer_period_ns: AtomicU64::new(timer_period_ns),
            cycles_per_tick: AtomicU64::new(nanos_to_cycles(timer_period_ns, cpu_hz)),
            config,
        }
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }
    /// Called from the host timer context at every timer period.
    ///
    /// Increments the tick counter and, unless throttling is disabled or the emulation is paused,
    /// adds the cycles worth of one timer period to the debt accumulator.
    pub fn on_timer_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        if !self.enabled.load(Ordering::Relaxed) || self.paused.load(Ordering::Relaxed) {
            return
        }
        let cycles = self.cycles_per_tick.load(Ordering::Relaxed) as i64;
        let ceiling = self.config.debt_ceiling as i64;
        let pullback = self.config.debt_pullback as i64;
        let _ = self.debt.fetch_update(Ordering::AcqRel, Ordering::Acquire, |debt| {
            let debt = debt.saturating_add(cycles);
            Some(if debt > ceiling { pullback } else { debt })
        });
    }
    /// Registers that the CPU has executed `cycles` and adapts the video update parameters.
    ///
    /// Returns `true` if the emulation is ahead of time and should wait with [ThrottleState::catch_up].
    /// Does nothing and returns `false` if throttling is disabled.
    pub fn advance(&self, cycles: CycleBudget) -> bool {
        if !self.enabled.load(Ordering::Relaxed) {
            self.wait_streak.store(0, Ordering::Relaxed);
            return false
        }
        let cycles = cycles.get() as i64;
        let debt = self.debt.fetch_sub(cycles, Ordering::AcqRel).saturating_sub(cycles);
        let catch_up = debt < -(self.config.catchup_point as i64);
        if debt > self.config.overrun_ceiling as i64 {
            self.wait_streak.store(0, Ordering::Relaxed);
            self.degrade();
        }
        else if catch_up {
            let streak = self.wait_streak.load(Ordering::Relaxed) + 1;
            if streak >= self.config.lag_threshold {
                self.wait_streak.store(0, Ordering::Relaxed);
                self.relax();
            }
            else {
                self.wait_streak.store(streak, Ordering::Relaxed);
            }
        }
        else {
            self.wait_streak.store(0, Ordering::Relaxed);
        }
        catch_up
    }
    /// Busy-waits until the debt accumulator becomes non-negative.
    ///
    /// Returns `true` if the debt was paid off or `false` if the wait was cancelled by disabling
    /// throttling, pausing or by calling [ThrottleState::interrupt].
    pub fn catch_up(&self) -> bool {
        loop {
            if self.debt.load(Ordering::Acquire) >= 0 {
                return true
            }
            if !self.enabled.load(Ordering::Acquire) || self.paused.load(Ordering::Acquire)
                || self.interrupt.swap(false, Ordering::AcqRel) {
                return false
            }
            std::hint::spin_loop();
        }
    }
    /// Performs the throttle part of a synchronization pass, after the CPU has executed `cycles`.
    ///
    /// Returns the video update parameters to be used for the next pass.
    pub fn sync_pass(&self, cycles: CycleBudget) -> ThrottleDecision {
        let waited = self.advance(cycles) && self.catch_up();
        ThrottleDecision { waited, ..self.decision() }
    }
    /// Returns the current video update parameters.
    pub fn decision(&self) -> ThrottleDecision {
        ThrottleDecision {
            granularity: self.granularity.load(Ordering::Relaxed),
            division: self.division.load(Ordering::Relaxed),
            waited: false
        }
    }
    /// Cancels the current or the next spin-wait.
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
    /// Enables or disables throttling. Disabling cancels a pending spin-wait and clears the debt.
    pub fn set_enabled(&self, enabled: bool) {
        if !self.enabled.swap(enabled, Ordering::AcqRel) && enabled {
            self.debt.store(0, Ordering::Release);
        }
        if !enabled {
            self.wait_streak.store(0, Ordering::Relaxed);
        }
        debug!("throttle {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }
    /// Pauses or resumes the emulation. On resume the debt accumulator starts from zero.
    pub fn set_paused(&self, paused: bool) {
        if self.paused.swap(paused, Ordering::AcqRel) && !paused {
            self.debt.store(0, Ordering::Release);
        }
    }
    /// Sets the pre-throttle pair the adjustments are relaxed towards and makes it current.
    pub fn set_baseline(&self, granularity: u32, division: u32) {
        let config = &self.config;
        let granularity = clamp_setting("granularity", granularity, config.granularity_min, config.granularity_max);
        let division = floor_power_of_two(
                        clamp_setting("division", division, config.division_min, config.division_max));
        self.saved_granularity.store(granularity, Ordering::Relaxed);
        self.saved_division.store(division, Ordering::Relaxed);
        self.granularity.store(granularity, Ordering::Relaxed);
        self.division.store(division, Ordering::Relaxed);
    }
    /// Resets the state on emulator power-on/off: clears the debt and the counters and restores
    /// the saved pre-throttle pair.
    pub fn reset(&self) {
        self.debt.store(0, Ordering::Release);
        self.wait_streak.store(0, Ordering::Relaxed);
        self.ticks.store(0, Ordering::Relaxed);
        self.interrupt.store(false, Ordering::Relaxed);
        self.granularity.store(self.saved_granularity.load(Ordering::Relaxed), Ordering::Relaxed);
        self.division.store(self.saved_division.load(Ordering::Relaxed), Ordering::Relaxed);
    }
    /// Changes the CPU clock frequency the timer ticks are converted with.
    pub fn set_cpu_hz(&self, cpu_hz: u32) {
        let cpu_hz = clamp_setting("cpu_hz", cpu_hz, MIN_CPU_HZ, MAX_CPU_HZ);
        self.cpu_hz.store(cpu_hz, Ordering::Relaxed);
        self.update_cycles_per_tick();
    }
    /// Re-measures the host timer period from the wall-clock time `elapsed` during `ticks` timer ticks.
    ///
    /// Returns the new timer period, or `None` if nothing was measured.
    pub fn recalibrate(&self, elapsed: Duration, ticks: u64) -> Option<Duration> {
        if ticks == 0 {
            return None
        }
        let period_ns = (elapsed.as_nanos() / ticks as u128).min(u64::MAX as u128) as u64;
        let period_ns = period_ns.max(MIN_TIMER_PERIOD_US as u64 * 1_000)
                                 .min(MAX_TIMER_PERIOD_US as u64 * 1_000);
        self.timer_period_ns.store(period_ns, Ordering::Relaxed);
        self.update_cycles_per_tick();
        let period = Duration::from_nanos(period_ns);
        debug!("timer recalibrated: {:?} per tick, {} cycles", period, self.cycles_per_tick.load(Ordering::Relaxed));
        Some(period)
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn debt(&self) -> i64 {
        self.debt.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> ThrottleStats {
        ThrottleStats {
            ticks: self.ticks(),
            timer_period: Duration::from_nanos(self.timer_period_ns.load(Ordering::Relaxed)),
            cycles_per_tick: self.cycles_per_tick.load(Ordering::Relaxed),
            debt: self.debt(),
            granularity: self.granularity.load(Ordering::Relaxed),
            division: self.division.load(Ordering::Relaxed),
            wait_streak: self.wait_streak.load(Ordering::Relaxed),
            enabled: self.is_enabled(),
            paused: self.is_paused(),
        }
    }

    fn update_cycles_per_tick(&self) {
        let cycles = nanos_to_cycles(self.timer_period_ns.load(Ordering::Relaxed),
                                     self.cpu_hz.load(Ordering::Relaxed));
        self.cycles_per_tick.store(cycles, Ordering::Relaxed);
    }

    fn degrade(&self) -> bool {
        let granularity = self.granularity.load(Ordering::Relaxed);
        if granularity < self.config.granularity_max {
            self.granularity.store(granularity + 1, Ordering::Relaxed);
            info!("host lagging: video granularity {}", granularity + 1);
            return true
        }
        let division = self.division.load(Ordering::Relaxed);
        if division < self.config.division_max {
            let division = (division * 2).min(self.config.division_max);
            self.division.store(division, Ordering::Relaxed);
            info!("host lagging: video clock division {}", division);
            return true
        }
        false
    }

    fn relax(&self) -> bool {
        let division = self.division.load(Ordering::Relaxed);
        let saved_division = self.saved_division.load(Ordering::Relaxed);
        if division > saved_division {
            let division = (division / 2).max(saved_division);
            self.division.store(division, Ordering::Relaxed);
            debug!("host catching up: video clock division {}", division);
            return true
        }
        let granularity = self.granularity.load(Ordering::Relaxed);
        if granularity > self.saved_granularity.load(Ordering::Relaxed) {
            self.granularity.store(granularity - 1, Ordering::Relaxed);
            debug!("host catching up: video granularity {}", granularity - 1);
            return true
        }
        false
    }
}

/// Periodically re-measures the true host timer period of a [ThrottleState].
///
/// The measurement is inert while the emulation is paused and restarts from scratch on resume.
#[derive(Clone, Copy, Debug, Default)]
pub struct Recalibrator {
    mark: Option<(Instant, u64)>,
}

impl Recalibrator {
    pub fn new() -> Self {
        Recalibrator::default()
    }
    /// Should be called from the recalibration timer context with the current time.
    ///
    /// Returns the new timer period if the state was recalibrated.
    pub fn poll(&mut self, state: &ThrottleState, now: Instant) -> Option<Duration> {
        if state.is_paused() {
            self.mark = None;
            return None
        }
        let ticks = state.ticks();
        match self.mark {
            Some((since, mark_ticks)) if ticks > mark_ticks => {
                self.mark = Some((now, ticks));
                state.recalibrate(now.saturating_duration_since(since), ticks - mark_ticks)
            }
            _ => {
                self.mark = Some((now, ticks));
                None
            }
        }
    }
}
