/*
    Copyright (C) 2020-2022  Rafal Michalski

    This file is part of BEERUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! Emulated CPU clock cycle counters and cycle <-> wall-clock conversions.
use core::iter::Sum;
use core::ops::{Add, AddAssign};
use core::time::Duration;

#[cfg(feature = "snapshot")]
use serde::{Serialize, Deserialize};

use crate::config::clamp_setting;

/// The number of nanoseconds in a second.
pub const NANOS_PER_SEC: u64 = 1_000_000_000;
/// The default Microbee CPU clock frequency in Hz.
pub const DEFAULT_CPU_HZ: u32 = 3_375_000;
/// The lowest accepted CPU clock frequency in Hz.
pub const MIN_CPU_HZ: u32 = 1_000_000;
/// The highest accepted CPU clock frequency in Hz.
pub const MAX_CPU_HZ: u32 = 13_500_000;
/// The default number of cycles executed in a single synchronization pass (1 ms at 3.375 MHz).
pub const DEFAULT_QUANTUM: u32 = 3_375;
pub const MIN_QUANTUM: u32 = 64;
pub const MAX_QUANTUM: u32 = 1_000_000;

/// Returns the duration of `cycles` CPU clock cycles in nanoseconds for the given `cpu_hz`.
#[inline]
pub const fn cycles_to_nanos(cycles: u64, cpu_hz: u32) -> u64 {
    (cycles as u128 * NANOS_PER_SEC as u128 / cpu_hz as u128) as u64
}

/// Returns the number of CPU clock cycles that fit in `nanos` nanoseconds for the given `cpu_hz`.
#[inline]
pub const fn nanos_to_cycles(nanos: u64, cpu_hz: u32) -> u64 {
    (nanos as u128 * cpu_hz as u128 / NANOS_PER_SEC as u128) as u64
}

/// An unsigned quantum of CPU clock cycles delivered to one synchronization pass.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CycleBudget(u32);

impl CycleBudget {
    #[inline]
    pub const fn new(cycles: u32) -> Self {
        CycleBudget(cycles)
    }
    /// Returns the number of cycles in this budget.
    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for CycleBudget {
    fn from(cycles: u32) -> Self {
        CycleBudget(cycles)
    }
}

impl From<CycleBudget> for u32 {
    fn from(budget: CycleBudget) -> Self {
        budget.0
    }
}

impl From<CycleBudget> for u64 {
    fn from(budget: CycleBudget) -> Self {
        budget.0 as u64
    }
}

impl Add for CycleBudget {
    type Output = CycleBudget;
    #[inline]
    fn add(self, other: CycleBudget) -> CycleBudget {
        CycleBudget(self.0.saturating_add(other.0))
    }
}

impl AddAssign for CycleBudget {
    #[inline]
    fn add_assign(&mut self, other: CycleBudget) {
        *self = *self + other
    }
}

impl Sum for CycleBudget {
    fn sum<I: Iterator<Item=CycleBudget>>(iter: I) -> Self {
        iter.fold(CycleBudget::default(), Add::add)
    }
}

/// Cycle clock configuration.
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "snapshot", serde(default))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockConfig {
    /// The CPU clock frequency in Hz.
    pub cpu_hz: u32,
    /// The number of cycles the CPU driver executes in a single synchronization pass.
    pub quantum: u32,
}

impl Default for ClockConfig {
    fn default() -> Self {
        ClockConfig { cpu_hz: DEFAULT_CPU_HZ, quantum: DEFAULT_QUANTUM }
    }
}

impl ClockConfig {
    /// Returns the configuration with every value clamped to its accepted range.
    pub fn clamped(self) -> Self {
        ClockConfig {
            cpu_hz: clamp_setting("clock.cpu_hz", self.cpu_hz, MIN_CPU_HZ, MAX_CPU_HZ),
            quantum: clamp_setting("clock.quantum", self.quantum, MIN_QUANTUM, MAX_QUANTUM),
        }
    }
}

/// Tracks elapsed emulated clock cycles since power-on.
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CycleClock {
    cpu_hz: u32,
    cycles: u64,
}

impl Default for CycleClock {
    fn default() -> Self {
        CycleClock::new(DEFAULT_CPU_HZ)
    }
}

impl CycleClock {
    /// Creates a new clock for the CPU running at `cpu_hz` (clamped to the accepted range).
    pub fn new(cpu_hz: u32) -> Self {
        let cpu_hz = clamp_setting("cpu_hz", cpu_hz, MIN_CPU_HZ, MAX_CPU_HZ);
        CycleClock { cpu_hz, cycles: 0 }
    }

    #[inline]
    pub fn cpu_hz(&self) -> u32 {
        self.cpu_hz
    }
    /// Changes the CPU clock frequency. The cycle counter is preserved.
    pub fn set_cpu_hz(&mut self, cpu_hz: u32) {
        self.cpu_hz = clamp_setting("cpu_hz", cpu_hz, MIN_CPU_HZ, MAX_CPU_HZ);
    }
    /// Returns the total number of cycles elapsed since power-on.
    #[inline]
    pub fn cycles(&self) -> u64 {
        self.cycles
    }
    /// Registers the `budget` of executed cycles and returns the new total.
    #[inline]
    pub fn advance(&mut self, budget: CycleBudget) -> u64 {
        self.cycles = self.cycles.wrapping_add(budget.get() as u64);
        self.cycles
    }

    pub fn reset(&mut self) {
        self.cycles = 0;
    }
    /// Returns the emulated time elapsed since power-on.
    pub fn elapsed(&self) -> Duration {
        self.cycles_to_duration(self.cycles)
    }

    #[inline]
    pub fn cycles_to_nanos(&self, cycles: u64) -> u64 {
        cycles_to_nanos(cycles, self.cpu_hz)
    }

    #[inline]
    pub fn nanos_to_cycles(&self, nanos: u64) -> u64 {
        nanos_to_cycles(nanos, self.cpu_hz)
    }

    pub fn duration_to_cycles(&self, duration: Duration) -> u64 {
        let nanos = duration.as_nanos().min(u64::MAX as u128) as u64;
        self.nanos_to_cycles(nanos)
    }

    pub fn cycles_to_duration(&self, cycles: u64) -> Duration {
        Duration::from_nanos(self.cycles_to_nanos(cycles))
    }
    /// Returns the number of cycles of a single period of a signal with the given `frequency` in Hz,
    /// rounded to the nearest cycle.
    pub fn period_cycles(&self, frequency: u32) -> u32 {
        if frequency == 0 {
            return u32::MAX
        }
        (self.cpu_hz + frequency / 2) / frequency
    }
}
