/*
    Copyright (C) 2020-2022  Rafal Michalski

    This file is part of BEERUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! **TAPE** signal timing, encoding and decoding.
//!
//! The signal is described as a sequence of half-cycles: intervals measured in CPU cycles between
//! consecutive level changes of the cassette line. A half-cycle of the 1200 Hz tone ([Tone::Low])
//! lasts 1406 cycles and a half-cycle of the 2400 Hz tone ([Tone::High]) lasts 703 cycles of the
//! 3.375 MHz Microbee clock.
use core::num::NonZeroU32;

#[cfg(feature = "snapshot")]
use serde::{Serialize, Deserialize};

mod decoding;
mod encoding;

pub use decoding::*;
pub use encoding::*;

pub mod consts {
    use core::num::NonZeroU32;
    /// The frequency of the tone encoding bit `0` in Hz.
    pub const LOW_TONE_HZ: u32 = 1200;
    /// The frequency of the tone encoding bit `1` in Hz.
    pub const HIGH_TONE_HZ: u32 = 2400;
    /// Length of the 1200 Hz half-cycle in cycles of the 3.375 MHz clock.
    pub const LOW_HALF_CYCLE : NonZeroU32 = unsafe { NonZeroU32::new_unchecked(1406) };
    /// Length of the 2400 Hz half-cycle in cycles of the 3.375 MHz clock.
    pub const HIGH_HALF_CYCLE: NonZeroU32 = unsafe { NonZeroU32::new_unchecked(703) };
    /// The number of 1200 Hz cycles in a 300 baud bit.
    pub const N0: u32 = 4;
    /// The number of 1200 Hz cycles preceding the stop bits of a save leader byte at 300 baud.
    pub const SAVE_LEADER_CYCLES: u32 = 9 * N0;
    /// The number of bits in a byte on tape: a boundary bit, 8 data bits and 2 stop bits.
    pub const BITS_PER_BYTE: usize = 11;
    /// The number of stop bits.
    pub const STOP_BITS: u8 = 2;
}

use consts::*;

/// The tone of a half-cycle.
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tone {
    /// 1200 Hz, bit value `0`.
    Low,
    /// 2400 Hz, bit value `1`.
    High,
}

impl Tone {
    #[inline]
    pub fn bit(self) -> bool {
        self == Tone::High
    }
}

impl From<bool> for Tone {
    #[inline]
    fn from(bit: bool) -> Self {
        if bit { Tone::High } else { Tone::Low }
    }
}

/// The pace of the bits on tape.
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Baud {
    B300,
    B1200,
}

impl Default for Baud {
    fn default() -> Self {
        Baud::B300
    }
}

impl Baud {
    /// Returns the number of 1200 Hz half-cycles of a bit `0`.
    #[inline]
    pub fn zero_half_cycles(self) -> u8 {
        match self {
            Baud::B300 => 2 * N0 as u8,
            Baud::B1200 => 2
        }
    }
    /// Returns the number of 2400 Hz half-cycles of a bit `1`.
    #[inline]
    pub fn one_half_cycles(self) -> u8 {
        2 * self.zero_half_cycles()
    }
    /// Returns the number of half-cycles of a bit with the given `tone`.
    #[inline]
    pub fn half_cycles(self, tone: Tone) -> u8 {
        match tone {
            Tone::Low => self.zero_half_cycles(),
            Tone::High => self.one_half_cycles()
        }
    }

    pub fn bits_per_second(self) -> u32 {
        match self {
            Baud::B300 => 300,
            Baud::B1200 => 1200
        }
    }
}

/// The half-cycle durations and their tolerance windows for a particular CPU clock.
///
/// The windows of both tones are disjoint for tolerances up to 33%.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PulseTiming {
    low: NonZeroU32,
    high: NonZeroU32,
    low_min: u32,
    low_max: u32,
    high_min: u32,
    high_max: u32,
}

impl Default for PulseTiming {
    fn default() -> Self {
        PulseTiming::new(3_375_000, 25)
    }
}

impl PulseTiming {
    /// Creates the timing for the CPU running at `cpu_hz` accepting half-cycles deviating by up to
    /// `tolerance_percent` (at most 33) from their nominal durations.
    pub fn new(cpu_hz: u32, tolerance_percent: u32) -> Self {
        let tolerance_percent = tolerance_percent.min(33);
        let low = half_cycle(cpu_hz, LOW_TONE_HZ);
        let high = half_cycle(cpu_hz, HIGH_TONE_HZ);
        let low_tolerance = low.get() * tolerance_percent / 100;
        let high_tolerance = high.get() * tolerance_percent / 100;
        PulseTiming {
            low,
            high,
            low_min: low.get() - low_tolerance,
            low_max: low.get() + low_tolerance,
            high_min: high.get() - high_tolerance,
            high_max: high.get() + high_tolerance,
        }
    }
    /// Returns the nominal duration of a half-cycle of the given `tone`.
    #[inline]
    pub fn half_cycle(&self, tone: Tone) -> NonZeroU32 {
        match tone {
            Tone::Low => self.low,
            Tone::High => self.high
        }
    }
    /// Classifies a half-cycle lasting `cycles`. Returns `None` if it's outside both windows.
    #[inline]
    pub fn classify(&self, cycles: u32) -> Option<Tone> {
        match cycles {
            c if (self.high_min..=self.high_max).contains(&c) => Some(Tone::High),
            c if (self.low_min..=self.low_max).contains(&c) => Some(Tone::Low),
            _ => None
        }
    }
}

fn half_cycle(cpu_hz: u32, tone_hz: u32) -> NonZeroU32 {
    let period = 2 * tone_hz;
    NonZeroU32::new((cpu_hz + tone_hz) / period).unwrap_or(HIGH_HALF_CYCLE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulse_timing_works() {
        let timing = PulseTiming::default();
        assert_eq!(LOW_HALF_CYCLE, timing.half_cycle(Tone::Low));
        assert_eq!(HIGH_HALF_CYCLE, timing.half_cycle(Tone::High));
        assert_eq!(None, timing.classify(0));
        assert_eq!(None, timing.classify(527));
        assert_eq!(Some(Tone::High), timing.classify(528));
        assert_eq!(Some(Tone::High), timing.classify(703));
        assert_eq!(Some(Tone::High), timing.classify(878));
        assert_eq!(None, timing.classify(879));
        assert_eq!(None, timing.classify(1054));
        assert_eq!(Some(Tone::Low), timing.classify(1055));
        assert_eq!(Some(Tone::Low), timing.classify(1406));
        assert_eq!(Some(Tone::Low), timing.classify(1757));
        assert_eq!(None, timing.classify(1758));
        assert_eq!(None, timing.classify(u32::MAX));
    }

    #[test]
    fn pulse_timing_windows_are_disjoint() {
        for &cpu_hz in &[1_000_000, 2_000_000, 3_375_000, 6_750_000, 13_500_000] {
            for tolerance in 0..=40 {
                let timing = PulseTiming::new(cpu_hz, tolerance);
                assert!(timing.high_max < timing.low_min);
                assert_eq!(Some(Tone::Low), timing.classify(timing.half_cycle(Tone::Low).get()));
                assert_eq!(Some(Tone::High), timing.classify(timing.half_cycle(Tone::High).get()));
            }
        }
        let timing = PulseTiming::new(6_750_000, 25);
        assert_eq!((2813, 1406), (timing.half_cycle(Tone::Low).get(), timing.half_cycle(Tone::High).get()));
    }

    #[test]
    fn baud_works() {
        assert_eq!((8, 16), (Baud::B300.zero_half_cycles(), Baud::B300.one_half_cycles()));
        assert_eq!((2, 4), (Baud::B1200.zero_half_cycles(), Baud::B1200.one_half_cycles()));
        assert_eq!(16, Baud::B300.half_cycles(Tone::High));
        assert_eq!(2, Baud::B1200.half_cycles(Tone::Low));
        assert_eq!(Tone::High, Tone::from(true));
        assert!(!Tone::Low.bit());
        assert_eq!(1200, Baud::B1200.bits_per_second());
    }
}
