/*
    Copyright (C) 2020-2022  Rafal Michalski

    This file is part of BEERUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
#[cfg(feature = "snapshot")]
use serde::{Serialize, Deserialize};

use crate::tape::TapeFormat;
use super::{Baud, Tone};
use super::consts::*;

/// The position of the [CourseDecoder] within a transmitted byte.
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CourseState {
    /// Initial state, counting 1200 Hz half-cycles until the first 2400 Hz half-cycle.
    Idle {
        low: u32
    },
    /// Receiving the boundary bit.
    Boundary {
        /// Half-cycles received so far.
        half: u8
    },
    /// Receiving data bits.
    Data {
        /// The data byte being received currently.
        current: u8,
        /// The index of the bit being received.
        bit: u8,
        /// The tone of the first half-cycle of the current bit.
        tone: Option<Tone>,
        /// Half-cycles of the current bit received so far.
        half: u8
    },
    /// Receiving stop bits.
    Stop {
        /// The received data byte.
        current: u8,
        /// Half-cycles received so far.
        half: u8
    },
}

/// The result of feeding a half-cycle to the [CourseDecoder].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CourseStep {
    /// More half-cycles are needed.
    Pending,
    /// The framing and the baud rate were recognized from the first byte.
    Detected(TapeFormat, Baud),
    /// A byte was received.
    Byte(u8),
    /// The half-cycle didn't fit, the decoder has been reset.
    Violation,
}

/// Decodes a sequence of half-cycle tones into bytes.
///
/// After a reset the decoder counts the 1200 Hz half-cycles preceding the first 2400 Hz one.
/// The number of full 1200 Hz cycles determines the framing and the baud rate:
///
/// * 1: a stream at 1200 baud (the boundary bit of a `0xFF` preamble byte),
/// * 4: a stream at 300 baud (ditto),
/// * 36 (plus the configured leeway): a save at 300 baud (the boundary and data bits of a `0x00`
///   leader byte).
///
/// Any other count resets the decoder. Once detected, the baud rate stays unchanged until the next
/// reset, except for [CourseDecoder::set_baud] requested by the framing layer.
#[derive(Clone, Debug)]
pub struct CourseDecoder {
    state: CourseState,
    baud: Option<Baud>,
    save_leeway: u32,
}

impl Default for CourseState {
    fn default() -> Self {
        CourseState::Idle { low: 0 }
    }
}

impl CourseState {
    /// Returns `true` if the state is [CourseState::Idle].
    pub fn is_idle(&self) -> bool {
        matches!(self, CourseState::Idle {..})
    }
}

impl Default for CourseDecoder {
    fn default() -> Self {
        CourseDecoder::new(4)
    }
}

impl CourseDecoder {
    /// Creates a new decoder accepting up to `save_leeway` extra 1200 Hz cycles in a save leader byte.
    pub fn new(save_leeway: u32) -> Self {
        CourseDecoder { state: CourseState::default(), baud: None, save_leeway }
    }

    pub fn state(&self) -> CourseState {
        self.state
    }
    /// Returns the detected baud rate.
    pub fn baud(&self) -> Option<Baud> {
        self.baud
    }

    pub fn is_idle(&self) -> bool {
        self.state.is_idle()
    }
    /// Resets the decoder to idle, discarding any partially received byte.
    pub fn reset(&mut self) {
        self.state = CourseState::default();
        self.baud = None;
    }
    /// Changes the baud rate of the bytes that follow. Ignored while idle.
    pub fn set_baud(&mut self, baud: Baud) {
        if !self.is_idle() {
            self.baud = Some(baud);
        }
    }
    /// Feeds the decoder with the next half-cycle.
    pub fn step(&mut self, tone: Tone) -> CourseStep {
        let baud = self.baud.unwrap_or_default();
        match self.state {
            CourseState::Idle { low } => match tone {
                Tone::Low => {
                    self.state = CourseState::Idle { low: low.saturating_add(1) };
                    CourseStep::Pending
                }
                Tone::High => self.detect(low)
            }
            CourseState::Boundary { half } => match tone {
                Tone::Low => {
                    let half = half + 1;
                    self.state = if half == baud.zero_half_cycles() {
                        CourseState::Data { current: 0, bit: 0, tone: None, half: 0 }
                    }
                    else {
                        CourseState::Boundary { half }
                    };
                    CourseStep::Pending
                }
                Tone::High => self.violation()
            }
            CourseState::Data { current, bit, tone: bit_tone, half } => {
                let bit_tone = bit_tone.unwrap_or(tone);
                if bit_tone != tone {
                    return self.violation()
                }
                let half = half + 1;
                self.state = if half < baud.half_cycles(tone) {
                    CourseState::Data { current, bit, tone: Some(tone), half }
                }
                else {
                    let current = current | (tone.bit() as u8) << bit;
                    if bit == 7 {
                        CourseState::Stop { current, half: 0 }
                    }
                    else {
                        CourseState::Data { current, bit: bit + 1, tone: None, half: 0 }
                    }
                };
                CourseStep::Pending
            }
            CourseState::Stop { current, half } => match tone {
                Tone::High => {
                    let half = half + 1;
                    if half == STOP_BITS * baud.one_half_cycles() {
                        self.state = CourseState::Boundary { half: 0 };
                        CourseStep::Byte(current)
                    }
                    else {
                        self.state = CourseState::Stop { current, half };
                        CourseStep::Pending
                    }
                }
                Tone::Low => self.violation()
            }
        }
    }

    fn detect(&mut self, low: u32) -> CourseStep {
        if low == 0 {
            return CourseStep::Pending
        }
        if low & 1 == 1 {
            return self.violation()
        }
        let (format, baud, state) = match low / 2 {
            1 => (TapeFormat::Stream, Baud::B1200,
                  CourseState::Data { current: 0, bit: 0, tone: None, half: 0 }),
            N0 => (TapeFormat::Stream, Baud::B300,
                  CourseState::Data { current: 0, bit: 0, tone: None, half: 0 }),
            cycles if cycles >= SAVE_LEADER_CYCLES && cycles - SAVE_LEADER_CYCLES <= self.save_leeway =>
                (TapeFormat::Save, Baud::B300, CourseState::Stop { current: 0, half: 0 }),
            _ => return self.violation()
        };
        self.baud = Some(baud);
        self.state = state;
        // the 2400 Hz half-cycle belongs to the detected bit
        self.step(Tone::High);
        CourseStep::Detected(format, baud)
    }

    fn violation(&mut self) -> CourseStep {
        self.reset();
        CourseStep::Violation
    }
}
