/*
    Copyright (C) 2020-2022  Rafal Michalski

    This file is part of BEERUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! Interfaces of the emulated chipset collaborators driven by the synchronization loop.
use core::ops::Not;

#[cfg(feature = "snapshot")]
use serde::{Serialize, Deserialize};

use crate::clock::CycleBudget;

/// A signal level of a single digital line, e.g. the cassette input or output.
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Level {
    Low,
    High
}

impl Default for Level {
    fn default() -> Self {
        Level::Low
    }
}

impl Level {
    #[inline]
    pub fn is_high(self) -> bool {
        self == Level::High
    }
}

impl Not for Level {
    type Output = Level;
    #[inline]
    fn not(self) -> Level {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low
        }
    }
}

impl From<bool> for Level {
    #[inline]
    fn from(high: bool) -> Self {
        if high { Level::High } else { Level::Low }
    }
}

impl From<Level> for bool {
    #[inline]
    fn from(level: Level) -> Self {
        level.is_high()
    }
}

/// A change of a signal line level at a cycle offset counted from the beginning of a synchronization pass.
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TapeEdge {
    /// The level after the change.
    pub level: Level,
    /// The cycle offset of the change from the beginning of the pass.
    pub offset: u32,
}

impl TapeEdge {
    #[inline]
    pub fn new(level: Level, offset: u32) -> Self {
        TapeEdge { level, offset }
    }
}

/// The interface of the CPU instruction emulator together with the chips whose timing it owns
/// (the parallel I/O chip and its cassette lines).
pub trait CpuDriver {
    /// Executes instructions for at least `budget` cycles and returns the number of cycles actually
    /// executed, which may exceed the budget by the length of the last instruction.
    fn execute(&mut self, budget: CycleBudget) -> CycleBudget;
    /// Performs a hardware reset of the CPU and the chips it owns.
    fn reset(&mut self);
    /// Feeds the cassette input line with changes scheduled for the next call to [CpuDriver::execute].
    ///
    /// `initial` is the level of the line at the beginning of the pass. Changes are sorted by their offsets.
    /// Changes with offsets beyond the executed cycles should be applied at the end of the pass.
    fn feed_tape_in(&mut self, _initial: Level, _changes: &[TapeEdge]) {}
    /// Moves the cassette output line changes recorded during the last call to [CpuDriver::execute]
    /// into `edges`, sorted by their offsets.
    fn drain_tape_out(&mut self, _edges: &mut Vec<TapeEdge>) {}
}

/// The keyboard matrix as seen by the video controller's light-pen scanning logic.
pub trait LightPen {
    /// Returns `true` if the key selected by the CRTC update `address` is reported as pressed.
    fn lpen_scan(&mut self, address: u16) -> bool;
    /// Acknowledges the light-pen strobe triggered by the key selected by `address`.
    fn lpen_feedback(&mut self, address: u16);
}

/// The interface of the video controller emulator.
pub trait VideoController {
    /// Advances the video controller by `cycles` CPU cycles.
    ///
    /// `clock_division` is the factor (a power of two) by which the controller's own clock rate may
    /// be reduced when the host can't keep up. Keyboard scanning goes through `lpen`.
    fn update(&mut self, cycles: CycleBudget, clock_division: u32, lpen: &mut dyn LightPen);
    /// Performs a hardware reset of the controller.
    fn reset(&mut self) {}
}
