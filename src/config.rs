/*
    Copyright (C) 2020-2022  Rafal Michalski

    This file is part of BEERUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! The emulator configuration.
#[cfg(feature = "snapshot")]
use serde::{Serialize, Deserialize};

use crate::clock::ClockConfig;
use crate::formats::tape::TapeConfig;
use crate::peripherals::keyboard::KeyboardConfig;
use crate::throttle::ThrottleConfig;

/// The tuning constants of all components.
///
/// A partial document is accepted when deserializing, the missing values take their defaults.
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "snapshot", serde(default))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EmulatorConfig {
    pub clock: ClockConfig,
    pub throttle: ThrottleConfig,
    pub tape: TapeConfig,
    pub keyboard: KeyboardConfig,
}

impl EmulatorConfig {
    /// Returns the configuration with every value clamped to its accepted range.
    pub fn clamped(self) -> Self {
        EmulatorConfig {
            clock: self.clock.clamped(),
            throttle: self.throttle.clamped(),
            tape: self.tape.clamped(),
            keyboard: self.keyboard.clamped(),
        }
    }
}
