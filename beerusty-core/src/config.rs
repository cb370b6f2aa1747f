/*
    Copyright (C) 2020-2022  Rafal Michalski

    This file is part of BEERUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! Helpers shared by the configuration structs of the library.
use core::fmt::Display;

use log::warn;

/// Clamps `value` to `min..=max`, logging a warning naming the setting if the value was changed.
pub fn clamp_setting<T: PartialOrd + Copy + Display>(name: &str, value: T, min: T, max: T) -> T {
    if value < min {
        warn!("{}: {} is below the minimum, using {}", name, value, min);
        min
    }
    else if value > max {
        warn!("{}: {} is above the maximum, using {}", name, value, max);
        max
    }
    else {
        value
    }
}

/// Rounds `value` down to the nearest power of two, at least 1.
pub fn floor_power_of_two(value: u32) -> u32 {
    match value {
        0 => 1,
        v => 1 << (31 - v.leading_zeros())
    }
}
