/*
    Copyright (C) 2020-2022  Rafal Michalski

    This file is part of BEERUSTY, a Rust library for building emulators.

    BEERUSTY is free software: you can redistribute it and/or modify it under
    the terms of the GNU Lesser General Public License (LGPL) as published
    by the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    BEERUSTY is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Lesser General Public License for more details.

    You should have received a copy of the GNU Lesser General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.

    Author contact information: see Cargo.toml file, section [package.authors].
*/
//! # BEERUSTY
//!
//! A library for building emulators of the Microbee computer series.
//!
//! The library provides the timing and host-facing layer of an emulator:
//!
//! * [CycleClock][clock::CycleClock] counts the emulated CPU clock cycles,
//! * [ThrottleState][throttle::ThrottleState] keeps the emulation in step with the host's real time,
//! * [tape][formats::tape] encodes files for the cassette input and decodes the cassette output,
//! * [keyboard][peripherals::keyboard] emulates the light-pen scanned keyboard matrix,
//! * [SyncDriver][sync::SyncDriver] ties them together with the CPU and the video controller emulators.
//!
//! The CPU instruction emulator and the video controller are not part of the library. They plug
//! into the [CpuDriver][chip::CpuDriver] and [VideoController][chip::VideoController] interfaces.
pub use beerusty_core::{chip, clock, throttle};
pub use beerusty_formats as formats;
pub use beerusty_peripherals as peripherals;

pub mod config;
pub mod sync;
