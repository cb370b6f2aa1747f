/*
    Copyright (C) 2020-2022  Rafal Michalski

    This file is part of BEERUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! Microbee keyboard matrix emulation.
//!
//! The Microbee doesn't scan its keyboard with the CPU. Instead the video controller walks
//! through the keyboard matrix with its refresh address and a pressed key raises the light pen
//! strobe. This module provides [KeyMatrix] which implements the [LightPen] interface for the
//! video controller emulator.
//!
//! # Key stretching
//!
//! A host key press may be shorter than the time the guest software needs to notice the key,
//! especially when the emulation runs in bursts. Each key pressed is latched down for a number of
//! scan periods (the *stretch countdown*) even if the host key is released meanwhile. The latch is
//! released early once the key was read by the light pen mechanism often enough.
//!
//! # Shift inversion
//!
//! Some host keys produce characters found on Microbee keys with an opposite SHIFT state, e.g. the
//! host `SHIFT`+`2` is `@` which is unshifted on the Microbee. See [ShiftInversion].
#[cfg(feature = "snapshot")]
use serde::{Serialize, Deserialize};

use log::debug;

use beerusty_core::chip::LightPen;
use beerusty_core::config::clamp_setting;

mod file;
mod keys;
mod shift;

pub use file::*;
pub use keys::*;
pub use shift::*;

/// Keyboard matrix timing configuration.
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "snapshot", serde(default))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyboardConfig {
    /// The number of scan periods a pressed key stays latched at least.
    pub stretch_countdown: u8,
    /// The duration of a scan period in CPU cycles.
    pub scan_cycles: u32,
    /// The number of light pen strobe acknowledgements releasing the latch early.
    pub feedback_threshold: u32,
    /// The number of light pen scans releasing the latch early.
    pub refresh_threshold: u32,
    /// The number of reads after which a key typed from a file is released.
    pub file_read_threshold: u32,
    /// The number of scan periods between keys typed from a file.
    pub file_release_scans: u32,
}

impl Default for KeyboardConfig {
    fn default() -> Self {
        KeyboardConfig {
            stretch_countdown: 6,
            scan_cycles: 33_750,
            feedback_threshold: 2,
            refresh_threshold: 16,
            file_read_threshold: 4,
            file_release_scans: 2,
        }
    }
}

impl KeyboardConfig {
    /// Returns the configuration with every value clamped to its accepted range.
    pub fn clamped(self) -> Self {
        KeyboardConfig {
            stretch_countdown: clamp_setting("keyboard.stretch_countdown", self.stretch_countdown, 1, u8::MAX),
            scan_cycles: clamp_setting("keyboard.scan_cycles", self.scan_cycles, 1, u32::MAX),
            feedback_threshold: clamp_setting("keyboard.feedback_threshold", self.feedback_threshold, 1, u32::MAX),
            refresh_threshold: clamp_setting("keyboard.refresh_threshold", self.refresh_threshold, 1, u32::MAX),
            file_read_threshold: clamp_setting("keyboard.file_read_threshold", self.file_read_threshold, 1, u32::MAX),
            file_release_scans: clamp_setting("keyboard.file_release_scans", self.file_release_scans, 0, 1000),
        }
    }
}

/// The state of a single key cell.
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KeyCell {
    /// The state reported to the light pen.
    pub lpen: bool,
    /// The host key is down.
    pub pc_down: bool,
    /// Scan periods left until the latch follows the host key.
    pub countdown: u8,
    /// Light pen strobe acknowledgements since the key went down.
    pub feedback: u32,
    /// Light pen scans since the key went down.
    pub refresh: u32,
}

/// The logical state of a key.
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyState {
    Up,
    /// Latched down while the host key is up.
    Stretched,
    Down,
}

impl KeyCell {
    pub fn state(&self) -> KeyState {
        match (self.lpen, self.pc_down) {
            (true, true) => KeyState::Down,
            (true, false) => KeyState::Stretched,
            (false, _) => KeyState::Up
        }
    }
    /// Returns the greater of the read counters.
    #[inline]
    pub fn reads(&self) -> u32 {
        self.feedback.max(self.refresh)
    }
}

/// The Microbee keyboard matrix.
#[derive(Clone, Debug)]
pub struct KeyMatrix {
    cells: [KeyCell; NUM_CELLS],
    config: KeyboardConfig,
    elapsed: u32,
    host_shift: bool,
    inversion: ShiftInversion,
}

impl Default for KeyMatrix {
    fn default() -> Self {
        KeyMatrix::new(KeyboardConfig::default())
    }
}

/// Returns the key cell index selected by the video controller refresh `address`.
#[inline]
pub fn lpen_cell(address: u16) -> u8 {
    (address >> 4) as u8 & 0x3F
}

impl KeyMatrix {
    pub fn new(config: KeyboardConfig) -> Self {
        KeyMatrix {
            cells: [KeyCell::default(); NUM_CELLS],
            config: config.clamped(),
            elapsed: 0,
            host_shift: false,
            inversion: ShiftInversion::default(),
        }
    }

    pub fn config(&self) -> &KeyboardConfig {
        &self.config
    }
    /// Handles a host key going down or up.
    pub fn on_key_event(&mut self, key: HostKey, down: bool) {
        match key {
            HostKey::Shift => {
                self.host_shift = down;
                self.set_cell(SHIFT_CELL, down);
            }
            HostKey::Key(keys) => {
                for cell in keys.cells() {
                    self.set_cell(cell, down);
                }
            }
            HostKey::Ambiguous(key) => {
                if down {
                    let cell = self.inversion.press(key, self.host_shift);
                    self.press_cell(cell);
                }
                else if let Some(cell) = self.inversion.release(key) {
                    self.release_cell(cell);
                }
            }
        }
    }
    /// Advances the scan timer by `cycles`. Returns the number of scan periods completed.
    pub fn on_cycle_tick(&mut self, cycles: u32) -> u32 {
        let mut scans = 0;
        self.elapsed = self.elapsed.saturating_add(cycles);
        while self.elapsed >= self.config.scan_cycles {
            self.elapsed -= self.config.scan_cycles;
            self.scan();
            scans += 1;
        }
        scans
    }
    /// Performs a single scan period update of the key latches.
    pub fn scan(&mut self) {
        let KeyboardConfig { feedback_threshold, refresh_threshold, .. } = self.config;
        for cell in self.cells.iter_mut() {
            if cell.countdown != 0 {
                if cell.feedback >= feedback_threshold || cell.refresh >= refresh_threshold {
                    cell.countdown = 0;
                }
                else {
                    cell.countdown -= 1;
                }
            }
            if cell.countdown == 0 {
                cell.lpen = cell.pc_down;
            }
        }
        let cells = &self.cells;
        self.inversion.prune(|cell| cells[cell as usize].lpen);
    }
    /// Presses the key at `cell` arming its stretch countdown.
    ///
    /// The scan period in progress doesn't count towards the stretch.
    pub fn press_cell(&mut self, cell: u8) {
        let mut countdown = self.config.stretch_countdown;
        if self.elapsed != 0 {
            countdown = countdown.saturating_add(1);
        }
        let cell = &mut self.cells[cell as usize & 0x3F];
        *cell = KeyCell { lpen: true, pc_down: true, countdown, feedback: 0, refresh: 0 };
    }
    /// Releases the key at `cell`. The key stays latched until its countdown expires.
    pub fn release_cell(&mut self, cell: u8) {
        self.cells[cell as usize & 0x3F].pc_down = false;
    }

    fn set_cell(&mut self, cell: u8, down: bool) {
        if down {
            if !self.cells[cell as usize & 0x3F].pc_down {
                self.press_cell(cell);
            }
        }
        else {
            self.release_cell(cell);
        }
    }
    /// Returns the key cell at `index` (modulo 64).
    pub fn cell_at(&self, index: u8) -> &KeyCell {
        &self.cells[index as usize & 0x3F]
    }
    /// Returns the cell of a single `key`.
    pub fn cell(&self, key: MbKeyboardMap) -> Option<&KeyCell> {
        key.cell().map(|index| self.cell_at(index))
    }
    /// Returns `true` if the single `key` is latched down.
    pub fn is_latched(&self, key: MbKeyboardMap) -> bool {
        self.cell(key).map_or(false, |cell| cell.lpen)
    }
    /// Returns the logical state of a single `key`.
    pub fn state(&self, key: MbKeyboardMap) -> KeyState {
        self.cell(key).map_or(KeyState::Up, KeyCell::state)
    }
    /// Returns the state of the key at `index` as reported to the light pen.
    pub fn reported(&self, index: u8) -> bool {
        let index = index & 0x3F;
        if index == SHIFT_CELL {
            if let Some(shift) = self.inversion.shift_override() {
                return shift
            }
        }
        self.cells[index as usize].lpen
    }
    /// Returns all keys as reported to the light pen.
    pub fn latched_keys(&self) -> MbKeyboardMap {
        (0..NUM_CELLS as u8).filter(|&index| self.reported(index))
                            .fold(MbKeyboardMap::empty(), |keys, index| keys | MbKeyboardMap::from_cell(index))
    }

    pub fn shift_inversion(&self) -> &ShiftInversion {
        &self.inversion
    }
    /// Releases all host keys, e.g. when the host window loses focus.
    pub fn release_all(&mut self) {
        for cell in self.cells.iter_mut() {
            cell.pc_down = false;
        }
        self.host_shift = false;
        self.inversion.release_all();
    }
    /// Releases all keys immediately and resets the scan timer.
    pub fn reset(&mut self) {
        debug!("keyboard reset");
        self.cells = [KeyCell::default(); NUM_CELLS];
        self.elapsed = 0;
        self.host_shift = false;
        self.inversion.clear();
    }
}

impl LightPen for KeyMatrix {
    fn lpen_scan(&mut self, address: u16) -> bool {
        let index = lpen_cell(address);
        let cell = &mut self.cells[index as usize];
        cell.refresh = cell.refresh.saturating_add(1);
        self.reported(index)
    }

    fn lpen_feedback(&mut self, address: u16) {
        let cell = &mut self.cells[lpen_cell(address) as usize];
        cell.feedback = cell.feedback.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use rand::prelude::*;
    use rand::rngs::SmallRng;
    use super::*;

    type Mb = MbKeyboardMap;

    fn address(key: Mb) -> u16 {
        (key.cell().unwrap() as u16) << 4
    }

    fn matrix() -> KeyMatrix {
        KeyMatrix::new(KeyboardConfig { scan_cycles: 100, ..KeyboardConfig::default() })
    }

    #[test]
    fn keyboard_config_works() {
        let config = KeyboardConfig { stretch_countdown: 0, scan_cycles: 0, feedback_threshold: 0,
                                      refresh_threshold: 0, file_read_threshold: 0, file_release_scans: 5000 };
        assert_eq!(KeyboardConfig { stretch_countdown: 1, scan_cycles: 1, feedback_threshold: 1,
                                    refresh_threshold: 1, file_read_threshold: 1, file_release_scans: 1000 },
                   config.clamped());
        assert_eq!(KeyboardConfig::default(), KeyboardConfig::default().clamped());
    }

    #[cfg(feature = "snapshot")]
    #[test]
    fn keyboard_config_deserializes() {
        let config: KeyboardConfig = serde_json::from_str(r#"{"stretch_countdown":3}"#).unwrap();
        assert_eq!(KeyboardConfig { stretch_countdown: 3, ..KeyboardConfig::default() }, config);
    }

    #[test]
    fn lpen_cell_works() {
        assert_eq!(0, lpen_cell(0x000F));
        assert_eq!(1, lpen_cell(0x0010));
        assert_eq!(63, lpen_cell(0x03F0));
        assert_eq!(0, lpen_cell(0x0400));
        assert_eq!(SHIFT_CELL, lpen_cell(0xFFFF));
    }

    #[test]
    fn key_stretching_works() {
        let mut kbd = matrix();
        assert_eq!(KeyState::Up, kbd.state(Mb::A));
        kbd.on_key_event(HostKey::Key(Mb::A), true);
        assert_eq!(KeyState::Down, kbd.state(Mb::A));
        kbd.on_key_event(HostKey::Key(Mb::A), false);
        assert_eq!(KeyState::Stretched, kbd.state(Mb::A));
        for n in 1..6 {
            assert_eq!(1, kbd.on_cycle_tick(100));
            assert!(kbd.is_latched(Mb::A), "scan: {}", n);
        }
        assert_eq!(0, kbd.on_cycle_tick(99));
        assert!(kbd.is_latched(Mb::A));
        assert_eq!(1, kbd.on_cycle_tick(1));
        assert_eq!(KeyState::Up, kbd.state(Mb::A));
        // a key held longer follows the host key
        kbd.on_key_event(Mb::B.into(), true);
        assert_eq!(10, kbd.on_cycle_tick(1000));
        assert_eq!(KeyState::Down, kbd.state(Mb::B));
        assert_eq!(0, kbd.cell(Mb::B).unwrap().countdown);
        kbd.on_key_event(Mb::B.into(), false);
        assert!(kbd.is_latched(Mb::B));
        kbd.on_cycle_tick(100);
        assert!(!kbd.is_latched(Mb::B));
    }

    #[test]
    fn key_stretching_lower_bound() {
        let mut rng = SmallRng::seed_from_u64(42);
        for _ in 0..200 {
            let mut kbd = matrix();
            let cell = rng.gen_range(0..64u8);
            let key = Mb::from_cell(cell);
            let phase = rng.gen_range(0..100);
            assert_eq!(0, kbd.on_cycle_tick(phase));
            kbd.on_key_event(HostKey::Key(key), true);
            let held: u32 = rng.gen_range(0..600);
            let mut cycles = 0;
            // released within the scan period following the stretch
            while cycles < 700 {
                let step = rng.gen_range(1..50).min(700 - cycles);
                if cycles <= held && cycles + step > held {
                    kbd.on_cycle_tick(held - cycles);
                    kbd.on_key_event(HostKey::Key(key), false);
                    kbd.on_cycle_tick(cycles + step - held);
                }
                else {
                    kbd.on_cycle_tick(step);
                }
                cycles += step;
                if cycles < 600 {
                    assert!(kbd.is_latched(key), "cycles: {} held: {} phase: {}", cycles, held, phase);
                }
            }
            assert!(!kbd.is_latched(key), "held: {} phase: {}", held, phase);
        }
    }

    #[test]
    fn key_stretching_starts_at_next_scan() {
        let mut kbd = matrix();
        assert_eq!(0, kbd.on_cycle_tick(99));
        kbd.on_key_event(HostKey::Key(Mb::A), true);
        kbd.on_key_event(HostKey::Key(Mb::A), false);
        assert_eq!(7, kbd.cell(Mb::A).unwrap().countdown);
        for n in 1..=600 {
            kbd.on_cycle_tick(1);
            assert!(kbd.is_latched(Mb::A), "cycles: {}", n);
        }
        assert_eq!(1, kbd.on_cycle_tick(1));
        assert_eq!(KeyState::Up, kbd.state(Mb::A));
    }

    #[test]
    fn feedback_releases_early() {
        let mut kbd = matrix();
        kbd.on_key_event(HostKey::Key(Mb::CR), true);
        kbd.on_key_event(HostKey::Key(Mb::CR), false);
        assert!(kbd.lpen_scan(address(Mb::CR)));
        assert!(!kbd.lpen_scan(address(Mb::SPACE)));
        kbd.lpen_feedback(address(Mb::CR));
        kbd.on_cycle_tick(100);
        assert!(kbd.is_latched(Mb::CR));
        kbd.lpen_feedback(address(Mb::CR));
        assert_eq!(2, kbd.cell(Mb::CR).unwrap().feedback);
        kbd.on_cycle_tick(100);
        assert!(!kbd.is_latched(Mb::CR));
        // the same with refresh reads
        kbd.on_key_event(HostKey::Key(Mb::SPACE), true);
        kbd.on_key_event(HostKey::Key(Mb::SPACE), false);
        for _ in 0..16 {
            assert!(kbd.lpen_scan(address(Mb::SPACE) + 5));
        }
        kbd.on_cycle_tick(100);
        assert_eq!(KeyState::Up, kbd.state(Mb::SPACE));
        // a held key stays down after an early release
        kbd.on_key_event(HostKey::Key(Mb::Q), true);
        kbd.lpen_feedback(address(Mb::Q));
        kbd.lpen_feedback(address(Mb::Q));
        kbd.on_cycle_tick(100);
        assert_eq!(KeyState::Down, kbd.state(Mb::Q));
        assert_eq!(0, kbd.cell(Mb::Q).unwrap().countdown);
    }

    #[test]
    fn shift_inversion_works() {
        let mut kbd = matrix();
        kbd.on_key_event(HostKey::Shift, true);
        assert!(kbd.lpen_scan(address(Mb::SHIFT)));
        kbd.on_key_event(AmbiguousKey::N2.into(), true);
        assert!(kbd.lpen_scan(address(Mb::AT)));
        assert!(!kbd.lpen_scan(address(Mb::SHIFT)));
        assert!(!kbd.is_latched(Mb::N2));
        kbd.on_key_event(HostKey::Shift, false);
        kbd.on_key_event(AmbiguousKey::N2.into(), false);
        assert_eq!(Mb::AT, kbd.latched_keys());
        for _ in 0..6 {
            kbd.on_cycle_tick(100);
        }
        assert_eq!(Mb::empty(), kbd.latched_keys());
        assert!(!kbd.shift_inversion().is_active());
        // unshifted host key with a shifted Microbee key
        kbd.on_key_event(AmbiguousKey::Equals.into(), true);
        assert_eq!(Mb::MINUS|Mb::SHIFT, kbd.latched_keys());
        assert!(!kbd.is_latched(Mb::SHIFT));
        kbd.release_all();
        kbd.on_cycle_tick(600);
        assert_eq!(Mb::empty(), kbd.latched_keys());
    }

    #[test]
    fn shift_override_lasts_until_unlatched() {
        let mut kbd = matrix();
        kbd.on_key_event(HostKey::Shift, true);
        kbd.on_key_event(AmbiguousKey::N2.into(), true);
        kbd.on_key_event(AmbiguousKey::N2.into(), false);
        // a key pressed while @ is still stretched shares its SHIFT state
        kbd.on_key_event(HostKey::Key(Mb::A), true);
        assert_eq!(Mb::AT|Mb::A, kbd.latched_keys());
        assert_eq!(KeyState::Stretched, kbd.state(Mb::AT));
        kbd.on_cycle_tick(500);
        assert_eq!(Mb::AT|Mb::A, kbd.latched_keys());
        kbd.on_cycle_tick(100);
        assert_eq!(KeyState::Up, kbd.state(Mb::AT));
        assert!(!kbd.shift_inversion().is_active());
        assert_eq!(Mb::A|Mb::SHIFT, kbd.latched_keys());
    }

    #[test]
    fn reset_works() {
        let mut kbd = matrix();
        kbd.on_key_event(HostKey::Key(Mb::A|Mb::B), true);
        kbd.on_key_event(HostKey::Shift, true);
        kbd.on_key_event(AmbiguousKey::N0.into(), true);
        assert_eq!(Mb::A|Mb::B|Mb::N9|Mb::SHIFT, kbd.latched_keys());
        kbd.on_cycle_tick(50);
        kbd.reset();
        assert_eq!(Mb::empty(), kbd.latched_keys());
        assert_eq!(0, kbd.on_cycle_tick(99));
        assert!(!kbd.shift_inversion().is_active());
    }
}
