/*
    Copyright (C) 2020-2022  Rafal Michalski

    This file is part of BEERUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
#[cfg(feature = "snapshot")]
use serde::{Serialize, Deserialize};

use super::keys::AmbiguousKey;

/// The interpretation of an [AmbiguousKey] frozen when the key went down.
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShiftLatch {
    /// The Microbee key cell pressed.
    pub cell: u8,
    /// The SHIFT state reported while the latch is active.
    pub shift: bool,
    /// The host key is being held.
    pub held: bool,
    seq: u64,
}

/// Shift inversion latches, one per [AmbiguousKey].
///
/// A latch is set when its host key goes down and stays active until the key is released and
/// the Microbee key cell is no longer latched by the matrix. While any latch is active the matrix
/// reports the SHIFT state of the most recently set one, regardless of the host SHIFT key.
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShiftInversion {
    latches: [Option<ShiftLatch>; 11],
    seq: u64,
}

impl ShiftInversion {
    /// Sets the latch of the host `key` going down with the host SHIFT state `shifted`.
    ///
    /// Returns the key cell to be pressed. A repeated key-down of a held key keeps the
    /// interpretation of the first one.
    pub fn press(&mut self, key: AmbiguousKey, shifted: bool) -> u8 {
        let latch = &mut self.latches[key.index()];
        if let Some(ShiftLatch { cell, held: true, .. }) = *latch {
            return cell
        }
        let (keys, shift) = key.mapping(shifted);
        let cell = keys.cell().unwrap_or_default();
        self.seq += 1;
        *latch = Some(ShiftLatch { cell, shift, held: true, seq: self.seq });
        cell
    }
    /// Marks the host `key` as released.
    ///
    /// Returns the key cell to be released or `None` if the key wasn't held.
    pub fn release(&mut self, key: AmbiguousKey) -> Option<u8> {
        match self.latches[key.index()].as_mut() {
            Some(latch) if latch.held => {
                latch.held = false;
                Some(latch.cell)
            }
            _ => None
        }
    }
    /// Marks all host keys as released.
    pub fn release_all(&mut self) {
        for latch in self.latches.iter_mut().flatten() {
            latch.held = false;
        }
    }
    /// Removes released latches whose key cells are no longer latched.
    pub fn prune<F: Fn(u8) -> bool>(&mut self, is_latched: F) {
        for entry in self.latches.iter_mut() {
            if let Some(latch) = entry {
                if !latch.held && !is_latched(latch.cell) {
                    *entry = None;
                }
            }
        }
    }
    /// Returns the SHIFT state of the most recently set active latch.
    ///
    /// A released latch keeps overriding until its stretched key cell unlatches, so the guest
    /// never sees the frozen key together with the opposite SHIFT state. Other keys pressed in
    /// that window are reported with the same SHIFT state.
    pub fn shift_override(&self) -> Option<bool> {
        self.latches.iter().flatten().max_by_key(|latch| latch.seq).map(|latch| latch.shift)
    }
    /// Returns the latch of the host `key`.
    pub fn latch(&self, key: AmbiguousKey) -> Option<&ShiftLatch> {
        self.latches[key.index()].as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.latches.iter().any(Option::is_some)
    }

    pub fn clear(&mut self) {
        *self = ShiftInversion::default();
    }
}
