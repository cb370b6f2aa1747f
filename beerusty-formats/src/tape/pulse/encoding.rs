/*
    Copyright (C) 2020-2022  Rafal Michalski

    This file is part of BEERUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
use core::num::NonZeroU32;
use std::collections::TryReserveError;

use bitvec::prelude::*;

use beerusty_core::chip::Level;
use crate::tape::{FramedBytes, TapeFormat};
use super::{Baud, PulseTiming, Tone};
use super::consts::*;

/// A bit-packed tape signal ready to be played back by [TapePlayer].
///
/// Each byte occupies 11 consecutive bits: the boundary bit `0`, eight data bits starting from
/// the least significant one and two stop bits `1`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TapeInputBuffer {
    bits: BitVec<u8, Lsb0>,
    format: TapeFormat,
    baud: Baud,
    speed_change_bit: Option<usize>,
}

impl TapeInputBuffer {
    /// Packs `bytes` into a new buffer, starting at `baud`.
    ///
    /// If `speed_change_byte` is given the playback switches to 1200 baud at the boundary bit
    /// of the byte with this index.
    pub fn new(
            bytes: &[u8],
            format: TapeFormat,
            baud: Baud,
            speed_change_byte: Option<usize>
        ) -> Result<Self, TryReserveError>
    {
        let nbits = bytes.len() * BITS_PER_BYTE;
        let mut storage: Vec<u8> = Vec::new();
        storage.try_reserve_exact((nbits + 7) / 8)?;
        storage.resize((nbits + 7) / 8, 0);
        let mut bits = BitVec::<u8, Lsb0>::from_vec(storage);
        bits.truncate(nbits);
        for (chunk, &byte) in bits.chunks_exact_mut(BITS_PER_BYTE).zip(bytes) {
            chunk.set(0, false);
            for n in 0..8 {
                chunk.set(1 + n, byte & (1 << n) != 0);
            }
            chunk[9..].fill(true);
        }
        let speed_change_bit = speed_change_byte.filter(|&index| index < bytes.len())
                                                .map(|index| index * BITS_PER_BYTE);
        Ok(TapeInputBuffer { bits, format, baud, speed_change_bit })
    }
    /// Packs the `framed` bytes into a new buffer, starting at `baud`.
    pub fn from_framed(framed: &FramedBytes, baud: Baud) -> Result<Self, TryReserveError> {
        TapeInputBuffer::new(&framed.bytes, framed.format, baud, framed.fast_from)
    }
    /// Returns the number of bits.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }
    /// Returns the value of the bit at `index` or `None` if out of bounds.
    pub fn bit(&self, index: usize) -> Option<bool> {
        self.bits.get(index).map(|bit| *bit)
    }

    pub fn format(&self) -> TapeFormat {
        self.format
    }
    /// Returns the initial baud rate.
    pub fn baud(&self) -> Baud {
        self.baud
    }
    /// Returns the index of the bit starting the 1200 baud part.
    pub fn speed_change_bit(&self) -> Option<usize> {
        self.speed_change_bit
    }
    /// Returns an iterator of half-cycle durations of the whole buffer.
    pub fn pulse_iter(&self, timing: PulseTiming) -> TapeBufferPulseIter<'_> {
        TapeBufferPulseIter { buffer: self, timing, cursor: PulseCursor::new(self.baud) }
    }
}

/// The playback position within a [TapeInputBuffer].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PulseCursor {
    /// The index of the bit being played.
    pub bit: usize,
    /// Half-cycles of the current bit emitted so far.
    pub half: u8,
    /// The current baud rate.
    pub baud: Baud,
}

impl PulseCursor {
    pub fn new(baud: Baud) -> Self {
        PulseCursor { bit: 0, half: 0, baud }
    }
    /// Advances the cursor by one half-cycle returning its duration or `None` if the buffer is exhausted.
    pub fn next_half_cycle(&mut self, buffer: &TapeInputBuffer, timing: &PulseTiming) -> Option<NonZeroU32> {
        let value = buffer.bit(self.bit)?;
        if self.half == 0 && buffer.speed_change_bit() == Some(self.bit) {
            self.baud = Baud::B1200;
        }
        let tone = Tone::from(value);
        self.half += 1;
        if self.half >= self.baud.half_cycles(tone) {
            self.bit += 1;
            self.half = 0;
        }
        Some(timing.half_cycle(tone))
    }
}

/// An iterator of half-cycle durations of a [TapeInputBuffer].
#[derive(Clone, Debug)]
pub struct TapeBufferPulseIter<'a> {
    buffer: &'a TapeInputBuffer,
    timing: PulseTiming,
    cursor: PulseCursor,
}

impl Iterator for TapeBufferPulseIter<'_> {
    type Item = NonZeroU32;

    fn next(&mut self) -> Option<NonZeroU32> {
        self.cursor.next_half_cycle(self.buffer, &self.timing)
    }
}

/// Plays a [TapeInputBuffer] back as the level of the cassette input line.
///
/// The first half-cycle starts when a buffer is [loaded][TapePlayer::load], raising the level.
/// The level toggles at the end of every half-cycle. When the buffer is exhausted the level is
/// forced low and the player becomes idle.
///
/// The player also implements [Iterator] yielding the durations between consecutive level changes
/// while advancing the playback, which can be used to feed the pulses elsewhere.
#[derive(Clone, Debug)]
pub struct TapePlayer {
    buffer: Option<TapeInputBuffer>,
    timing: PulseTiming,
    cursor: PulseCursor,
    level: Level,
    remaining: u32,
}

impl Default for TapePlayer {
    fn default() -> Self {
        TapePlayer::new(PulseTiming::default())
    }
}

impl TapePlayer {
    pub fn new(timing: PulseTiming) -> Self {
        TapePlayer { buffer: None, timing, cursor: PulseCursor::default(), level: Level::Low, remaining: 0 }
    }
    /// Changes the timing of the half-cycles that follow.
    pub fn set_timing(&mut self, timing: PulseTiming) {
        self.timing = timing;
    }
    /// Starts playing the `buffer`, replacing the previous one.
    pub fn load(&mut self, buffer: TapeInputBuffer) {
        self.cursor = PulseCursor::new(buffer.baud());
        match self.cursor.next_half_cycle(&buffer, &self.timing) {
            Some(delta) => {
                self.remaining = delta.get();
                self.level = Level::High;
                self.buffer = Some(buffer);
            }
            None => self.eject()
        }
    }
    /// Stops playing and drops the buffer.
    pub fn eject(&mut self) {
        self.buffer = None;
        self.cursor = PulseCursor::default();
        self.level = Level::Low;
        self.remaining = 0;
    }

    pub fn is_playing(&self) -> bool {
        self.buffer.is_some()
    }
    /// Returns the current level of the output.
    pub fn level(&self) -> Level {
        self.level
    }
    /// Returns the number of cycles to the next level change if playing.
    pub fn cycles_to_next_edge(&self) -> Option<u32> {
        self.buffer.as_ref().map(|_| self.remaining)
    }
    /// Returns the index of the bit being played.
    pub fn position(&self) -> usize {
        self.cursor.bit
    }
    /// Returns the number of bits of the loaded buffer.
    pub fn len(&self) -> usize {
        self.buffer.as_ref().map_or(0, |buffer| buffer.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Returns the current baud rate.
    pub fn baud(&self) -> Option<Baud> {
        self.buffer.as_ref().map(|_| self.cursor.baud)
    }
    /// Advances the playback by `cycles` and returns the resulting level.
    pub fn tick(&mut self, cycles: u32) -> Level {
        self.tick_with(cycles, |_, _| ())
    }
    /// Advances the playback by `cycles` calling `edge` with the cycle offset and the new level
    /// on every level change, and returns the resulting level.
    pub fn tick_with<F: FnMut(u32, Level)>(&mut self, cycles: u32, mut edge: F) -> Level {
        let mut offset = 0;
        let mut left = cycles;
        while let Some(buffer) = self.buffer.as_ref() {
            if left < self.remaining {
                self.remaining -= left;
                break
            }
            left -= self.remaining;
            offset += self.remaining;
            match self.cursor.next_half_cycle(buffer, &self.timing) {
                Some(delta) => {
                    self.remaining = delta.get();
                    self.level = !self.level;
                    edge(offset, self.level);
                }
                None => {
                    let was_high = self.level.is_high();
                    self.eject();
                    if was_high {
                        edge(offset, Level::Low);
                    }
                    break
                }
            }
        }
        self.level
    }
}

impl Iterator for TapePlayer {
    type Item = NonZeroU32;
    /// Advances the playback to the next level change, returning the number of cycles elapsed.
    fn next(&mut self) -> Option<NonZeroU32> {
        let delta = self.cycles_to_next_edge()?;
        self.tick(delta);
        NonZeroU32::new(delta)
    }
}
