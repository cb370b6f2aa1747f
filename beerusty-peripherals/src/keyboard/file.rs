/*
    Copyright (C) 2020-2022  Rafal Michalski

    This file is part of BEERUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
use std::io::{self, Read};

use log::debug;

use super::{KeyMatrix, SHIFT_CELL};
use super::keys::key_for_char;

/// The state of the [KeyFileSource].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeySourceState {
    /// About to type the next character.
    Next,
    /// A key is held until it has been read.
    Pressing { cell: u8, shift: bool },
    /// Waiting for the released key to go up.
    Releasing { cell: u8, shift: bool, scans: u32 },
    /// The source is exhausted.
    Done,
}

/// Types characters read from a file on the keyboard matrix.
///
/// Each character is held down until the guest software has read its key cell enough times,
/// then released. The next character is typed once the released keys are no longer latched.
#[derive(Debug)]
pub struct KeyFileSource<R> {
    rd: io::Bytes<R>,
    state: KeySourceState,
    typed: usize,
}

impl<R: Read> KeyFileSource<R> {
    pub fn new(rd: R) -> Self {
        KeyFileSource { rd: rd.bytes(), state: KeySourceState::Next, typed: 0 }
    }

    pub fn state(&self) -> KeySourceState {
        self.state
    }
    /// Returns the number of characters typed so far.
    pub fn typed(&self) -> usize {
        self.typed
    }

    pub fn is_done(&self) -> bool {
        self.state == KeySourceState::Done
    }
    /// Reads the next character having a key on the Microbee keyboard.
    ///
    /// Returns `None` at the end of the source.
    pub fn next_char(&mut self) -> io::Result<Option<(u8, u8, bool)>> {
        for byte in &mut self.rd {
            let ch = byte?;
            match key_for_char(ch).and_then(|(keys, shift)| keys.cell().map(|cell| (cell, shift))) {
                Some((cell, shift)) => return Ok(Some((ch, cell, shift))),
                None => debug!("key file: skipping 0x{:02x}", ch)
            }
        }
        Ok(None)
    }
    /// Advances the source by one scan period of the `matrix`.
    pub fn step(&mut self, matrix: &mut KeyMatrix) -> io::Result<()> {
        match self.state {
            KeySourceState::Next => {
                match self.next_char() {
                    Ok(Some((ch, cell, shift))) => {
                        debug!("key file: typing {:?}", ch as char);
                        if shift {
                            matrix.press_cell(SHIFT_CELL);
                        }
                        matrix.press_cell(cell);
                        self.typed += 1;
                        self.state = KeySourceState::Pressing { cell, shift };
                    }
                    Ok(None) => {
                        debug!("key file: done after {} characters", self.typed);
                        self.state = KeySourceState::Done;
                    }
                    Err(e) => {
                        self.state = KeySourceState::Done;
                        return Err(e)
                    }
                }
            }
            KeySourceState::Pressing { cell, shift } => {
                if matrix.cell_at(cell).reads() >= matrix.config().file_read_threshold {
                    matrix.release_cell(cell);
                    if shift {
                        matrix.release_cell(SHIFT_CELL);
                    }
                    self.state = KeySourceState::Releasing { cell, shift, scans: 0 };
                }
            }
            KeySourceState::Releasing { cell, shift, scans } => {
                let scans = scans + 1;
                let latched = matrix.cell_at(cell).lpen || (shift && matrix.cell_at(SHIFT_CELL).lpen);
                self.state = if scans >= matrix.config().file_release_scans && !latched {
                    KeySourceState::Next
                }
                else {
                    KeySourceState::Releasing { cell, shift, scans }
                };
            }
            KeySourceState::Done => {}
        }
        Ok(())
    }
    /// Releases the held keys and stops typing.
    pub fn stop(&mut self, matrix: &mut KeyMatrix) {
        if let KeySourceState::Pressing { cell, shift } = self.state {
            matrix.release_cell(cell);
            if shift {
                matrix.release_cell(SHIFT_CELL);
            }
        }
        self.state = KeySourceState::Done;
    }
}
