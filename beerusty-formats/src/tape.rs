/*
    Copyright (C) 2020-2022  Rafal Michalski

    This file is part of BEERUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
/*! Microbee **TAPE** format utilities.

# Cassette signal

Bytes are written to the cassette with the Kansas City Standard modulation: a bit `0` is a burst
of 1200 Hz cycles and a bit `1` is a burst of 2400 Hz cycles of the same duration. At 300 baud
a bit lasts 4 cycles of 1200 Hz (8 cycles of 2400 Hz), at 1200 baud 1 cycle (2 cycles).

Each byte is sent as a boundary bit `0`, eight data bits starting from the least significant one
and two stop bits `1`. See [pulse] for the signal timing.

# Framing

A *stream* is a raw byte stream written by the data pipe routines:

| bytes         | description                                                |
|---------------|------------------------------------------------------------|
| `0xFF` × n    | preamble                                                   |
| `0x2A`        | block marker                                               |
| 1             | payload length, `0` means 256                              |
| length        | payload                                                    |
| 1             | [stream checksum][stream_checksum] of the payload          |

Blocks are separated by a short run of `0xFF` bytes.

A *save* is a file written by the `SAVE` routines of BASIC and the monitor:

| bytes         | description                                                |
|---------------|------------------------------------------------------------|
| `0x00` × 64   | leader                                                     |
| `0x01`        | start of header (SOH)                                      |
| 16            | [header][TapeHeader]                                       |
| 1             | [header checksum][header_checksum]                         |
| ≤ 256         | data block                                                 |
| 1             | [block checksum][block_checksum] of the data block         |
| ...           | more blocks until the header's `size` bytes are written    |

The save always starts at 300 baud. If the header's `speed` byte is non-zero the data blocks
that follow the header checksum are written at 1200 baud.

The structure of the 16 byte header is as follows.

| offset | size | description                                 |
|--------|------|---------------------------------------------|
|    0   |    6 | file name (padded)                          |
|    6   |    1 | file type (`M` machine code, `B` BASIC ...) |
|    7   |    2 | size of data (LSB first)                    |
|    9   |    2 | load address (LSB first)                    |
|   11   |    2 | execution address (LSB first)               |
|   13   |    1 | speed (0: 300 baud, other: 1200 baud)       |
|   14   |    1 | auto-execute flag                           |
|   15   |    1 | reserved                                    |

# Recording and playback

[TapeDecoder] interprets the signal edges produced by the emulated cassette output, recognizes
the framing and the baud rate on its own and hands decoded stream blocks and saved files over to
a [TapeStore], e.g. [FsTapeStore].

[encode_raw_pipe] and [encode_memory_load] build a [TapeInputBuffer] from a file which [TapePlayer]
plays back as a cycle-timed sequence of signal edges for the emulated cassette input.

```
use beerusty_formats::tape::*;

let config = TapeConfig::default();
let timing = PulseTiming::new(3_375_000, config.tolerance_percent);
let header = TapeHeader::default().with_name("HELLO").with_load(0x0900);
let buffer = encode_memory_load(header, &b"Hello world!"[..], &config)?;

let mut player = TapePlayer::new(timing);
player.load(buffer);
let mut decoder = TapeDecoder::new(MemoryTapeStore::default(), timing, &config);
let events = decoder.write_pulses(player.by_ref())?;
assert_eq!(1, events.len());
assert_eq!(b"Hello world!", &decoder.store().files[0].1[..]);
# Ok::<(), TapeError>(())
```
*/
use core::borrow::Borrow;
use core::convert::TryFrom;
use core::fmt;
use std::borrow::Cow;
use std::collections::TryReserveError;
use std::error::Error;
use std::io::{self, ErrorKind, Read};

#[cfg(feature = "snapshot")]
use serde::{Serialize, Deserialize};

use beerusty_core::config::clamp_setting;
use log::debug;

mod decoder;
mod frame;
pub mod pulse;
mod store;

pub use decoder::*;
pub use frame::*;
pub use pulse::*;
pub use store::*;

/// The size of the save header excluding the SOH and the checksum.
pub const HEADER_SIZE: usize = 16;
/// The size of the save file name.
pub const NAME_SIZE: usize = 6;
/// The maximum size of a single data block.
pub const BLOCK_SIZE: usize = 256;
/// The start of header byte following the save leader.
pub const SOH: u8 = 0x01;
/// The byte of the save leader and trailer.
pub const LEADER_BYTE: u8 = 0x00;
/// The byte of the stream preamble, gaps and trailer.
pub const PREAMBLE_BYTE: u8 = 0xFF;
/// The marker starting a stream block.
pub const STREAM_MARKER: u8 = 0x2A;
/// The maximum size of a file piped to the cassette input as a raw stream.
pub const MAX_PIPE_SIZE: usize = 16 * 1024 * 1024;

/// The framing of the data on tape.
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TapeFormat {
    /// A raw byte stream of checksummed blocks.
    Stream,
    /// A file with a header.
    Save,
}

/// Tape codec configuration.
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "snapshot", serde(default))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TapeConfig {
    /// The accepted deviation of a half-cycle duration from its nominal value in percent.
    pub tolerance_percent: u32,
    /// The number of preamble bytes written before a stream.
    pub stream_preamble: u32,
    /// The number of preamble bytes written between stream blocks.
    pub stream_block_gap: u32,
    /// The number of leader bytes written before a save header.
    pub save_leader: u32,
    /// The number of bytes written after the last block.
    pub trailer: u32,
    /// The number of 1200 Hz cycles above 36 still recognized as a save leader byte.
    pub save_leader_leeway: u32,
    /// The maximum size of a file loaded as a save.
    pub max_file_size: u32,
}

impl Default for TapeConfig {
    fn default() -> Self {
        TapeConfig {
            tolerance_percent: 25,
            stream_preamble: 32,
            stream_block_gap: 2,
            save_leader: 64,
            trailer: 8,
            save_leader_leeway: 4,
            max_file_size: u16::MAX as u32,
        }
    }
}

impl TapeConfig {
    /// Returns the configuration with every value clamped to its accepted range.
    pub fn clamped(self) -> Self {
        TapeConfig {
            tolerance_percent: clamp_setting("tape.tolerance_percent", self.tolerance_percent, 5, 33),
            stream_preamble: clamp_setting("tape.stream_preamble", self.stream_preamble, 1, 4096),
            stream_block_gap: clamp_setting("tape.stream_block_gap", self.stream_block_gap, 0, 4096),
            save_leader: clamp_setting("tape.save_leader", self.save_leader, 1, 4096),
            trailer: clamp_setting("tape.trailer", self.trailer, 1, 4096),
            save_leader_leeway: clamp_setting("tape.save_leader_leeway", self.save_leader_leeway, 0, 36),
            max_file_size: clamp_setting("tape.max_file_size", self.max_file_size, 0, u16::MAX as u32),
        }
    }
}

/// The error type returned by the tape encoders.
#[derive(Debug)]
pub enum TapeError {
    /// The tape buffer could not be allocated.
    OutOfMemory(TryReserveError),
    /// The source file exceeds the maximum size the framing can express.
    FileTooLarge { size: u64, max: u64 },
    /// Reading the source file failed.
    Io(io::Error),
}

impl Error for TapeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TapeError::OutOfMemory(e) => Some(e),
            TapeError::Io(e) => Some(e),
            TapeError::FileTooLarge {..} => None
        }
    }
}

impl fmt::Display for TapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TapeError::OutOfMemory(_) => f.write_str("not enough memory for the tape buffer"),
            TapeError::FileTooLarge { size, max } => write!(f,
                "the file is too large to be put on tape: {} bytes, at most {} bytes allowed", size, max),
            TapeError::Io(e) => write!(f, "can't read the tape source file: {}", e)
        }
    }
}

impl From<io::Error> for TapeError {
    fn from(e: io::Error) -> Self {
        TapeError::Io(e)
    }
}

impl From<TryReserveError> for TapeError {
    fn from(e: TryReserveError) -> Self {
        TapeError::OutOfMemory(e)
    }
}

impl From<TapeError> for io::Error {
    fn from(e: TapeError) -> Self {
        match e {
            TapeError::Io(e) => e,
            TapeError::OutOfMemory(_) => io::Error::new(ErrorKind::Other, e),
            TapeError::FileTooLarge {..} => io::Error::new(ErrorKind::InvalidInput, e)
        }
    }
}

/// The header of a saved file.
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TapeHeader {
    /// The file name padded with spaces.
    pub name: [u8; NAME_SIZE],
    /// The file type, e.g. `b'M'` for machine code or `b'B'` for BASIC.
    pub file_type: u8,
    /// The size of the file data.
    pub size: u16,
    /// The load address.
    pub load: u16,
    /// The execution address.
    pub exec: u16,
    /// The data blocks are written at 1200 baud if non-zero.
    pub speed: u8,
    /// The file is executed after loading if non-zero.
    pub autoexec: u8,
    pub reserved: u8,
}

impl Default for TapeHeader {
    fn default() -> Self {
        TapeHeader {
            name: [b' '; NAME_SIZE],
            file_type: b'M',
            size: 0,
            load: 0x0900,
            exec: 0x0900,
            speed: 0,
            autoexec: 0,
            reserved: 0
        }
    }
}

impl TapeHeader {
    /// Creates a machine code header.
    pub fn new_code(load: u16, exec: u16) -> Self {
        TapeHeader { load, exec, ..Default::default() }
    }
    /// Changes `name`, builder style. Names longer than 6 bytes are truncated.
    pub fn with_name<S: AsRef<[u8]>>(mut self, name: S) -> Self {
        let name = name.as_ref();
        let bname = &name[0..name.len().min(NAME_SIZE)];
        self.name[0..bname.len()].copy_from_slice(bname);
        for p in self.name[bname.len()..].iter_mut() {
            *p = b' ';
        }
        self
    }
    /// Changes `file_type`, builder style.
    pub fn with_type(mut self, file_type: u8) -> Self {
        self.file_type = file_type;
        self
    }
    /// Changes `size`, builder style.
    pub fn with_size(mut self, size: u16) -> Self {
        self.size = size;
        self
    }
    /// Changes `load`, builder style.
    pub fn with_load(mut self, load: u16) -> Self {
        self.load = load;
        self
    }
    /// Changes `exec`, builder style.
    pub fn with_exec(mut self, exec: u16) -> Self {
        self.exec = exec;
        self
    }
    /// Changes `speed`, builder style.
    pub fn with_fast(mut self, fast: bool) -> Self {
        self.speed = fast as u8;
        self
    }
    /// Changes `autoexec`, builder style.
    pub fn with_autoexec(mut self, autoexec: bool) -> Self {
        self.autoexec = if autoexec { 0xFF } else { 0 };
        self
    }
    /// Returns `true` if the data blocks are written at 1200 baud.
    pub fn is_fast(&self) -> bool {
        self.speed != 0
    }

    pub fn is_autoexec(&self) -> bool {
        self.autoexec != 0
    }
    /// Returns the name with the padding removed.
    pub fn name_str(&self) -> Cow<'_, str> {
        let len = self.name.iter().rposition(|&c| c != b' ' && c != 0).map_or(0, |p| p + 1);
        String::from_utf8_lossy(&self.name[..len])
    }
    /// Returns the number of data blocks following the header.
    pub fn block_count(&self) -> usize {
        (self.size as usize + BLOCK_SIZE - 1) / BLOCK_SIZE
    }
    /// Returns the header as it is written on tape, excluding the SOH and the checksum.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..6].copy_from_slice(&self.name);
        bytes[6] = self.file_type;
        bytes[7..9].copy_from_slice(&self.size.to_le_bytes());
        bytes[9..11].copy_from_slice(&self.load.to_le_bytes());
        bytes[11..13].copy_from_slice(&self.exec.to_le_bytes());
        bytes[13] = self.speed;
        bytes[14] = self.autoexec;
        bytes[15] = self.reserved;
        bytes
    }
    /// Returns the checksum of this header.
    pub fn checksum(&self) -> u8 {
        header_checksum(self.to_bytes().iter())
    }
}

impl TryFrom<&'_[u8]> for TapeHeader {
    type Error = io::Error;
    fn try_from(header: &[u8]) -> io::Result<Self> {
        if header.len() != HEADER_SIZE {
            return Err(io::Error::new(ErrorKind::InvalidData, "Not a proper tape header: invalid length"));
        }
        let word = |at: usize| u16::from_le_bytes([header[at], header[at + 1]]);
        let mut name = [0u8; NAME_SIZE];
        name.copy_from_slice(&header[0..6]);
        Ok(TapeHeader {
            name,
            file_type: header[6],
            size: word(7),
            load: word(9),
            exec: word(11),
            speed: header[13],
            autoexec: header[14],
            reserved: header[15]
        })
    }
}

/// Formats the human readable metadata written next to the saved files.
impl fmt::Display for TapeHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "name: {}", self.name_str())?;
        if self.file_type.is_ascii_graphic() {
            writeln!(f, "type: {}", self.file_type as char)?;
        }
        else {
            writeln!(f, "type: 0x{:02x}", self.file_type)?;
        }
        writeln!(f, "size: {} (0x{:04x})", self.size, self.size)?;
        writeln!(f, "load: 0x{:04x}", self.load)?;
        writeln!(f, "exec: 0x{:04x}", self.exec)?;
        writeln!(f, "speed: {}", if self.is_fast() { 1200 } else { 300 })?;
        writeln!(f, "autoexec: {}", if self.is_autoexec() { "yes" } else { "no" })
    }
}

/// Calculates the checksum of a stream block payload.
///
/// Each byte is XORed with the checksum which is then rotated left by one bit.
pub fn stream_checksum<I: IntoIterator<Item=B>, B: Borrow<u8>>(iter: I) -> u8 {
    iter.into_iter().fold(0u8, |acc, x| (acc ^ *x.borrow()).rotate_left(1))
}

/// Calculates the checksum of a save data block.
///
/// Each byte is subtracted from the checksum which is then complemented.
pub fn block_checksum<I: IntoIterator<Item=B>, B: Borrow<u8>>(iter: I) -> u8 {
    iter.into_iter().fold(0u8, |acc, x| !acc.wrapping_sub(*x.borrow()))
}

/// Calculates the checksum of the save header bytes following the SOH.
///
/// This is the two's complement of the sum of the bytes with its high nibble decremented.
pub fn header_checksum<I: IntoIterator<Item=B>, B: Borrow<u8>>(iter: I) -> u8 {
    let sum = iter.into_iter().fold(0u8, |acc, x| acc.wrapping_add(*x.borrow()));
    sum.wrapping_neg().wrapping_sub(0x10)
}

/// Encodes data read from `rd` as a raw stream to be piped to the cassette input at the given `baud`.
pub fn encode_raw_pipe<R: Read>(rd: R, baud: Baud, config: &TapeConfig) -> Result<TapeInputBuffer, TapeError> {
    let data = read_limited(rd, MAX_PIPE_SIZE)?;
    let framed = FramedBytes::stream(&data, config)?;
    let buffer = TapeInputBuffer::from_framed(&framed, baud)?;
    debug!("piping {} bytes as {} tape bits at {:?}", data.len(), buffer.len(), baud);
    Ok(buffer)
}

/// Encodes data read from `rd` as a saved file with the given `header` to be loaded from the cassette input.
///
/// The `size` of the header is set to the size of the data read.
pub fn encode_memory_load<R: Read>(header: TapeHeader, rd: R, config: &TapeConfig) -> Result<TapeInputBuffer, TapeError> {
    let data = read_limited(rd, config.max_file_size.min(u16::MAX as u32) as usize)?;
    let header = header.with_size(data.len() as u16);
    let framed = FramedBytes::save(&header, &data, config)?;
    let buffer = TapeInputBuffer::from_framed(&framed, Baud::B300)?;
    debug!("loading \"{}\": {} bytes as {} tape bits", header.name_str(), data.len(), buffer.len());
    Ok(buffer)
}

fn read_limited<R: Read>(rd: R, max: usize) -> Result<Vec<u8>, TapeError> {
    let mut data = Vec::new();
    rd.take(max as u64 + 1).read_to_end(&mut data)?;
    if data.len() > max {
        return Err(TapeError::FileTooLarge { size: data.len() as u64, max: max as u64 })
    }
    Ok(data)
}
