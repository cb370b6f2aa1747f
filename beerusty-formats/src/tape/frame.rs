/*
    Copyright (C) 2020-2022  Rafal Michalski

    This file is part of BEERUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
use core::convert::TryFrom;
use std::collections::TryReserveError;

use arrayvec::ArrayVec;

#[cfg(feature = "snapshot")]
use serde::{Serialize, Deserialize};

use super::*;

/// The position of the [FrameDecoder] within the framing.
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    /// No framing was recognized yet.
    Idle,
    /// Expecting preamble bytes or the block marker.
    StreamPreamble,
    /// Expecting the payload length.
    StreamLength,
    /// Receiving the payload.
    StreamPayload { remaining: u16 },
    /// Expecting the payload checksum.
    StreamChecksum,
    /// Expecting leader bytes or the SOH.
    SaveLeader,
    /// Receiving the header.
    SaveHeader,
    /// Expecting the header checksum.
    SaveHeaderChecksum,
    /// Receiving a data block.
    SaveBlock { remaining: u16 },
    /// Expecting the data block checksum.
    SaveBlockChecksum,
}

/// The result of feeding a byte to the [FrameDecoder].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStep {
    /// More bytes are needed.
    Pending,
    /// A valid header requesting 1200 baud data blocks was received.
    SwitchToFast,
    /// A stream block was received, its payload is available from [FrameDecoder::data].
    StreamBlock,
    /// A whole saved file was received, its data is available from [FrameDecoder::data].
    FileSaved(TapeHeader),
    /// The byte didn't fit the framing, the decoder has been reset.
    Violation,
}

impl Default for FrameState {
    fn default() -> Self {
        FrameState::Idle
    }
}

/// Interprets the bytes received from tape according to the stream or save framing.
#[derive(Clone, Debug, Default)]
pub struct FrameDecoder {
    state: FrameState,
    header_buf: ArrayVec<u8, HEADER_SIZE>,
    header: Option<TapeHeader>,
    data: Vec<u8>,
    block_start: usize,
}

impl FrameDecoder {
    pub fn state(&self) -> FrameState {
        self.state
    }
    /// Returns the framing being decoded.
    pub fn format(&self) -> Option<TapeFormat> {
        use FrameState::*;
        match self.state {
            Idle => None,
            StreamPreamble|StreamLength|StreamPayload {..}|StreamChecksum => Some(TapeFormat::Stream),
            SaveLeader|SaveHeader|SaveHeaderChecksum|SaveBlock {..}|SaveBlockChecksum => Some(TapeFormat::Save)
        }
    }
    /// Returns the header of the file being received.
    pub fn header(&self) -> Option<&TapeHeader> {
        self.header.as_ref()
    }
    /// Returns the payload of the last stream block or the data of the file received so far.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
    /// Resets the decoder to idle.
    pub fn reset(&mut self) {
        self.state = FrameState::Idle;
        self.header_buf.clear();
        self.header = None;
        self.data.clear();
        self.block_start = 0;
    }
    /// Resets the decoder and starts expecting the given framing.
    pub fn start(&mut self, format: TapeFormat) {
        self.reset();
        self.state = match format {
            TapeFormat::Stream => FrameState::StreamPreamble,
            TapeFormat::Save => FrameState::SaveLeader
        };
    }
    /// Feeds the decoder with the next byte.
    pub fn step(&mut self, byte: u8) -> FrameStep {
        use FrameState::*;
        match self.state {
            Idle => FrameStep::Pending,
            StreamPreamble => match byte {
                PREAMBLE_BYTE => FrameStep::Pending,
                STREAM_MARKER => {
                    self.data.clear();
                    self.state = StreamLength;
                    FrameStep::Pending
                }
                _ => self.violation()
            }
            StreamLength => {
                let remaining = if byte == 0 { BLOCK_SIZE as u16 } else { byte as u16 };
                self.state = StreamPayload { remaining };
                FrameStep::Pending
            }
            StreamPayload { remaining } => {
                self.data.push(byte);
                self.state = match remaining - 1 {
                    0 => StreamChecksum,
                    remaining => StreamPayload { remaining }
                };
                FrameStep::Pending
            }
            StreamChecksum => {
                if stream_checksum(&self.data) != byte {
                    return self.violation()
                }
                self.state = StreamPreamble;
                FrameStep::StreamBlock
            }
            SaveLeader => match byte {
                LEADER_BYTE => FrameStep::Pending,
                SOH => {
                    self.header_buf.clear();
                    self.state = SaveHeader;
                    FrameStep::Pending
                }
                _ => self.violation()
            }
            SaveHeader => {
                self.header_buf.push(byte);
                if self.header_buf.is_full() {
                    self.state = SaveHeaderChecksum;
                }
                FrameStep::Pending
            }
            SaveHeaderChecksum => {
                if header_checksum(&self.header_buf) != byte {
                    return self.violation()
                }
                let header = match TapeHeader::try_from(&self.header_buf[..]) {
                    Ok(header) => header,
                    Err(_) => return self.violation()
                };
                self.header = Some(header);
                self.data.clear();
                self.block_start = 0;
                if header.size == 0 {
                    return self.file_saved(header)
                }
                self.state = SaveBlock { remaining: next_block_size(&header, 0) };
                if header.is_fast() {
                    FrameStep::SwitchToFast
                }
                else {
                    FrameStep::Pending
                }
            }
            SaveBlock { remaining } => {
                self.data.push(byte);
                self.state = match remaining - 1 {
                    0 => SaveBlockChecksum,
                    remaining => SaveBlock { remaining }
                };
                FrameStep::Pending
            }
            SaveBlockChecksum => {
                if block_checksum(&self.data[self.block_start..]) != byte {
                    return self.violation()
                }
                let header = match self.header {
                    Some(header) => header,
                    None => return self.violation()
                };
                if self.data.len() >= header.size as usize {
                    return self.file_saved(header)
                }
                self.block_start = self.data.len();
                self.state = SaveBlock { remaining: next_block_size(&header, self.block_start) };
                FrameStep::Pending
            }
        }
    }

    fn file_saved(&mut self, header: TapeHeader) -> FrameStep {
        self.state = FrameState::Idle;
        FrameStep::FileSaved(header)
    }

    fn violation(&mut self) -> FrameStep {
        self.reset();
        FrameStep::Violation
    }
}

fn next_block_size(header: &TapeHeader, offset: usize) -> u16 {
    (header.size as usize - offset).min(BLOCK_SIZE) as u16
}

/// A sequence of bytes to be written to tape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FramedBytes {
    /// The framed bytes.
    pub bytes: Vec<u8>,
    /// The index of the first byte to be written at 1200 baud.
    pub fast_from: Option<usize>,
    pub format: TapeFormat,
}

impl FramedBytes {
    /// Frames `data` as a stream split into blocks of up to 256 bytes.
    pub fn stream(data: &[u8], config: &TapeConfig) -> Result<Self, TryReserveError> {
        let preamble = config.stream_preamble as usize;
        let gap = config.stream_block_gap as usize;
        let trailer = config.trailer as usize;
        let blocks = (data.len() + BLOCK_SIZE - 1) / BLOCK_SIZE;
        let size = preamble + data.len() + 3 * blocks + gap * blocks.saturating_sub(1) + trailer;
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(size)?;
        bytes.resize(preamble, PREAMBLE_BYTE);
        for (index, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
            if index != 0 {
                bytes.resize(bytes.len() + gap, PREAMBLE_BYTE);
            }
            bytes.push(STREAM_MARKER);
            bytes.push(chunk.len() as u8);
            bytes.extend_from_slice(chunk);
            bytes.push(stream_checksum(chunk));
        }
        bytes.resize(bytes.len() + trailer, PREAMBLE_BYTE);
        Ok(FramedBytes { bytes, fast_from: None, format: TapeFormat::Stream })
    }
    /// Frames `data` as a saved file with the given `header`.
    ///
    /// The data is truncated to the `size` of the header.
    pub fn save(header: &TapeHeader, data: &[u8], config: &TapeConfig) -> Result<Self, TryReserveError> {
        let data = &data[..data.len().min(header.size as usize)];
        let header = header.with_size(data.len() as u16);
        let leader = config.save_leader as usize;
        let trailer = config.trailer as usize;
        let size = leader + 1 + HEADER_SIZE + 1 + data.len() + header.block_count() + trailer;
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(size)?;
        bytes.resize(leader, LEADER_BYTE);
        bytes.push(SOH);
        bytes.extend_from_slice(&header.to_bytes());
        bytes.push(header.checksum());
        let fast_from = if header.is_fast() { Some(bytes.len()) } else { None };
        for chunk in data.chunks(BLOCK_SIZE) {
            bytes.extend_from_slice(chunk);
            bytes.push(block_checksum(chunk));
        }
        bytes.resize(bytes.len() + trailer, LEADER_BYTE);
        Ok(FramedBytes { bytes, fast_from, format: TapeFormat::Save })
    }
}
