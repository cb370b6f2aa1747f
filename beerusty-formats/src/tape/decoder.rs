/*
    Copyright (C) 2020-2022  Rafal Michalski

    This file is part of BEERUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
use core::num::NonZeroU32;
use std::io;

use log::{debug, info};

#[cfg(feature = "snapshot")]
use serde::{Serialize, Deserialize};

use beerusty_core::chip::Level;
use super::*;

/// An event emitted by the [TapeDecoder].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TapeEvent {
    /// A stream block was stored.
    StreamBlock { length: usize },
    /// A saved file was stored.
    FileSaved { header: TapeHeader },
}

/// The combined state of both layers of the [TapeDecoder].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TapeDecoderState {
    pub course: CourseState,
    pub frame: FrameState,
}

/// Tape decoding counters.
#[cfg_attr(feature = "snapshot", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TapeStats {
    /// The number of stream blocks stored.
    pub stream_blocks: u64,
    /// The number of saved files stored.
    pub files_saved: u64,
    /// The number of times decoding was abandoned due to unexpected input.
    pub protocol_resets: u64,
}

/// Decodes the signal of the cassette output and stores the decoded data in a [TapeStore].
///
/// The decoder is built of two layers: the [CourseDecoder] turning half-cycles into bytes and
/// the [FrameDecoder] interpreting the bytes. Any unexpected input resets both layers, after which
/// the decoder waits for the next recognizable byte.
#[derive(Clone, Debug)]
pub struct TapeDecoder<S> {
    store: S,
    timing: PulseTiming,
    course: CourseDecoder,
    frame: FrameDecoder,
    last_level: Option<Level>,
    pending: u32,
    stats: TapeStats,
}

impl<S: TapeStore> TapeDecoder<S> {
    pub fn new(store: S, timing: PulseTiming, config: &TapeConfig) -> Self {
        TapeDecoder {
            store,
            timing,
            course: CourseDecoder::new(config.save_leader_leeway),
            frame: FrameDecoder::default(),
            last_level: None,
            pending: 0,
            stats: TapeStats::default(),
        }
    }
    /// Changes the timing used to classify the half-cycles that follow.
    pub fn set_timing(&mut self, timing: PulseTiming) {
        self.timing = timing;
    }

    pub fn timing(&self) -> &PulseTiming {
        &self.timing
    }
    /// Feeds the decoder with the output `level` reached after `cycles` since the previous call.
    ///
    /// Calls not changing the level extend the current half-cycle. The first call only establishes
    /// the initial level.
    pub fn on_edge(&mut self, level: Level, cycles: u32) -> io::Result<Option<TapeEvent>> {
        let delta = self.pending.saturating_add(cycles);
        match self.last_level {
            Some(last) if last == level => {
                self.pending = delta;
                Ok(None)
            }
            Some(_) => {
                self.pending = 0;
                self.last_level = Some(level);
                self.half_cycle(delta)
            }
            None => {
                self.pending = 0;
                self.last_level = Some(level);
                Ok(None)
            }
        }
    }
    /// Feeds the decoder with a half-cycle lasting `cycles`.
    pub fn half_cycle(&mut self, cycles: u32) -> io::Result<Option<TapeEvent>> {
        let tone = match self.timing.classify(cycles) {
            Some(tone) => tone,
            None => {
                if !self.is_idle() {
                    debug!("tape: half-cycle of {} cycles out of tolerance, {:?}", cycles, self.state());
                    self.stats.protocol_resets += 1;
                }
                self.reset();
                return Ok(None)
            }
        };
        let was_idle = self.course.is_idle();
        match self.course.step(tone) {
            CourseStep::Pending => Ok(None),
            CourseStep::Detected(format, baud) => {
                debug!("tape: {:?} detected at {} baud", format, baud.bits_per_second());
                self.frame.start(format);
                Ok(None)
            }
            CourseStep::Violation => {
                if !was_idle {
                    debug!("tape: unexpected {:?} half-cycle, {:?}", tone, self.frame.state());
                    self.stats.protocol_resets += 1;
                }
                self.frame.reset();
                Ok(None)
            }
            CourseStep::Byte(byte) => self.on_byte(byte)
        }
    }
    /// Feeds the decoder with consecutive half-cycle durations.
    ///
    /// Returns all events emitted.
    pub fn write_pulses<I: IntoIterator<Item=NonZeroU32>>(&mut self, iter: I) -> io::Result<Vec<TapeEvent>> {
        let mut events = Vec::new();
        for delta in iter {
            if let Some(event) = self.half_cycle(delta.get())? {
                events.push(event);
            }
        }
        Ok(events)
    }

    fn on_byte(&mut self, byte: u8) -> io::Result<Option<TapeEvent>> {
        match self.frame.step(byte) {
            FrameStep::Pending => Ok(None),
            FrameStep::SwitchToFast => {
                debug!("tape: switching to 1200 baud");
                self.course.set_baud(Baud::B1200);
                Ok(None)
            }
            FrameStep::StreamBlock => {
                let length = self.frame.data().len();
                if let Err(e) = self.store.store_stream_block(self.frame.data()) {
                    self.reset();
                    return Err(e)
                }
                self.stats.stream_blocks += 1;
                Ok(Some(TapeEvent::StreamBlock { length }))
            }
            FrameStep::FileSaved(header) => {
                let res = self.store.store_file(&header, self.frame.data());
                self.reset();
                res?;
                info!("tape: saved \"{}\" {} bytes", header.name_str(), header.size);
                self.stats.files_saved += 1;
                Ok(Some(TapeEvent::FileSaved { header }))
            }
            FrameStep::Violation => {
                debug!("tape: unexpected byte 0x{:02x}", byte);
                self.stats.protocol_resets += 1;
                self.course.reset();
                Ok(None)
            }
        }
    }
}

impl<S> TapeDecoder<S> {
    pub fn state(&self) -> TapeDecoderState {
        TapeDecoderState { course: self.course.state(), frame: self.frame.state() }
    }
    /// Returns `true` if no tape signal is being decoded.
    pub fn is_idle(&self) -> bool {
        self.course.is_idle() && self.frame.state() == FrameState::Idle
    }
    /// Returns the baud rate of the signal being decoded.
    pub fn baud(&self) -> Option<Baud> {
        self.course.baud()
    }
    /// Returns the framing of the signal being decoded.
    pub fn format(&self) -> Option<TapeFormat> {
        self.frame.format()
    }
    /// Resets both decoding layers discarding any partially received data.
    pub fn reset(&mut self) {
        self.course.reset();
        self.frame.reset();
    }

    pub fn stats(&self) -> &TapeStats {
        &self.stats
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_inner(self) -> S {
        self.store
    }
}

#[cfg(test)]
mod tests {
    use rand::prelude::*;
    use rand::rngs::SmallRng;
    use super::*;

    fn config() -> TapeConfig {
        TapeConfig { stream_preamble: 4, save_leader: 4, trailer: 2, ..TapeConfig::default() }
    }

    fn play(decoder: &mut TapeDecoder<MemoryTapeStore>, framed: &FramedBytes, baud: Baud) -> Vec<TapeEvent> {
        let buffer = TapeInputBuffer::from_framed(framed, baud).unwrap();
        decoder.write_pulses(buffer.pulse_iter(*decoder.timing())).unwrap()
    }

    #[test]
    fn tape_decoder_stores_streams() {
        let data: Vec<u8> = (0..700).map(|n| (n % 251) as u8).collect();
        for &baud in &[Baud::B300, Baud::B1200] {
            let mut decoder = TapeDecoder::new(MemoryTapeStore::default(), PulseTiming::default(), &config());
            let events = play(&mut decoder, &FramedBytes::stream(&data, &config()).unwrap(), baud);
            assert_eq!(vec![TapeEvent::StreamBlock { length: 256 },
                            TapeEvent::StreamBlock { length: 256 },
                            TapeEvent::StreamBlock { length: 188 }], events);
            assert_eq!(data, decoder.store().stream);
            assert_eq!(3, decoder.stats().stream_blocks);
            assert_eq!(0, decoder.stats().protocol_resets);
            assert_eq!(Some(TapeFormat::Stream), decoder.format());
            assert_eq!(Some(baud), decoder.baud());
        }
    }

    #[test]
    fn tape_decoder_stores_saves() {
        for &fast in &[false, true] {
            let data: Vec<u8> = (0..600).map(|n| (n * 3) as u8).collect();
            let header = TapeHeader::new_code(0x0900, 0x0900).with_name("PROG").with_fast(fast)
                                     .with_size(data.len() as u16);
            let mut decoder = TapeDecoder::new(MemoryTapeStore::default(), PulseTiming::default(), &config());
            let events = play(&mut decoder, &FramedBytes::save(&header, &data, &config()).unwrap(), Baud::B300);
            assert_eq!(vec![TapeEvent::FileSaved { header }], events);
            assert_eq!(1, decoder.store().files.len());
            assert_eq!((header, data), decoder.store().files[0]);
            assert_eq!(1, decoder.stats().files_saved);
        }
    }

    #[test]
    fn tape_decoder_accepts_edges() {
        let framed = FramedBytes::stream(b"edges", &config()).unwrap();
        let buffer = TapeInputBuffer::from_framed(&framed, Baud::B1200).unwrap();
        let mut decoder = TapeDecoder::new(MemoryTapeStore::default(), PulseTiming::default(), &config());
        let mut level = Level::Low;
        assert_eq!(None, decoder.on_edge(level, 10_000).unwrap());
        let mut events = Vec::new();
        for delta in buffer.pulse_iter(PulseTiming::default()) {
            // split every half-cycle in two
            assert_eq!(None, decoder.on_edge(level, delta.get() / 2).unwrap());
            level = !level;
            if let Some(event) = decoder.on_edge(level, delta.get() - delta.get() / 2).unwrap() {
                events.push(event);
            }
        }
        assert_eq!(vec![TapeEvent::StreamBlock { length: 5 }], events);
        assert_eq!(b"edges", &decoder.store().stream[..]);
    }

    #[test]
    fn tape_decoder_resets_on_noise() {
        let mut decoder = TapeDecoder::new(MemoryTapeStore::default(), PulseTiming::default(), &config());
        // a stream detected then interrupted by a glitch
        for _ in 0..2 {
            decoder.half_cycle(1406).unwrap();
        }
        decoder.half_cycle(703).unwrap();
        assert!(!decoder.is_idle());
        decoder.half_cycle(100).unwrap();
        assert!(decoder.is_idle());
        assert_eq!(1, decoder.stats().protocol_resets);
        // noise while idle is not counted
        decoder.half_cycle(100).unwrap();
        decoder.half_cycle(703).unwrap();
        for _ in 0..3 {
            decoder.half_cycle(1406).unwrap();
        }
        decoder.half_cycle(703).unwrap();
        assert_eq!(1, decoder.stats().protocol_resets);
        assert!(decoder.is_idle());
    }

    #[test]
    fn tape_decoder_heals_after_glitch() {
        let mut rng = SmallRng::seed_from_u64(7);
        let timing = PulseTiming::default();
        for _ in 0..60 {
            let data: Vec<u8> = (0..rng.gen_range(1..600)).map(|_| rng.gen()).collect();
            let header = TapeHeader::new_code(0x0900, 0x0900).with_name("HEAL").with_fast(rng.gen())
                                     .with_size(data.len() as u16);
            let save = rng.gen_bool(0.5);
            let (framed, baud) = if save {
                (FramedBytes::save(&header, &data, &config()).unwrap(), Baud::B300)
            }
            else {
                let baud = if rng.gen() { Baud::B300 } else { Baud::B1200 };
                (FramedBytes::stream(&data, &config()).unwrap(), baud)
            };
            let pulses: Vec<u32> = TapeInputBuffer::from_framed(&framed, baud).unwrap()
                                                   .pulse_iter(timing).map(|p| p.get()).collect();
            let mut decoder = TapeDecoder::new(MemoryTapeStore::default(), timing, &config());
            let mut level = Level::Low;
            let mut feed = |decoder: &mut TapeDecoder<MemoryTapeStore>, pulses: &[u32]| {
                let mut events = Vec::new();
                for &delta in pulses {
                    level = !level;
                    if let Some(event) = decoder.on_edge(level, delta).unwrap() {
                        events.push(event);
                    }
                }
                events
            };
            assert_eq!(None, decoder.on_edge(Level::Low, 0).unwrap());
            // stopped somewhere in the leader, the header or the data
            let cut = rng.gen_range(1..pulses.len());
            let events = feed(&mut decoder, &pulses[..cut]);
            let streamed: usize = events.iter().map(|event| match event {
                TapeEvent::StreamBlock { length } => *length,
                TapeEvent::FileSaved { .. } => 0
            }).sum();
            let saved = events.len() - decoder.store().blocks;
            assert_eq!(&data[..streamed], &decoder.store().stream[..]);
            assert_eq!(saved, decoder.store().files.len());

            let store = decoder.store().clone();
            let resets = decoder.stats().protocol_resets;
            let was_idle = decoder.is_idle();
            let glitch = match rng.gen_range(0..3) {
                0 => rng.gen_range(1..500),
                1 => rng.gen_range(950..1000),
                _ => rng.gen_range(1800..50_000)
            };
            assert_eq!(None, feed(&mut decoder, &[glitch]).pop());
            assert!(decoder.is_idle(), "cut: {} of {} glitch: {}", cut, pulses.len(), glitch);
            assert_eq!(&store, decoder.store());
            assert_eq!(resets + !was_idle as u64, decoder.stats().protocol_resets);
            // the tape played again from the start decodes in full
            let events = feed(&mut decoder, &pulses);
            if save {
                assert_eq!(vec![TapeEvent::FileSaved { header }], events);
                assert_eq!(Some(&(header, data)), decoder.store().files.last());
            }
            else {
                assert_eq!(data.len(), events.iter().map(|event| match event {
                    TapeEvent::StreamBlock { length } => *length,
                    TapeEvent::FileSaved { .. } => 0
                }).sum::<usize>());
                assert_eq!(&data[..], &decoder.store().stream[streamed..]);
            }
        }
    }

    #[test]
    fn tape_decoder_recovers_from_store_errors() {
        struct Failing;
        impl TapeStore for Failing {
            fn store_stream_block(&mut self, _data: &[u8]) -> io::Result<()> {
                Err(io::Error::new(io::ErrorKind::Other, "disk full"))
            }
            fn store_file(&mut self, _header: &TapeHeader, _data: &[u8]) -> io::Result<()> {
                Err(io::Error::new(io::ErrorKind::Other, "disk full"))
            }
        }
        let mut decoder = TapeDecoder::new(Failing, PulseTiming::default(), &config());
        let buffer = TapeInputBuffer::from_framed(&FramedBytes::stream(b"x", &config()).unwrap(), Baud::B1200).unwrap();
        let err = decoder.write_pulses(buffer.pulse_iter(PulseTiming::default())).unwrap_err();
        assert_eq!("disk full", err.to_string());
        assert!(decoder.is_idle());
        assert_eq!(0, decoder.stats().stream_blocks);
    }
}
