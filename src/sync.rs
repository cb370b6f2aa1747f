/*
    Copyright (C) 2020-2022  Rafal Michalski

    This file is part of BEERUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! The synchronization driver.
//!
//! [SyncDriver] runs the emulation in synchronization passes. Each pass:
//!
//! 1. plays back the cassette input for the coming quantum of cycles and hands the signal edges
//!    over to the CPU driver,
//! 2. lets the CPU driver execute the quantum,
//! 3. feeds the cassette output edges produced by the CPU driver to the tape decoder,
//! 4. updates the video controller and the keyboard matrix, batching the cycles of several
//!    passes if the throttle says so,
//! 5. lets the speed throttle controller account for the executed cycles, possibly waiting for
//!    the host to catch up.
//!
//! The throttle decision used by the video update of a pass is the one made at the end of the
//! previous pass, so a single pass never observes a change of the throttle state.
use core::fmt;
use std::error::Error;
use std::io::{self, Read};
use std::mem;
use std::sync::Arc;

use log::debug;

use crate::chip::{CpuDriver, TapeEdge, VideoController};
use crate::clock::{CycleBudget, CycleClock};
use crate::config::EmulatorConfig;
use crate::formats::tape::{
    encode_memory_load, encode_raw_pipe,
    Baud, PulseTiming, TapeConfig, TapeDecoder, TapeError, TapeEvent, TapeHeader, TapePlayer, TapeStore
};
use crate::peripherals::keyboard::{HostKey, KeyFileSource, KeyMatrix};
use crate::throttle::{ThrottleDecision, ThrottleState};

mod timer;

pub use timer::*;

/// The error type returned by the [SyncDriver].
#[derive(Debug)]
pub enum SyncError {
    /// The host timers could not be started.
    TimerInstall(io::Error),
    /// A tape could not be encoded.
    Tape(TapeError),
    /// Storing the tape output or reading the key file failed.
    Io(io::Error),
}

impl Error for SyncError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SyncError::TimerInstall(e) => Some(e),
            SyncError::Tape(e) => Some(e),
            SyncError::Io(e) => Some(e)
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::TimerInstall(e) => write!(f, "can't install the host timer: {}", e),
            SyncError::Tape(e) => e.fmt(f),
            SyncError::Io(e) => e.fmt(f)
        }
    }
}

impl From<TapeError> for SyncError {
    fn from(e: TapeError) -> Self {
        SyncError::Tape(e)
    }
}

impl From<io::Error> for SyncError {
    fn from(e: io::Error) -> Self {
        SyncError::Io(e)
    }
}

/// Drives the CPU and the peripherals in lock-step.
pub struct SyncDriver<C, V, S> {
    cpu: C,
    video: V,
    clock: CycleClock,
    quantum: CycleBudget,
    throttle: Arc<ThrottleState>,
    decision: ThrottleDecision,
    timers: Option<HostTimers>,
    tape_config: TapeConfig,
    player: TapePlayer,
    tape_in_cycle: u64,
    decoder: TapeDecoder<S>,
    tape_out_cycle: u64,
    tape_events: Vec<TapeEvent>,
    edges: Vec<TapeEdge>,
    keyboard: KeyMatrix,
    key_source: Option<KeyFileSource<Box<dyn Read>>>,
    video_cycles: u32,
    video_passes: u32,
}

impl<C: CpuDriver, V: VideoController, S: TapeStore> SyncDriver<C, V, S> {
    /// Creates a new driver without the host timers. The throttle only waits if something else
    /// calls [ThrottleState::on_timer_tick].
    pub fn new(cpu: C, video: V, store: S, config: &EmulatorConfig) -> Self {
        let config = config.clamped();
        let clock = CycleClock::new(config.clock.cpu_hz);
        let throttle = Arc::new(ThrottleState::new(config.throttle, clock.cpu_hz()));
        let timing = PulseTiming::new(clock.cpu_hz(), config.tape.tolerance_percent);
        let decision = throttle.decision();
        SyncDriver {
            cpu,
            video,
            clock,
            quantum: CycleBudget::new(config.clock.quantum),
            throttle,
            decision,
            timers: None,
            tape_config: config.tape,
            player: TapePlayer::new(timing),
            tape_in_cycle: 0,
            decoder: TapeDecoder::new(store, timing, &config.tape),
            tape_out_cycle: 0,
            tape_events: Vec::new(),
            edges: Vec::new(),
            keyboard: KeyMatrix::new(config.keyboard),
            key_source: None,
            video_cycles: 0,
            video_passes: 0,
        }
    }
    /// Starts the host timers driving the throttle, builder style.
    pub fn with_host_timers(mut self) -> Result<Self, SyncError> {
        self.start_host_timers()?;
        Ok(self)
    }
    /// Starts the host timers driving the throttle, unless already running.
    pub fn start_host_timers(&mut self) -> Result<(), SyncError> {
        if self.timers.is_none() {
            let timers = HostTimers::start(Arc::clone(&self.throttle), self.throttle.config())?;
            self.timers = Some(timers);
        }
        Ok(())
    }
    /// Stops the host timers.
    pub fn stop_host_timers(&mut self) {
        if let Some(mut timers) = self.timers.take() {
            self.throttle.interrupt();
            timers.stop();
        }
    }
    /// Performs a single synchronization pass. Returns the number of cycles executed.
    pub fn sync_clock(&mut self) -> Result<CycleBudget, SyncError> {
        let decision = self.decision;
        let start = self.clock.cycles();
        // cassette input
        let initial = self.player.level();
        let target = start + self.quantum.get() as u64;
        self.edges.clear();
        // the playback is delayed rather than squeezed after a pass overran its quantum
        let base = self.tape_in_cycle.max(start);
        if base < target {
            let delta = (target - base) as u32;
            let skew = (base - start) as u32;
            let edges = &mut self.edges;
            self.player.tick_with(delta, |offset, level| {
                edges.push(TapeEdge::new(level, skew + offset));
            });
            self.tape_in_cycle = target;
        }
        self.cpu.feed_tape_in(initial, &self.edges);

        let executed = self.cpu.execute(self.quantum);
        self.clock.advance(executed);

        // the pass is completed before the first error is returned, so every component
        // accounts for the executed cycles
        let mut result = Ok(executed);

        // cassette output
        self.edges.clear();
        self.cpu.drain_tape_out(&mut self.edges);
        for edge in self.edges.iter() {
            let at = start + edge.offset as u64;
            let delta = at.saturating_sub(self.tape_out_cycle).min(u32::MAX as u64) as u32;
            self.tape_out_cycle = self.tape_out_cycle.max(at);
            match self.decoder.on_edge(edge.level, delta) {
                Ok(Some(event)) => self.tape_events.push(event),
                Ok(None) => {}
                Err(e) if result.is_ok() => result = Err(e.into()),
                Err(_) => {}
            }
        }

        // video and keyboard
        self.video_cycles = self.video_cycles.saturating_add(executed.get());
        self.video_passes += 1;
        if self.video_passes >= decision.granularity {
            let cycles = mem::replace(&mut self.video_cycles, 0);
            self.video_passes = 0;
            self.video.update(CycleBudget::new(cycles), decision.division, &mut self.keyboard);
            let scans = self.keyboard.on_cycle_tick(cycles);
            if let Err(e) = self.step_key_source(scans) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        self.decision = self.throttle.sync_pass(executed);
        result
    }
    /// Performs synchronization passes until at least `cycles` were executed.
    ///
    /// Returns the number of cycles executed.
    pub fn run_for(&mut self, cycles: u64) -> Result<u64, SyncError> {
        let mut total = 0;
        while total < cycles {
            let executed = self.sync_clock()?;
            if executed.is_empty() {
                break
            }
            total += executed.get() as u64;
        }
        Ok(total)
    }

    fn step_key_source(&mut self, scans: u32) -> Result<(), SyncError> {
        if let Some(source) = self.key_source.as_mut() {
            for _ in 0..scans {
                if let Err(e) = source.step(&mut self.keyboard) {
                    source.stop(&mut self.keyboard);
                    self.key_source = None;
                    return Err(e.into())
                }
                if source.is_done() {
                    debug!("key file: finished");
                    self.key_source = None;
                    break
                }
            }
        }
        Ok(())
    }
    /// Puts a saved file read from `rd` on the cassette input.
    ///
    /// On error the cassette input is left empty.
    pub fn tape_load<R: Read>(&mut self, header: TapeHeader, rd: R) -> Result<(), SyncError> {
        self.player.eject();
        let buffer = encode_memory_load(header, rd, &self.tape_config)?;
        self.player.load(buffer);
        self.tape_in_cycle = self.clock.cycles();
        Ok(())
    }
    /// Pipes the data read from `rd` as a stream to the cassette input.
    ///
    /// On error the cassette input is left empty.
    pub fn tape_pipe<R: Read>(&mut self, rd: R, baud: Baud) -> Result<(), SyncError> {
        self.player.eject();
        let buffer = encode_raw_pipe(rd, baud, &self.tape_config)?;
        self.player.load(buffer);
        self.tape_in_cycle = self.clock.cycles();
        Ok(())
    }
    /// Stops the cassette input.
    pub fn tape_eject(&mut self) {
        self.player.eject();
    }
    /// Returns the events emitted by the tape decoder since the last call.
    pub fn take_tape_events(&mut self) -> Vec<TapeEvent> {
        mem::take(&mut self.tape_events)
    }
    /// Passes a host key event to the keyboard matrix.
    pub fn key_event(&mut self, key: HostKey, down: bool) {
        self.keyboard.on_key_event(key, down);
    }
    /// Starts typing the characters read from `rd`, replacing the previous source.
    pub fn key_file<R: Read + 'static>(&mut self, rd: R) {
        self.stop_key_file();
        self.key_source = Some(KeyFileSource::new(Box::new(rd)));
    }
    /// Stops typing from a file.
    pub fn stop_key_file(&mut self) {
        if let Some(mut source) = self.key_source.take() {
            source.stop(&mut self.keyboard);
        }
    }

    pub fn is_typing(&self) -> bool {
        self.key_source.is_some()
    }
    /// Changes the CPU clock frequency.
    pub fn set_cpu_hz(&mut self, cpu_hz: u32) {
        self.clock.set_cpu_hz(cpu_hz);
        self.throttle.set_cpu_hz(self.clock.cpu_hz());
        let timing = PulseTiming::new(self.clock.cpu_hz(), self.tape_config.tolerance_percent);
        self.player.set_timing(timing);
        self.decoder.set_timing(timing);
    }
    /// Resets the CPU, the peripherals and the throttle, as if the power was switched off and on.
    pub fn power_cycle(&mut self) {
        debug!("power cycle");
        self.cpu.reset();
        self.video.reset();
        self.throttle.reset();
        self.decision = self.throttle.decision();
        self.clock.reset();
        self.player.eject();
        self.tape_in_cycle = 0;
        self.decoder.reset();
        self.tape_out_cycle = 0;
        self.tape_events.clear();
        self.stop_key_file();
        self.keyboard.reset();
        self.video_cycles = 0;
        self.video_passes = 0;
    }
}

impl<C, V, S> SyncDriver<C, V, S> {
    pub fn cpu(&self) -> &C {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut C {
        &mut self.cpu
    }

    pub fn video(&self) -> &V {
        &self.video
    }

    pub fn video_mut(&mut self) -> &mut V {
        &mut self.video
    }

    pub fn clock(&self) -> &CycleClock {
        &self.clock
    }
    /// Returns the number of cycles executed in each pass.
    pub fn quantum(&self) -> CycleBudget {
        self.quantum
    }
    /// Returns the shared throttle state, e.g. to toggle throttling or to pause from another thread.
    pub fn throttle(&self) -> &Arc<ThrottleState> {
        &self.throttle
    }
    /// Returns the throttle decision for the next pass.
    pub fn decision(&self) -> ThrottleDecision {
        self.decision
    }

    pub fn keyboard(&self) -> &KeyMatrix {
        &self.keyboard
    }

    pub fn keyboard_mut(&mut self) -> &mut KeyMatrix {
        &mut self.keyboard
    }

    pub fn tape_player(&self) -> &TapePlayer {
        &self.player
    }

    pub fn tape_decoder(&self) -> &TapeDecoder<S> {
        &self.decoder
    }

    pub fn tape_decoder_mut(&mut self) -> &mut TapeDecoder<S> {
        &mut self.decoder
    }

    pub fn has_host_timers(&self) -> bool {
        self.timers.is_some()
    }
}

impl<C, V, S> Drop for SyncDriver<C, V, S> {
    fn drop(&mut self) {
        if let Some(mut timers) = self.timers.take() {
            self.throttle.interrupt();
            timers.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use crate::chip::{Level, LightPen};
    use crate::formats::tape::MemoryTapeStore;
    use crate::peripherals::keyboard::MbKeyboardMap;
    use super::*;

    #[derive(Default)]
    struct Cpu {
        executed: u64,
        resets: u32,
        tape_in: Vec<(Level, usize)>,
        changes: Vec<TapeEdge>,
        overrun: u32,
    }

    impl CpuDriver for Cpu {
        fn execute(&mut self, budget: CycleBudget) -> CycleBudget {
            let cycles = budget.get() + self.overrun;
            self.executed += cycles as u64;
            CycleBudget::new(cycles)
        }
        fn reset(&mut self) {
            self.resets += 1;
        }
        fn feed_tape_in(&mut self, initial: Level, changes: &[TapeEdge]) {
            self.tape_in.push((initial, changes.len()));
            self.changes = changes.to_vec();
        }
    }

    #[derive(Default)]
    struct Video {
        updates: Vec<(u32, u32)>,
        seen: MbKeyboardMap,
    }

    impl VideoController for Video {
        fn update(&mut self, cycles: CycleBudget, clock_division: u32, lpen: &mut dyn LightPen) {
            self.updates.push((cycles.get(), clock_division));
            for cell in 0..64u16 {
                if lpen.lpen_scan(cell << 4) {
                    self.seen |= MbKeyboardMap::from_cell(cell as u8);
                }
            }
        }
    }

    fn config() -> EmulatorConfig {
        let mut config = EmulatorConfig::default();
        config.throttle.enabled = false;
        config
    }

    #[test]
    fn sync_clock_works() {
        let mut driver = SyncDriver::new(Cpu::default(), Video::default(), MemoryTapeStore::default(), &config());
        assert!(!driver.has_host_timers());
        assert_eq!(CycleBudget::new(3_375), driver.sync_clock().unwrap());
        assert_eq!(3_375, driver.clock().cycles());
        assert_eq!(vec![(3_375, 1)], driver.video().updates);
        assert_eq!(vec![(Level::Low, 0)], driver.cpu().tape_in);
        assert_eq!(10 * 3_375, driver.run_for(10 * 3_375).unwrap());
        assert_eq!(11 * 3_375, driver.cpu().executed);
        assert_eq!(11, driver.video().updates.len());
    }

    #[test]
    fn sync_clock_batches_video_updates() {
        let mut driver = SyncDriver::new(Cpu::default(), Video::default(), MemoryTapeStore::default(), &config());
        driver.throttle().set_baseline(4, 2);
        driver.power_cycle();
        assert_eq!(4, driver.decision().granularity);
        driver.run_for(8 * 3_375).unwrap();
        assert_eq!(vec![(4 * 3_375, 2), (4 * 3_375, 2)], driver.video().updates);
        assert_eq!(1, driver.cpu().resets);
    }

    #[test]
    fn sync_clock_plays_tape() {
        let mut driver = SyncDriver::new(Cpu::default(), Video::default(), MemoryTapeStore::default(), &config());
        driver.tape_pipe(Cursor::new(b"abc"), Baud::B1200).unwrap();
        assert!(driver.tape_player().is_playing());
        driver.sync_clock().unwrap();
        // the start bit of the first preamble byte toggles at 1406 and 2812
        assert_eq!((Level::High, 2), driver.cpu().tape_in[0]);
        driver.tape_eject();
        driver.sync_clock().unwrap();
        assert_eq!((Level::Low, 0), driver.cpu().tape_in[1]);
        let err = driver.tape_load(TapeHeader::default(), Cursor::new(vec![0u8; 70_000])).unwrap_err();
        assert!(matches!(err, SyncError::Tape(TapeError::FileTooLarge {..})));
        assert!(!driver.tape_player().is_playing());
    }

    #[test]
    fn sync_clock_delays_tape_after_overrun() {
        let cpu = Cpu { overrun: 100, ..Cpu::default() };
        let mut driver = SyncDriver::new(cpu, Video::default(), MemoryTapeStore::default(), &config());
        driver.tape_pipe(Cursor::new(b"abc"), Baud::B1200).unwrap();
        assert_eq!(CycleBudget::new(3_475), driver.sync_clock().unwrap());
        assert_eq!(vec![TapeEdge::new(Level::Low, 1406), TapeEdge::new(Level::High, 2812)],
                   driver.cpu().changes);
        // the first 2400 Hz half-cycle started at 2812 has 140 cycles left
        driver.sync_clock().unwrap();
        let changes = &driver.cpu().changes;
        assert_eq!(TapeEdge::new(Level::Low, 140), changes[0]);
        assert!(changes.windows(2).all(|w| w[1].offset - w[0].offset == 703));
        assert_eq!(2 * 3_475, driver.clock().cycles());
    }

    #[test]
    fn sync_clock_types_key_files() {
        let mut driver = SyncDriver::new(Cpu::default(), Video::default(), MemoryTapeStore::default(), &config());
        driver.key_file(Cursor::new(b"ab".to_vec()));
        assert!(driver.is_typing());
        driver.run_for(100 * 33_750).unwrap();
        assert!(!driver.is_typing());
        assert_eq!(MbKeyboardMap::A|MbKeyboardMap::B, driver.video().seen);
        assert_eq!(MbKeyboardMap::empty(), driver.keyboard().latched_keys());
    }
}
