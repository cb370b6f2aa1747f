/*
    Copyright (C) 2020-2022  Rafal Michalski

    This file is part of BEERUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
use std::env;
use std::fs;
use std::io::{self, Cursor};
use std::process;

use beerusty::chip::*;
use beerusty::clock::CycleBudget;
use beerusty::config::EmulatorConfig;
use beerusty::formats::tape::*;
use beerusty::peripherals::keyboard::*;
use beerusty::sync::{SyncDriver, SyncError};

/// A CPU copying its cassette input to its cassette output.
#[derive(Default)]
struct LoopbackCpu {
    out_level: Level,
    pending: Vec<TapeEdge>,
    executed: u64,
}

impl CpuDriver for LoopbackCpu {
    fn execute(&mut self, budget: CycleBudget) -> CycleBudget {
        self.executed += budget.get() as u64;
        budget
    }

    fn reset(&mut self) {
        self.out_level = Level::Low;
        self.pending.clear();
    }

    fn feed_tape_in(&mut self, initial: Level, changes: &[TapeEdge]) {
        if initial != self.out_level {
            self.pending.push(TapeEdge::new(initial, 0));
        }
        self.pending.extend_from_slice(changes);
        if let Some(last) = self.pending.last() {
            self.out_level = last.level;
        }
    }

    fn drain_tape_out(&mut self, edges: &mut Vec<TapeEdge>) {
        edges.append(&mut self.pending);
    }
}

/// A video controller reading every key cell once per update.
#[derive(Default)]
struct ScanningVideo {
    frames: Vec<MbKeyboardMap>,
    cycles: u64,
}

impl VideoController for ScanningVideo {
    fn update(&mut self, cycles: CycleBudget, _clock_division: u32, lpen: &mut dyn LightPen) {
        self.cycles += cycles.get() as u64;
        let mut keys = MbKeyboardMap::empty();
        for cell in 0..64u16 {
            if lpen.lpen_scan(cell << 4) {
                keys |= MbKeyboardMap::from_cell(cell as u8);
            }
        }
        self.frames.push(keys);
    }

    fn reset(&mut self) {
        self.frames.clear();
        self.cycles = 0;
    }
}

fn config() -> EmulatorConfig {
    let mut config = EmulatorConfig::default();
    config.throttle.enabled = false;
    config
}

fn new_driver<S: TapeStore>(store: S) -> SyncDriver<LoopbackCpu, ScanningVideo, S> {
    SyncDriver::new(LoopbackCpu::default(), ScanningVideo::default(), store, &config())
}

fn passes<S: TapeStore>(driver: &mut SyncDriver<LoopbackCpu, ScanningVideo, S>, n: u32) {
    for _ in 0..n {
        driver.sync_clock().unwrap();
    }
}

fn run_tape<S: TapeStore>(driver: &mut SyncDriver<LoopbackCpu, ScanningVideo, S>) {
    let mut passes = 0;
    while driver.tape_player().is_playing() {
        driver.sync_clock().unwrap();
        passes += 1;
        assert!(passes < 1_000_000);
    }
    driver.sync_clock().unwrap();
}

#[test]
fn sync_driver_loops_tape_back() {
    let data: Vec<u8> = (0..=255u8).cycle().take(600).collect();
    for &baud in &[Baud::B300, Baud::B1200] {
        let mut driver = new_driver(MemoryTapeStore::default());
        driver.tape_pipe(Cursor::new(&data), baud).unwrap();
        run_tape(&mut driver);
        assert_eq!(vec![TapeEvent::StreamBlock { length: 256 },
                        TapeEvent::StreamBlock { length: 256 },
                        TapeEvent::StreamBlock { length: 88 }], driver.take_tape_events());
        assert!(driver.take_tape_events().is_empty());
        assert_eq!(data, driver.tape_decoder().store().stream);
        assert_eq!(0, driver.tape_decoder().stats().protocol_resets);
        assert_eq!(driver.clock().cycles(), driver.cpu().executed);
    }
}

#[test]
fn sync_driver_completes_passes_on_store_errors() {
    struct BrokenStore;
    impl TapeStore for BrokenStore {
        fn store_stream_block(&mut self, _data: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }
        fn store_file(&mut self, _header: &TapeHeader, _data: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }
    }
    let mut config = config();
    config.throttle.enabled = true;
    let mut driver = SyncDriver::new(LoopbackCpu::default(), ScanningVideo::default(), BrokenStore, &config);
    // the debt is accounted while paused but never waited for
    driver.throttle().set_paused(true);
    driver.tape_pipe(Cursor::new(vec![0x55u8; 300]), Baud::B1200).unwrap();
    let mut passes = 0;
    let mut errors = 0;
    while driver.tape_player().is_playing() {
        match driver.sync_clock() {
            Ok(_) => {}
            Err(SyncError::Io(e)) => {
                assert_eq!("disk full", e.to_string());
                errors += 1;
            }
            Err(e) => panic!("unexpected error: {}", e)
        }
        passes += 1;
        assert_eq!(driver.clock().cycles(), driver.video().cycles);
        assert_eq!(-(driver.clock().cycles() as i64), driver.throttle().debt());
    }
    assert!(errors >= 1);
    assert_eq!(passes, driver.video().frames.len());
    assert!(driver.take_tape_events().is_empty());
}

#[test]
fn sync_driver_saves_files() {
    let dir = env::temp_dir().join(format!("beerusty-sync-{}", process::id()));
    let mut driver = new_driver(FsTapeStore::new(&dir));
    let data = b"10 PRINT \"HELLO\"\r20 GOTO 10\r".to_vec();
    let header = TapeHeader::default().with_name("HELLO").with_type(b'B').with_fast(true);
    driver.tape_load(header, Cursor::new(&data)).unwrap();
    run_tape(&mut driver);
    let header = header.with_size(data.len() as u16);
    assert_eq!(vec![TapeEvent::FileSaved { header }], driver.take_tape_events());
    assert_eq!(data, fs::read(dir.join("HELLO.bas")).unwrap());
    assert_eq!(header.to_string(), fs::read_to_string(dir.join("HELLO.mtd")).unwrap());
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn sync_driver_inverts_shift() {
    let mut driver = new_driver(NullTapeStore);
    driver.key_event(HostKey::Shift, true);
    passes(&mut driver, 25);
    driver.key_event(AmbiguousKey::N2.into(), true);
    passes(&mut driver, 25);
    driver.key_event(HostKey::Shift, false);
    passes(&mut driver, 25);
    driver.key_event(AmbiguousKey::N2.into(), false);
    passes(&mut driver, 100);

    let frames = &driver.video().frames;
    assert_eq!(175, frames.len());
    assert!(frames[..25].iter().all(|&keys| keys == MbKeyboardMap::SHIFT));
    assert!(frames.iter().all(|keys| !keys.contains(MbKeyboardMap::N2)));
    assert!(frames.iter().all(|keys| !keys.contains(MbKeyboardMap::AT|MbKeyboardMap::SHIFT)));
    let presses = frames.windows(2)
                        .filter(|w| !w[0].contains(MbKeyboardMap::AT) && w[1].contains(MbKeyboardMap::AT))
                        .count();
    assert_eq!(1, presses);
    assert_eq!(MbKeyboardMap::AT, frames[25]);
    assert_eq!(MbKeyboardMap::empty(), *frames.last().unwrap());
    assert!(!driver.keyboard().shift_inversion().is_active());
}

#[test]
fn sync_driver_types_and_power_cycles() {
    let mut driver = new_driver(NullTapeStore);
    driver.key_file(Cursor::new(b"Go\r".to_vec()));
    driver.run_for(200 * 33_750).unwrap();
    assert!(!driver.is_typing());
    let typed: Vec<MbKeyboardMap> = driver.video().frames.windows(2)
                        .map(|w| w[1] - w[0])
                        .filter(|keys| !keys.is_empty())
                        .collect();
    assert_eq!(vec![MbKeyboardMap::G|MbKeyboardMap::SHIFT, MbKeyboardMap::O, MbKeyboardMap::CR], typed);

    driver.key_file(Cursor::new(b"endless".to_vec()));
    driver.run_for(33_750).unwrap();
    assert!(driver.is_typing());
    driver.power_cycle();
    assert!(!driver.is_typing());
    assert_eq!(0, driver.clock().cycles());
    assert!(driver.video().frames.is_empty());
    assert_eq!(MbKeyboardMap::empty(), driver.keyboard().latched_keys());
}
