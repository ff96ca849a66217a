// Flash orchestrator. Composes session operations into the full read and
// full write workflows, including the erased-state retry policy, and
// offers a background worker thread so a frontend never blocks on the
// bus.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::FlashError;
use crate::image::{BinImage, BIN_SIZE};
use crate::session::{EcuSession, LogLevel};

// ── Flash geometry ───────────────────────────────────────────────────────

/// AMD 29F010 bank bytes for the HC11 bank-switched window.
pub const BANK_72: u8 = 0x48; // sectors 0-3 (lower 64KB)
pub const BANK_88: u8 = 0x58; // sectors 4-5 (middle 32KB)
pub const BANK_80: u8 = 0x50; // sectors 6-7 (upper 32KB)

/// Sector base offsets within each bank window.
pub const SECTOR_OFFSETS: [(u8, u8); 8] = [
    (BANK_72, 0x20),
    (BANK_72, 0x40), // calibration area
    (BANK_72, 0x80),
    (BANK_72, 0xC0),
    (BANK_88, 0x80),
    (BANK_88, 0xC0),
    (BANK_80, 0x80),
    (BANK_80, 0xC0),
];

/// Bank descriptors for the write loop:
/// (bank byte, file start, file end, pcm base offset).
/// PCM address = file offset − base offset; the per-bank setup frame
/// selects which physical bank sits in the $8000 window.
pub const BANK_WRITE_MAP: &[(u8, usize, usize, usize)] = &[
    (BANK_72, 0x0000, 0xFFFF, 0),
    (BANK_88, 0x10000, 0x17FFF, 0x8000),
    (BANK_80, 0x18000, 0x1FFFF, 0x10000),
];

const ERASE_MAP_CAL: &[(u8, u8)] = &[SECTOR_OFFSETS[1]];

const ERASE_MAP_BIN: &[(u8, u8)] = &[
    SECTOR_OFFSETS[0],
    SECTOR_OFFSETS[1],
    SECTOR_OFFSETS[2],
    SECTOR_OFFSETS[3],
    SECTOR_OFFSETS[4],
    SECTOR_OFFSETS[5],
    SECTOR_OFFSETS[6],
];

const ERASE_MAP_PROM: &[(u8, u8)] = &SECTOR_OFFSETS;

/// How much of the image a write touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Calibration only: $4000-$7FFF, sector 1.
    Cal,
    /// OS + calibration: $2000-$1BFFF, sectors 0-6 (boot sector kept).
    Bin,
    /// Full recovery: $2000-$1FFFF, all 8 sectors.
    Prom,
}

impl WriteMode {
    /// Inclusive file-offset range written in this mode.
    pub fn write_range(&self) -> (usize, usize) {
        match self {
            WriteMode::Cal => (0x4000, 0x7FFF),
            WriteMode::Bin => (0x2000, 0x1BFFF),
            WriteMode::Prom => (0x2000, 0x1FFFF),
        }
    }

    pub fn erase_map(&self) -> &'static [(u8, u8)] {
        match self {
            WriteMode::Cal => ERASE_MAP_CAL,
            WriteMode::Bin => ERASE_MAP_BIN,
            WriteMode::Prom => ERASE_MAP_PROM,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            WriteMode::Cal => "CAL",
            WriteMode::Bin => "BIN",
            WriteMode::Prom => "PROM",
        }
    }
}

// ── Workflows ────────────────────────────────────────────────────────────

/// Bytes per Mode 2 block during a full read.
const READ_BLOCK: usize = 64;

/// A failed write onto erased flash leaves the ECU unbootable, so the
/// whole erase+write pass is retried before giving up.
const MAX_WRITE_ATTEMPTS: u32 = 3;

pub struct FlashOp {
    session: Arc<EcuSession>,
}

impl FlashOp {
    pub fn new(session: Arc<EcuSession>) -> Self {
        Self { session }
    }

    fn log(&self, level: LogLevel, msg: &str) {
        self.session.emit_log(level, msg);
    }

    /// Read the full 128 KiB image out of the ECU.
    pub fn full_read(&self) -> Result<BinImage, FlashError> {
        let result = self.read_sequence();
        if result.is_err() {
            // never leave the bus silenced on a failure exit
            let _ = self.session.enable_chatter();
        }
        result
    }

    fn read_sequence(&self) -> Result<BinImage, FlashError> {
        self.log(LogLevel::Info, "═══ FULL READ STARTED ═══");
        let started = Instant::now();

        self.session.disable_chatter()?;
        self.session.unlock_security()?;
        self.session.enter_programming()?;
        self.session.upload_kernel()?;
        let _ = self.session.read_flash_info();

        // The kernel handles bank switching internally from the 24-bit
        // address, so the read is a flat sweep of the file space.
        let mut buf = vec![0u8; BIN_SIZE];
        let total_reads = BIN_SIZE / READ_BLOCK;
        let mut reads_done = 0usize;
        let mut address = 0usize;

        while address < BIN_SIZE {
            if self.session.cancelled() {
                let _ = self.session.cleanup_and_reset();
                return Err(FlashError::Cancelled);
            }

            match self.session.read_ram(address as u32, true) {
                Ok(data) => {
                    let end = (address + data.len()).min(BIN_SIZE);
                    buf[address..end].copy_from_slice(&data[..end - address]);
                    address += data.len();
                    reads_done += 1;
                    self.session.emit_progress(reads_done, total_reads, "Reading");
                }
                Err(e) => {
                    self.log(LogLevel::Error, &format!("read failed at ${address:05X}: {e}"));
                    address += READ_BLOCK;
                }
            }
        }

        self.session.cleanup_and_reset()?;
        self.session.enable_chatter()?;

        let elapsed = started.elapsed().as_secs_f64();
        self.log(LogLevel::Info, &format!("═══ READ COMPLETE ({elapsed:.1}s) ═══"));
        BinImage::from_bytes(buf, false)
    }

    /// Flash an image to the ECU. The image checksum is fixed in memory
    /// first when auto-fix is enabled, otherwise a bad checksum aborts
    /// before anything touches the bus.
    pub fn full_write(&self, image: &mut BinImage, mode: WriteMode) -> Result<(), FlashError> {
        let result = self.write_sequence(image, mode);
        if result.is_err() {
            let _ = self.session.enable_chatter();
        }
        result
    }

    fn write_sequence(&self, image: &mut BinImage, mode: WriteMode) -> Result<(), FlashError> {
        let (start, end) = mode.write_range();
        let erase_map = mode.erase_map();

        self.log(LogLevel::Info, &format!("═══ {} WRITE STARTED ═══", mode.label()));
        self.log(
            LogLevel::Info,
            &format!("  range ${start:05X}-${end:05X} ({} bytes), {} sectors to erase",
                end - start + 1,
                erase_map.len()),
        );
        let started = Instant::now();

        if !image.verify_checksum() {
            if self.session.config().auto_checksum_fix {
                let (old, new) = image.fix_checksum();
                self.log(
                    LogLevel::Warning,
                    &format!("auto-fixed checksum: 0x{old:04X} → 0x{new:04X}"),
                );
            } else {
                self.log(LogLevel::Error, "checksum mismatch in bin file");
                return Err(FlashError::ChecksumMismatch {
                    expected: image.stored_checksum(),
                    actual: image.compute_checksum(),
                });
            }
        }

        self.session.disable_chatter()?;
        self.session.unlock_security()?;
        self.session.enter_programming()?;
        self.session.upload_kernel()?;
        let _ = self.session.read_flash_info();

        // Erase+write with the bricked-ECU guard: once a sector is
        // erased, retrying the whole pass is strictly safer than
        // stopping half-written.
        let mut attempt = 0u32;
        loop {
            attempt += 1;

            if let Err(e) = self.session.erase_sectors(erase_map) {
                self.log(LogLevel::Error, "ERASE FAILED — PCM may be left in erased state!");
                return Err(e);
            }

            match self.session.write_flash_data(image.bytes(), start, end) {
                Ok(()) => break,
                Err(FlashError::Cancelled) => return Err(FlashError::Cancelled),
                Err(e) if attempt >= MAX_WRITE_ATTEMPTS => {
                    self.log(
                        LogLevel::Error,
                        "WRITE FAILED after all retries. ECU may need bench recovery.",
                    );
                    return Err(e);
                }
                Err(e) => {
                    self.log(
                        LogLevel::Error,
                        &format!(
                            "WRITE FAILED (attempt {attempt}/{MAX_WRITE_ATTEMPTS}): {e} — retrying to prevent a bricked ECU"
                        ),
                    );
                }
            }
        }

        self.session.verify_checksum(image)?;
        self.session.cleanup_and_reset()?;
        self.session.enable_chatter()?;

        let elapsed = started.elapsed().as_secs_f64();
        self.log(
            LogLevel::Info,
            &format!("═══ {} WRITE COMPLETE ({elapsed:.1}s) ═══", mode.label()),
        );
        Ok(())
    }
}

// ── Background worker ────────────────────────────────────────────────────

/// Commands sent from a frontend to the flash worker thread.
pub enum FlashCmd {
    Read,
    Write { image: BinImage, mode: WriteMode },
    Quit,
}

/// Results sent back from the worker.
pub enum FlashEvent {
    ReadDone(BinImage),
    WriteDone,
    Failed(FlashError),
}

/// Spawn the flash worker thread. Commands go in, results come out;
/// cancel mid-operation via `session.cancel()` from any thread.
pub fn spawn_flasher(session: Arc<EcuSession>) -> (Sender<FlashCmd>, Receiver<FlashEvent>) {
    let (cmd_tx, cmd_rx) = bounded::<FlashCmd>(4);
    let (event_tx, event_rx) = bounded::<FlashEvent>(4);

    thread::Builder::new()
        .name("flash-worker".into())
        .spawn(move || {
            let op = FlashOp::new(session);
            for cmd in cmd_rx {
                let event = match cmd {
                    FlashCmd::Read => match op.full_read() {
                        Ok(image) => FlashEvent::ReadDone(image),
                        Err(e) => FlashEvent::Failed(e),
                    },
                    FlashCmd::Write { mut image, mode } => match op.full_write(&mut image, mode) {
                        Ok(()) => FlashEvent::WriteDone,
                        Err(e) => FlashEvent::Failed(e),
                    },
                    FlashCmd::Quit => break,
                };
                if event_tx.send(event).is_err() {
                    break;
                }
            }
            log::info!("flash worker exiting");
        })
        .expect("failed to spawn flash worker");

    (cmd_tx, event_rx)
}
