// ECU session engine. Owns the transport and the session state machine,
// runs the transaction loop (silence arbitration → transmit → echo →
// receive → retry), and exposes the high-level ALDL operations the flash
// orchestrator, datalogger and live tuner compose.
//
// All operations are synchronous; callers on worker threads are
// serialised by the internal mutex over transport + state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use crate::aldl::{self, Frame};
use crate::config::CommConfig;
use crate::error::FlashError;
use crate::flash::BANK_WRITE_MAP;
use crate::image::BinImage;
use crate::kernel;
use crate::params;
use crate::transport::Transport;

// ── Timeouts (ms) ────────────────────────────────────────────────────────

pub const ECHO_DETECT_TIMEOUT_MS: u64 = 500;
pub const HEARTBEAT_TIMEOUT_MS: u64 = 3000;
pub const MODE5_TIMEOUT_MS: u64 = 5000;
pub const MODE6_UPLOAD_TIMEOUT_MS: u64 = 10000;
pub const ERASE_TIMEOUT_MS: u64 = 30000;
pub const WRITE_FRAME_TIMEOUT_MS: u64 = 5000;
pub const CHECKSUM_TIMEOUT_MS: u64 = 30000;
pub const CLEANUP_DELAY_MS: u64 = 750;

const RETRY_DELAY_MS: u64 = 50;

// ── Session state & sinks ────────────────────────────────────────────────

/// Communication state machine. Transitions happen only on successful
/// operations; unrecoverable transport failures land in `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    Silenced,
    Unlocked,
    Programming,
    KernelLoaded,
    Flashing,
    Datalog,
    LiveTune,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// User-visible log events from the engine.
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, msg: &str);
}

/// Progress events for bounded loops (kernel upload, erase, write, read).
pub trait ProgressSink: Send + Sync {
    fn progress(&self, current: usize, total: usize, label: &str);
}

/// Forwards engine events to the log crate.
pub struct LogCrateSink;

impl LogSink for LogCrateSink {
    fn log(&self, level: LogLevel, msg: &str) {
        match level {
            LogLevel::Info => log::info!("{msg}"),
            LogLevel::Warning => log::warn!("{msg}"),
            LogLevel::Error => log::error!("{msg}"),
        }
    }
}

pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn progress(&self, _current: usize, _total: usize, _label: &str) {}
}

// ── Session ──────────────────────────────────────────────────────────────

struct SessionInner {
    transport: Box<dyn Transport>,
    config: CommConfig,
    state: SessionState,
}

pub struct EcuSession {
    inner: Mutex<SessionInner>,
    cancel: AtomicBool,
    log_sink: Box<dyn LogSink>,
    progress_sink: Box<dyn ProgressSink>,
}

impl EcuSession {
    pub fn new(transport: Box<dyn Transport>, config: CommConfig) -> Self {
        Self::with_sinks(transport, config, Box::new(LogCrateSink), Box::new(NullProgressSink))
    }

    pub fn with_sinks(
        transport: Box<dyn Transport>,
        config: CommConfig,
        log_sink: Box<dyn LogSink>,
        progress_sink: Box<dyn ProgressSink>,
    ) -> Self {
        Self {
            inner: Mutex::new(SessionInner {
                transport,
                config,
                state: SessionState::Disconnected,
            }),
            cancel: AtomicBool::new(false),
            log_sink,
            progress_sink,
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().unwrap().state
    }

    pub fn config(&self) -> CommConfig {
        self.inner.lock().unwrap().config.clone()
    }

    /// Adjust configuration between operations.
    pub fn configure(&self, f: impl FnOnce(&mut CommConfig)) {
        f(&mut self.inner.lock().unwrap().config);
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.inner.lock().unwrap().state = state;
    }

    // ── Cancellation ─────────────────────────────────────────────────────

    /// Request cancellation; observed at the next loop boundary.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.log(LogLevel::Warning, "operation cancelled by user");
    }

    pub fn reset_cancel(&self) {
        self.cancel.store(false, Ordering::SeqCst);
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    // ── Event emission ───────────────────────────────────────────────────

    fn log(&self, level: LogLevel, msg: &str) {
        self.log_sink.log(level, msg);
    }

    fn progress(&self, current: usize, total: usize, label: &str) {
        self.progress_sink.progress(current, total, label);
    }

    pub(crate) fn emit_log(&self, level: LogLevel, msg: &str) {
        self.log(level, msg);
    }

    pub(crate) fn emit_progress(&self, current: usize, total: usize, label: &str) {
        self.progress(current, total, label);
    }

    // ── Low-level frame I/O ──────────────────────────────────────────────

    /// Wait for bus silence: flush input, sleep a poll interval, succeed
    /// once nothing new has arrived. Gives up after the response deadline.
    fn wait_silence(&self, inner: &mut SessionInner) -> Result<(), FlashError> {
        let deadline = Instant::now() + Duration::from_millis(inner.config.timeout_ms);
        loop {
            if self.cancelled() {
                return Err(FlashError::Cancelled);
            }
            inner.transport.flush_input();
            thread::sleep(Duration::from_millis(inner.config.silence_poll_ms));
            if inner.transport.bytes_available() == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                self.log(LogLevel::Warning, "bus congestion — could not get a clear slot");
                return Err(FlashError::FrameTimeout);
            }
        }
    }

    /// Transmit one frame: silence arbitration, inter-frame delay, write,
    /// then consume our own echo if the cable loops back.
    fn tx_frame(&self, inner: &mut SessionInner, frame: &Frame) -> Result<(), FlashError> {
        let wire_len = aldl::wire_length(frame);
        log::debug!("TX [{}]: {}", wire_len, hex(&frame[..wire_len]));

        self.wait_silence(inner)?;
        thread::sleep(Duration::from_millis(inner.config.inter_frame_delay_ms));

        inner.transport.flush_input();
        inner.transport.write(&frame[..wire_len])?;

        if inner.config.ignore_echo {
            inner.config.echo_byte_count = wire_len;
            let echo = inner
                .transport
                .read(wire_len, Duration::from_millis(ECHO_DETECT_TIMEOUT_MS))?;
            log::debug!("echo consumed [{}]", echo.len());
        }
        Ok(())
    }

    /// Receive one frame: device byte, length byte, body, checksum.
    fn rx_frame(&self, inner: &mut SessionInner, timeout: Duration) -> Result<Frame, FlashError> {
        let deadline = Instant::now() + timeout;

        let header = inner.transport.read(1, timeout)?;
        if header.is_empty() {
            return Err(FlashError::FrameTimeout);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let len_raw = inner.transport.read(1, remaining)?;
        if len_raw.is_empty() {
            return Err(FlashError::FrameTimeout);
        }

        let length_byte = len_raw[0];
        if length_byte < 0x55 {
            return Err(FlashError::FrameMalformed(format!(
                "invalid length byte 0x{length_byte:02X}"
            )));
        }
        let body_len = length_byte as usize - 82 - 2;
        if body_len == 0 || body_len > 200 {
            return Err(FlashError::FrameMalformed(format!("invalid frame length {body_len}")));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let body = inner.transport.read(body_len, remaining)?;
        if body.len() < body_len {
            return Err(FlashError::FrameMalformed(format!(
                "incomplete frame: expected {body_len} body bytes, got {}",
                body.len()
            )));
        }

        let mut frame = [0u8; aldl::FRAME_BUF_LEN];
        frame[0] = header[0];
        frame[1] = length_byte;
        frame[2..2 + body.len()].copy_from_slice(&body);

        if !aldl::verify_checksum(&frame) {
            return Err(FlashError::FrameMalformed(format!(
                "bad checksum on {}",
                hex(&frame[..aldl::wire_length(&frame)])
            )));
        }

        log::debug!("RX [{}]: {}", aldl::wire_length(&frame), hex(&frame[..aldl::wire_length(&frame)]));
        Ok(frame)
    }

    /// Send a frame and wait for its response, retrying wire-level
    /// failures. Transport faults are terminal and park the session in
    /// the Error state.
    fn transact(
        &self,
        inner: &mut SessionInner,
        frame: &Frame,
        timeout: Duration,
        retries: u32,
    ) -> Result<Frame, FlashError> {
        let mut last_err = FlashError::FrameTimeout;

        for attempt in 0..=retries {
            if self.cancelled() {
                return Err(FlashError::Cancelled);
            }

            if let Err(e) = self.tx_frame(inner, frame) {
                match e {
                    FlashError::Cancelled => return Err(e),
                    FlashError::TransportNotOpen | FlashError::TransportIo(_) => {
                        inner.state = SessionState::Error;
                        return Err(e);
                    }
                    _ => {
                        last_err = e;
                        thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
                        continue;
                    }
                }
            }

            match self.rx_frame(inner, timeout) {
                Ok(resp) => return Ok(resp),
                Err(e) => match e {
                    FlashError::TransportNotOpen | FlashError::TransportIo(_) => {
                        inner.state = SessionState::Error;
                        return Err(e);
                    }
                    _ => {
                        self.log(
                            LogLevel::Warning,
                            &format!("no response, retry {}/{retries}", attempt + 1),
                        );
                        last_err = e;
                        thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
                    }
                },
            }
        }

        self.log(LogLevel::Error, &format!("transaction failed after {retries} retries"));
        Err(last_err)
    }

    // ── Connection ───────────────────────────────────────────────────────

    /// Open the transport, listen for the ECM heartbeat and probe the
    /// cable for echo.
    pub fn connect(&self) -> Result<(), FlashError> {
        let mut inner = self.inner.lock().unwrap();
        if let Err(e) = inner.transport.open() {
            inner.state = SessionState::Error;
            self.log(LogLevel::Error, &format!("{e}"));
            return Err(e);
        }
        inner.state = SessionState::Connected;
        self.log(LogLevel::Info, "transport connected");

        self.heartbeat_inner(&mut inner);
        self.echo_probe_inner(&mut inner);
        Ok(())
    }

    pub fn disconnect(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.transport.close();
        inner.state = SessionState::Disconnected;
    }

    /// Listen passively for a byte matching the device id. Absence is
    /// only a warning; some ECUs stay quiet until spoken to.
    pub fn detect_heartbeat(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        self.heartbeat_inner(&mut inner)
    }

    fn heartbeat_inner(&self, inner: &mut SessionInner) -> bool {
        self.log(LogLevel::Info, "listening for ECM heartbeat...");
        let device_id = inner.config.device_id;
        let deadline = Instant::now() + Duration::from_millis(HEARTBEAT_TIMEOUT_MS);

        while Instant::now() < deadline {
            let data = inner
                .transport
                .read(1, Duration::from_millis(ECHO_DETECT_TIMEOUT_MS))
                .unwrap_or_default();
            match data.first() {
                Some(&b) if b == device_id => {
                    self.log(LogLevel::Info, &format!("heartbeat detected (0x{b:02X})"));
                    inner.transport.flush_input();
                    return true;
                }
                Some(_) => {}
                None => thread::sleep(Duration::from_millis(RETRY_DELAY_MS)),
            }
        }
        self.log(LogLevel::Warning, "no heartbeat detected (ECU may be off)");
        false
    }

    /// Write two probe bytes and see whether they come straight back:
    /// some ALDL cables loop TX onto RX.
    pub fn detect_echo(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        self.echo_probe_inner(&mut inner)
    }

    fn echo_probe_inner(&self, inner: &mut SessionInner) -> bool {
        inner.transport.flush_input();
        let probe = [0xFF, 0x55];
        if inner.transport.write(&probe).is_err() {
            return false;
        }
        thread::sleep(Duration::from_millis(100));
        let response = inner
            .transport
            .read(2, Duration::from_millis(ECHO_DETECT_TIMEOUT_MS))
            .unwrap_or_default();

        if response == probe {
            inner.config.ignore_echo = true;
            inner.config.echo_byte_count = 2;
            self.log(LogLevel::Info, "echo detected — will consume echo bytes");
            true
        } else {
            inner.config.ignore_echo = false;
            inner.config.echo_byte_count = 0;
            self.log(LogLevel::Info, "no echo detected");
            false
        }
    }

    // ── High-level operations ────────────────────────────────────────────

    /// Mode 8 to the BCM (best-effort) and the ECM: suppress bus chatter.
    pub fn disable_chatter(&self) -> Result<(), FlashError> {
        let mut inner = self.inner.lock().unwrap();

        if inner.config.bcm_device_id != 0 {
            let frame = aldl::build_silence_frame(inner.config.bcm_device_id);
            let _ = self.transact(&mut inner, &frame, Duration::from_millis(1000), 2);
        }

        let frame = aldl::build_silence_frame(inner.config.device_id);
        let resp = self.transact(&mut inner, &frame, Duration::from_millis(2000), 5)?;
        if resp[2] == aldl::mode::SILENCE {
            inner.state = SessionState::Silenced;
            self.log(LogLevel::Info, "bus chatter disabled");
            Ok(())
        } else {
            self.log(LogLevel::Error, "failed to disable chatter");
            Err(FlashError::ResponseMismatch { mode: resp[2], result: resp[3] })
        }
    }

    /// Mode 9: re-enable chatter. Best-effort; the ECM may answer with
    /// anything or nothing once it starts broadcasting again.
    pub fn enable_chatter(&self) -> Result<(), FlashError> {
        let mut inner = self.inner.lock().unwrap();
        let frame = aldl::build_unsilence_frame(inner.config.device_id);
        let _ = self.transact(&mut inner, &frame, Duration::from_millis(2000), 3);
        inner.state = SessionState::Connected;
        self.log(LogLevel::Info, "bus chatter re-enabled");
        Ok(())
    }

    /// Mode 13 seed/key handshake. A zero seed means already unlocked.
    pub fn unlock_security(&self) -> Result<(), FlashError> {
        let mut inner = self.inner.lock().unwrap();
        let retries = inner.config.max_retries;
        self.log(LogLevel::Info, "requesting security seed...");

        let frame = aldl::build_seed_request(inner.config.device_id);
        let resp = self.transact(&mut inner, &frame, Duration::from_millis(3000), retries)?;

        let (seed_hi, seed_lo) = (resp[4], resp[5]);
        log::debug!("seed received: 0x{seed_hi:02X} 0x{seed_lo:02X}");

        if seed_hi == 0 && seed_lo == 0 {
            inner.state = SessionState::Unlocked;
            self.log(LogLevel::Info, "already unlocked (seed=0)");
            return Ok(());
        }

        let key = aldl::compute_seed_key(seed_hi, seed_lo);
        self.log(LogLevel::Info, &format!("key computed: 0x{key:04X}"));

        let frame = aldl::build_key_response(inner.config.device_id, key);
        let resp = self.transact(&mut inner, &frame, Duration::from_millis(3000), retries)?;

        if resp[4] == 0xAA {
            inner.state = SessionState::Unlocked;
            self.log(LogLevel::Info, "security unlocked");
            Ok(())
        } else {
            self.log(LogLevel::Error, &format!("key rejected (result=0x{:02X})", resp[4]));
            Err(FlashError::ProtocolDenied(resp[4]))
        }
    }

    /// Mode 5: enter programming mode.
    pub fn enter_programming(&self) -> Result<(), FlashError> {
        let mut inner = self.inner.lock().unwrap();
        let retries = inner.config.max_retries;
        self.log(LogLevel::Info, "entering programming mode...");

        let frame = aldl::build_mode5_request(inner.config.device_id);
        let resp =
            self.transact(&mut inner, &frame, Duration::from_millis(MODE5_TIMEOUT_MS), retries)?;

        if resp[3] == 0xAA {
            inner.state = SessionState::Programming;
            self.log(LogLevel::Info, "programming mode active");
            Ok(())
        } else {
            self.log(LogLevel::Error, "Mode 5 denied — vehicle may be moving");
            Err(FlashError::ProtocolDenied(resp[3]))
        }
    }

    /// Mode 6: upload the three kernel blocks into ECU RAM.
    pub fn upload_kernel(&self) -> Result<(), FlashError> {
        let mut inner = self.inner.lock().unwrap();
        let retries = inner.config.max_retries;
        self.log(LogLevel::Info, "uploading flash kernel...");

        let blocks = kernel::exec_blocks(inner.config.high_speed_read);
        for (i, block) in blocks.iter().enumerate() {
            if self.cancelled() {
                return Err(FlashError::Cancelled);
            }
            self.progress(i, blocks.len(), "Uploading kernel");

            let frame = aldl::build_blob_frame(block);
            let resp = self.transact(
                &mut inner,
                &frame,
                Duration::from_millis(MODE6_UPLOAD_TIMEOUT_MS),
                retries,
            )?;
            if resp[3] != 0xAA {
                self.log(LogLevel::Error, &format!("kernel block {i} upload failed"));
                return Err(FlashError::ProtocolDenied(resp[3]));
            }
        }

        inner.state = SessionState::KernelLoaded;
        self.log(LogLevel::Info, "flash kernel uploaded and running");
        Ok(())
    }

    /// Ask the kernel for the flash chip (manufacturer, device) bytes.
    pub fn read_flash_info(&self) -> Result<(u8, u8), FlashError> {
        let mut inner = self.inner.lock().unwrap();
        let retries = inner.config.max_retries;
        self.log(LogLevel::Info, "reading flash chip info...");

        let frame = aldl::build_blob_frame(&kernel::FLASH_INFO);
        let resp = self.transact(
            &mut inner,
            &frame,
            Duration::from_millis(MODE6_UPLOAD_TIMEOUT_MS),
            retries,
        )?;

        let (manuf, device) = (resp[3], resp[4]);
        let name = match (manuf, device) {
            (0x01, 0x20) => "AMD 29F010 (128KB)",
            (0x01, 0xA4) => "AMD 29F040 (512KB)",
            (0x31, 0xB4) => "CAT28F010 (128KB)",
            _ => "unknown flash chip",
        };
        self.log(
            LogLevel::Info,
            &format!("flash chip: manufacturer=0x{manuf:02X} device=0x{device:02X} — {name}"),
        );
        Ok((manuf, device))
    }

    /// Erase the given (bank, sector) list through the kernel.
    pub fn erase_sectors(&self, erase_map: &[(u8, u8)]) -> Result<(), FlashError> {
        let mut inner = self.inner.lock().unwrap();
        let total = erase_map.len();

        for (i, &(bank, sector)) in erase_map.iter().enumerate() {
            if self.cancelled() {
                return Err(FlashError::Cancelled);
            }
            self.log(
                LogLevel::Info,
                &format!("erasing sector {}/{total} (bank=0x{bank:02X}, sector=0x{sector:02X})...", i + 1),
            );
            self.progress(i, total, "Erasing");

            let frame = aldl::build_blob_frame(&kernel::erase_block(bank, sector));
            let resp =
                self.transact(&mut inner, &frame, Duration::from_millis(ERASE_TIMEOUT_MS), 3)?;
            if resp[3] != 0xAA {
                self.log(
                    LogLevel::Error,
                    &format!("erase sector {} failed (result=0x{:02X})", i + 1, resp[3]),
                );
                return Err(FlashError::ProtocolDenied(resp[3]));
            }
        }

        self.log(LogLevel::Info, &format!("all {total} sectors erased"));
        Ok(())
    }

    /// Stream `data[start..=end]` to flash through the kernel, bank by
    /// bank. File offsets are remapped into the ECU's bank window by
    /// subtracting each bank's base offset.
    pub fn write_flash_data(&self, data: &[u8], start: usize, end: usize) -> Result<(), FlashError> {
        let mut inner = self.inner.lock().unwrap();

        if !matches!(inner.state, SessionState::KernelLoaded | SessionState::Flashing) {
            return Err(FlashError::SafetyViolation(
                "flash write attempted before kernel upload".into(),
            ));
        }
        inner.state = SessionState::Flashing;

        let chunk_size = inner.config.write_chunk_size;
        let max_retries = inner.config.max_retries;
        let device_id = inner.config.device_id;
        let total_bytes = end - start + 1;
        let mut bytes_written = 0usize;
        let started = Instant::now();

        for &(bank, bank_start, bank_end, pcm_base) in BANK_WRITE_MAP {
            let w_start = start.max(bank_start);
            let w_end = end.min(bank_end);
            if w_start > w_end {
                continue;
            }

            self.log(
                LogLevel::Info,
                &format!("setting up write for bank 0x{bank:02X} (file ${w_start:05X}-${w_end:05X})..."),
            );
            let frame = aldl::build_blob_frame(&kernel::write_bank_block(bank));
            let resp = self.transact(
                &mut inner,
                &frame,
                Duration::from_millis(MODE6_UPLOAD_TIMEOUT_MS),
                max_retries,
            )?;
            if resp[3] != 0xAA {
                self.log(LogLevel::Error, &format!("write bank setup failed for 0x{bank:02X}"));
                return Err(FlashError::ProtocolDenied(resp[3]));
            }

            let mut file_addr = w_start;
            let mut chunk_retries = 0u32;
            while file_addr <= w_end {
                if self.cancelled() {
                    return Err(FlashError::Cancelled);
                }

                let chunk_end = (file_addr + chunk_size - 1).min(w_end);
                let chunk = &data[file_addr..=chunk_end];
                let pcm_addr = file_addr - pcm_base;

                let frame = aldl::build_write_frame(
                    device_id,
                    pcm_addr as u32,
                    chunk,
                    aldl::mode::FLASH_WRITE,
                    true,
                );

                let result =
                    self.transact(&mut inner, &frame, Duration::from_millis(WRITE_FRAME_TIMEOUT_MS), 1);
                let acked = match &result {
                    Ok(resp) => resp[3] == 0xAA,
                    Err(FlashError::Cancelled) => return Err(FlashError::Cancelled),
                    Err(_) => false,
                };

                if acked {
                    bytes_written += chunk.len();
                    chunk_retries = 0;
                    self.progress(
                        bytes_written,
                        total_bytes,
                        &format!("Writing ${file_addr:05X}→PCM ${pcm_addr:04X}"),
                    );
                    file_addr = chunk_end + 1;
                } else {
                    chunk_retries += 1;
                    self.log(
                        LogLevel::Warning,
                        &format!(
                            "write error at ${file_addr:05X} (PCM ${pcm_addr:04X}), retry {chunk_retries}/{max_retries}"
                        ),
                    );
                    if chunk_retries >= max_retries {
                        self.log(LogLevel::Error, "too many write retries — aborting");
                        return match result {
                            Ok(resp) => Err(FlashError::ProtocolDenied(resp[3])),
                            Err(e) => Err(e),
                        };
                    }
                }
            }
        }

        let elapsed = started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 { bytes_written as f64 / elapsed } else { 0.0 };
        self.log(
            LogLevel::Info,
            &format!("write complete: {bytes_written} bytes in {elapsed:.1}s ({rate:.0} B/s)"),
        );
        Ok(())
    }

    /// Run the on-device checksum verification and compare against the
    /// image we just wrote.
    pub fn verify_checksum(&self, image: &BinImage) -> Result<(), FlashError> {
        let mut inner = self.inner.lock().unwrap();
        let retries = inner.config.max_retries;
        self.log(LogLevel::Info, "running on-PCM checksum verification...");

        let frame = aldl::build_blob_frame(&kernel::CHECKSUM_VERIFY);
        let resp = self.transact(
            &mut inner,
            &frame,
            Duration::from_millis(CHECKSUM_TIMEOUT_MS),
            retries,
        )?;

        if resp[3] == 0xAA {
            self.log(LogLevel::Info, "checksum passed");
            Ok(())
        } else {
            let actual = ((resp[4] as u16) << 8) | resp[5] as u16;
            let expected = image.stored_checksum();
            self.log(
                LogLevel::Error,
                &format!("checksum FAILED — ECU=0x{actual:04X}, expected=0x{expected:04X}"),
            );
            Err(FlashError::ChecksumMismatch { expected, actual })
        }
    }

    /// Upload the cleanup routine and give the ECU time to reset.
    pub fn cleanup_and_reset(&self) -> Result<(), FlashError> {
        let mut inner = self.inner.lock().unwrap();
        self.log(LogLevel::Info, "resetting PCM...");

        let retries = inner.config.max_retries;
        let frame = aldl::build_blob_frame(&kernel::CLEANUP);
        let _ = self.transact(&mut inner, &frame, Duration::from_millis(5000), retries);
        thread::sleep(Duration::from_millis(CLEANUP_DELAY_MS));

        inner.state = SessionState::Connected;
        self.log(LogLevel::Info, "PCM reset complete");
        Ok(())
    }

    /// Request and decode one Mode 1 data-stream sample.
    pub fn request_mode1(
        &self,
        message: u8,
    ) -> Result<std::collections::HashMap<&'static str, f64>, FlashError> {
        let mut inner = self.inner.lock().unwrap();
        let frame = aldl::build_mode1_request(inner.config.device_id, message);
        let resp = self.transact(&mut inner, &frame, Duration::from_millis(1000), 2)?;

        let data_len = (resp[1] as usize).saturating_sub(85 + 1);
        if data_len == 0 || data_len > 100 {
            return Err(FlashError::FrameMalformed(format!("bad Mode 1 payload length {data_len}")));
        }
        Ok(params::decode_mode1(&resp[3..3 + data_len]))
    }

    /// Mode 2 read of RAM (16-bit address) or flash through the kernel
    /// (24-bit address).
    pub fn read_ram(&self, address: u32, extended: bool) -> Result<Vec<u8>, FlashError> {
        let mut inner = self.inner.lock().unwrap();
        let timeout = Duration::from_millis(inner.config.timeout_ms);
        let retries = inner.config.max_retries;
        let frame = aldl::build_mode2_read(inner.config.device_id, address, extended);
        let resp = self.transact(&mut inner, &frame, timeout, retries)?;

        let data_len = (resp[1] as usize).saturating_sub(85 + 1);
        if data_len == 0 {
            return Err(FlashError::FrameMalformed("empty Mode 2 response".into()));
        }
        Ok(resp[3..3 + data_len].to_vec())
    }

    /// Mode 10 write into the patched OS's cal RAM shadow. Used by the
    /// live tuner; the ack format is a bare response frame.
    pub fn write_cal_ram(&self, offset: u16, data: &[u8]) -> Result<(), FlashError> {
        let mut inner = self.inner.lock().unwrap();
        let frame = aldl::build_write_frame(
            inner.config.device_id,
            offset as u32,
            data,
            aldl::mode::WRITE_CAL,
            false,
        );
        self.transact(&mut inner, &frame, Duration::from_millis(500), 1)?;
        Ok(())
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::EcuSim;

    fn fast_config() -> CommConfig {
        CommConfig {
            ignore_echo: false,
            inter_frame_delay_ms: 0,
            silence_poll_ms: 0,
            ..CommConfig::default()
        }
    }

    fn sim_session() -> (EcuSim, EcuSession) {
        let _ = env_logger::builder().is_test(true).try_init();
        let sim = EcuSim::new();
        let mut handle = sim.clone();
        crate::transport::Transport::open(&mut handle).unwrap();
        let session = EcuSession::new(Box::new(handle), fast_config());
        session.set_state(SessionState::Connected);
        (sim, session)
    }

    #[test]
    fn test_connect_detects_heartbeat_and_no_echo() {
        let sim = EcuSim::new();
        sim.push_heartbeat();
        let session = EcuSession::new(Box::new(sim.clone()), fast_config());
        session.connect().unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert!(!session.config().ignore_echo);
    }

    #[test]
    fn test_disable_chatter_silences() {
        let (sim, session) = sim_session();
        session.disable_chatter().unwrap();
        assert_eq!(session.state(), SessionState::Silenced);
        assert!(sim.is_silenced());
    }

    #[test]
    fn test_unlock_security_one_round_trip() {
        let (sim, session) = sim_session();
        session.unlock_security().unwrap();
        assert_eq!(session.state(), SessionState::Unlocked);
        assert!(sim.is_unlocked());
    }

    #[test]
    fn test_unlock_zero_seed_short_circuits() {
        let (sim, session) = sim_session();
        sim.set_seed(0, 0);
        session.unlock_security().unwrap();
        assert_eq!(session.state(), SessionState::Unlocked);
        // no key frame was ever sent
        assert!(!sim.is_unlocked());
    }

    #[test]
    fn test_enter_programming() {
        let (_sim, session) = sim_session();
        session.enter_programming().unwrap();
        assert_eq!(session.state(), SessionState::Programming);
    }

    #[test]
    fn test_upload_kernel_sends_three_blocks() {
        let (sim, session) = sim_session();
        session.upload_kernel().unwrap();
        assert_eq!(session.state(), SessionState::KernelLoaded);
        let uploads: Vec<_> = sim
            .tx_frames()
            .iter()
            .filter(|f| f.len() > 2 && f[2] == aldl::mode::UPLOAD)
            .cloned()
            .collect();
        assert_eq!(uploads.len(), 3);
    }

    #[test]
    fn test_read_flash_info_identifies_chip() {
        let (_sim, session) = sim_session();
        assert_eq!(session.read_flash_info().unwrap(), (0x01, 0x20));
    }

    #[test]
    fn test_write_before_kernel_refused() {
        let (_sim, session) = sim_session();
        let data = vec![0u8; 0x8000];
        assert!(matches!(
            session.write_flash_data(&data, 0x4000, 0x7FFF),
            Err(FlashError::SafetyViolation(_))
        ));
    }

    #[test]
    fn test_request_mode1_decodes() {
        let (_sim, session) = sim_session();
        let sample = session.request_mode1(0).unwrap();
        assert_eq!(sample["RPM"], 800.0);
        assert_eq!(sample["ECT Temp"], 50.0);
    }

    #[test]
    fn test_read_ram_returns_block() {
        let (_sim, session) = sim_session();
        let block = session.read_ram(0x0000, true).unwrap();
        assert_eq!(block.len(), 64);
    }

    #[test]
    fn test_cancel_aborts_before_transaction() {
        let (_sim, session) = sim_session();
        session.cancel();
        assert!(matches!(session.unlock_security(), Err(FlashError::Cancelled)));
        session.reset_cancel();
        assert!(session.unlock_security().is_ok());
    }

    #[test]
    fn test_verify_checksum_failure_reports_both_sums() {
        let (sim, session) = sim_session();
        sim.set_fail_checksum(true);
        let mut img =
            BinImage::from_bytes(vec![0xFF; crate::image::BIN_SIZE], false).unwrap();
        img.fix_checksum();
        match session.verify_checksum(&img) {
            Err(FlashError::ChecksumMismatch { expected, actual }) => {
                assert_eq!(actual, 0xBEEF);
                assert_eq!(expected, img.stored_checksum());
            }
            other => panic!("expected a checksum mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_timeout_retries_then_fails() {
        // a session pointed at a closed transport fails terminally
        let sim = EcuSim::new();
        let session = EcuSession::new(Box::new(sim), fast_config());
        assert!(matches!(
            session.unlock_security(),
            Err(FlashError::TransportNotOpen)
        ));
        assert_eq!(session.state(), SessionState::Error);
    }
}
