// Continuous Mode 1 datalogger. Polls the sensor stream on a background
// thread at the session's natural rate and appends one row per sample to
// a row sink (CSV on disk, or anything else that speaks the trait).

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::FlashError;
use crate::session::{EcuSession, SessionState};

/// Default parameter subset logged per sample.
pub const DEFAULT_LOG_PARAMS: &[&str] = &[
    "RPM",
    "ECT Temp",
    "IAT Temp",
    "TPS %",
    "MAF",
    "Spark Advance",
    "Knock Retard",
    "AFR",
    "LH O2",
    "RH O2",
    "LH STFT",
    "RH STFT",
    "LH LTFT",
    "RH LTFT",
    "Battery V",
    "IAC Steps",
    "Inj PW",
    "Run Time",
];

/// Flush the sink at least this often.
const FLUSH_EVERY: usize = 10;

/// One decoded sample.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Wall-clock timestamp, HH:MM:SS.mmm.
    pub timestamp: String,
    /// Monotonic seconds since the log started, millisecond precision.
    pub elapsed_s: f64,
    pub values: HashMap<&'static str, f64>,
}

/// Where rows go. The contract is CSV-shaped but carries no file
/// assumptions; tests plug in an in-memory sink.
pub trait RowSink: Send {
    fn write_header(&mut self, columns: &[&'static str]);
    /// `values` is in column order; a missing parameter is None.
    fn write_row(&mut self, timestamp: &str, elapsed_s: f64, values: &[Option<f64>]);
    fn flush(&mut self);
    fn close(&mut self);
}

/// CSV file sink.
pub struct CsvSink {
    out: BufWriter<File>,
}

impl CsvSink {
    pub fn create(path: &Path) -> Result<Self, FlashError> {
        let file = File::create(path)?;
        Ok(Self { out: BufWriter::new(file) })
    }
}

impl RowSink for CsvSink {
    fn write_header(&mut self, columns: &[&'static str]) {
        let _ = writeln!(self.out, "Timestamp,Elapsed_s,{}", columns.join(","));
    }

    fn write_row(&mut self, timestamp: &str, elapsed_s: f64, values: &[Option<f64>]) {
        let cells: Vec<String> = values
            .iter()
            .map(|v| v.map(|x| x.to_string()).unwrap_or_default())
            .collect();
        let _ = writeln!(self.out, "{timestamp},{elapsed_s:.3},{}", cells.join(","));
    }

    fn flush(&mut self) {
        if let Err(e) = self.out.flush() {
            log::warn!("datalog flush failed: {e}");
        }
    }

    fn close(&mut self) {
        self.flush();
    }
}

pub struct DataLogger {
    session: Arc<EcuSession>,
    running: Arc<AtomicBool>,
    sample_count: Arc<AtomicUsize>,
    latest: Arc<Mutex<Option<Sample>>>,
    handle: Option<JoinHandle<()>>,
    started: Option<Instant>,
}

impl DataLogger {
    pub fn new(session: Arc<EcuSession>) -> Self {
        Self {
            session,
            running: Arc::new(AtomicBool::new(false)),
            sample_count: Arc::new(AtomicUsize::new(0)),
            latest: Arc::new(Mutex::new(None)),
            handle: None,
            started: None,
        }
    }

    /// Start logging on a background thread. A second start while
    /// running is a no-op.
    pub fn start(&mut self, mut sink: Box<dyn RowSink>, params: Option<Vec<&'static str>>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let params = params.unwrap_or_else(|| DEFAULT_LOG_PARAMS.to_vec());

        self.sample_count.store(0, Ordering::SeqCst);
        self.started = Some(Instant::now());
        self.session.set_state(SessionState::Datalog);

        let session = self.session.clone();
        let running = self.running.clone();
        let sample_count = self.sample_count.clone();
        let latest = self.latest.clone();

        let handle = thread::Builder::new()
            .name("datalog".into())
            .spawn(move || {
                sink.write_header(&params);
                let start = Instant::now();
                let mut count = 0usize;

                while running.load(Ordering::SeqCst) && !session.cancelled() {
                    match session.request_mode1(0) {
                        Ok(values) => {
                            count += 1;
                            sample_count.store(count, Ordering::SeqCst);

                            let elapsed_ms = start.elapsed().as_millis() as f64;
                            let sample = Sample {
                                timestamp: chrono::Local::now().format("%H:%M:%S%.3f").to_string(),
                                elapsed_s: elapsed_ms / 1000.0,
                                values,
                            };

                            let row: Vec<Option<f64>> =
                                params.iter().map(|p| sample.values.get(p).copied()).collect();
                            sink.write_row(&sample.timestamp, sample.elapsed_s, &row);
                            if count % FLUSH_EVERY == 0 {
                                sink.flush();
                            }

                            *latest.lock().unwrap() = Some(sample);
                        }
                        Err(_) => thread::sleep(Duration::from_millis(50)),
                    }
                }

                sink.close();
                log::info!("datalog thread exiting after {count} samples");
            })
            .expect("failed to spawn datalog thread");

        self.handle = Some(handle);
        self.session.emit_log(crate::session::LogLevel::Info, "datalog started");
    }

    /// Stop cooperatively; the loop exits at the next sample boundary.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.session.set_state(SessionState::Connected);

        let count = self.sample_count.load(Ordering::SeqCst);
        self.session.emit_log(
            crate::session::LogLevel::Info,
            &format!("datalog stopped: {count} samples in {:.1}s", self.elapsed_secs()),
        );
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The most recent decoded sample, observable while the loop runs.
    pub fn latest(&self) -> Option<Sample> {
        self.latest.lock().unwrap().clone()
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count.load(Ordering::SeqCst)
    }

    /// Samples per second since start.
    pub fn sample_rate(&self) -> f64 {
        let elapsed = self.elapsed_secs();
        if elapsed > 0.0 {
            self.sample_count() as f64 / elapsed
        } else {
            0.0
        }
    }

    fn elapsed_secs(&self) -> f64 {
        self.started.map(|t| t.elapsed().as_secs_f64()).unwrap_or(0.0)
    }
}

impl Drop for DataLogger {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommConfig;
    use crate::sim::EcuSim;
    use crate::transport::Transport;

    /// In-memory sink capturing everything written.
    #[derive(Clone, Default)]
    struct MemSink {
        lines: Arc<Mutex<Vec<String>>>,
        closed: Arc<AtomicBool>,
    }

    impl RowSink for MemSink {
        fn write_header(&mut self, columns: &[&'static str]) {
            self.lines.lock().unwrap().push(format!("header:{}", columns.join(",")));
        }

        fn write_row(&mut self, timestamp: &str, elapsed_s: f64, values: &[Option<f64>]) {
            let cells: Vec<String> =
                values.iter().map(|v| v.map(|x| x.to_string()).unwrap_or_default()).collect();
            self.lines
                .lock()
                .unwrap()
                .push(format!("{timestamp},{elapsed_s:.3},{}", cells.join(",")));
        }

        fn flush(&mut self) {}

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn sim_session() -> Arc<EcuSession> {
        let sim = EcuSim::new();
        let mut handle = sim.clone();
        handle.open().unwrap();
        let config = CommConfig {
            ignore_echo: false,
            inter_frame_delay_ms: 0,
            silence_poll_ms: 0,
            ..CommConfig::default()
        };
        let session = Arc::new(EcuSession::new(Box::new(handle), config));
        session.set_state(SessionState::Connected);
        session
    }

    #[test]
    fn test_logs_samples_and_closes_sink() {
        let session = sim_session();
        let mut logger = DataLogger::new(session.clone());
        let sink = MemSink::default();

        logger.start(Box::new(sink.clone()), None);
        assert_eq!(session.state(), SessionState::Datalog);

        // wait until a few samples landed
        let deadline = Instant::now() + Duration::from_secs(5);
        while logger.sample_count() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        logger.stop();

        assert!(logger.sample_count() >= 3);
        assert!(sink.closed.load(Ordering::SeqCst));
        assert_eq!(session.state(), SessionState::Connected);

        let lines = sink.lines.lock().unwrap();
        assert!(lines[0].starts_with("header:RPM,ECT Temp"));
        // the simulator reports 800 RPM in every sample
        assert!(lines[1].contains("800"));
    }

    #[test]
    fn test_latest_sample_observable() {
        let session = sim_session();
        let mut logger = DataLogger::new(session);
        logger.start(Box::new(MemSink::default()), Some(vec!["RPM", "Battery V"]));

        let deadline = Instant::now() + Duration::from_secs(5);
        while logger.latest().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        logger.stop();

        let sample = logger.latest().expect("a sample was captured");
        assert_eq!(sample.values["RPM"], 800.0);
        assert_eq!(sample.values["Battery V"], 14.0);
        assert!(sample.elapsed_s >= 0.0);
    }

    #[test]
    fn test_csv_sink_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        {
            let mut sink = CsvSink::create(&path).unwrap();
            sink.write_header(&["RPM", "AFR"]);
            sink.write_row("12:00:00.000", 0.1, &[Some(800.0), None]);
            sink.close();
        }
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("Timestamp,Elapsed_s,RPM,AFR\n"));
        assert!(content.contains("12:00:00.000,0.100,800,"));
    }
}
