// Live tuner. Keeps a RAM shadow of one calibration table, applies
// bounded cell edits, pushes coalesced runs of dirty cells to the ECU
// over Mode 10, and watches live telemetry for knock/temperature/RPM
// limits. Requires a patched OS with the RT write handler installed.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use crate::error::FlashError;
use crate::image::BinImage;
use crate::session::{EcuSession, LogLevel, SessionState};
use crate::tables::TableDef;

/// Longest run of cells sent in a single Mode 10 frame.
pub const MAX_RUN_BYTES: usize = 50;

/// Default per-cell bound on |shadow − ROM|.
pub const DEFAULT_MAX_DELTA: u8 = 10;

const KNOCK_RING_DEPTH: usize = 10;
const KNOCK_LIMIT_DEG: f64 = 5.0;
const ECT_LIMIT_C: f64 = 110.0;
const RPM_LIMIT: f64 = 5500.0;

pub struct LiveTuner {
    session: Arc<EcuSession>,
    table: &'static TableDef,
    /// Current intended values.
    shadow: Vec<u8>,
    /// ROM baseline captured at load time; the delta bound and the
    /// watchdog revert both refer to this.
    rom: Vec<u8>,
    dirty: BTreeSet<usize>,
    max_delta: u8,
    knock_ring: VecDeque<f64>,
    reverted: bool,
}

impl LiveTuner {
    pub fn new(session: Arc<EcuSession>, table: &'static TableDef) -> Self {
        let size = table.byte_size();
        Self {
            session,
            table,
            shadow: vec![0; size],
            rom: vec![0; size],
            dirty: BTreeSet::new(),
            max_delta: DEFAULT_MAX_DELTA,
            knock_ring: VecDeque::with_capacity(KNOCK_RING_DEPTH),
            reverted: false,
        }
    }

    pub fn table(&self) -> &'static TableDef {
        self.table
    }

    pub fn set_max_delta(&mut self, max_delta: u8) {
        self.max_delta = max_delta;
    }

    /// Capture the table bytes from an image as both shadow and ROM
    /// baseline. Re-arms the watchdog.
    pub fn load_from_bin(&mut self, image: &BinImage) {
        let offset = self.table.rom_offset;
        let bytes = &image.bytes()[offset..offset + self.table.byte_size()];
        self.shadow.copy_from_slice(bytes);
        self.rom.copy_from_slice(bytes);
        self.dirty.clear();
        self.knock_ring.clear();
        self.reverted = false;
        self.session.set_state(SessionState::LiveTune);
    }

    fn index(&self, row: usize, col: usize) -> Option<usize> {
        if row < self.table.rows && col < self.table.cols {
            Some(row * self.table.cols + col)
        } else {
            None
        }
    }

    pub fn get_cell(&self, row: usize, col: usize) -> Option<u8> {
        self.index(row, col).map(|i| self.shadow[i])
    }

    /// Stage one cell edit. The value must stay within `max_delta` of
    /// the ROM baseline.
    pub fn set_cell(&mut self, row: usize, col: usize, value: u8) -> Result<(), FlashError> {
        let index = self
            .index(row, col)
            .ok_or_else(|| FlashError::SafetyViolation(format!("cell [{row},{col}] out of range")))?;

        let delta = (value as i16 - self.rom[index] as i16).unsigned_abs();
        if delta > self.max_delta as u16 {
            self.session.emit_log(
                LogLevel::Warning,
                &format!("safety limit: cell [{row},{col}] delta {delta} > max {}", self.max_delta),
            );
            return Err(FlashError::SafetyViolation(format!(
                "cell [{row},{col}] delta {delta} exceeds max {}",
                self.max_delta
            )));
        }

        self.shadow[index] = value;
        self.dirty.insert(index);
        Ok(())
    }

    /// True while staged edits are waiting to be sent.
    pub fn is_editing(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// True once the watchdog has reverted; stays set until the next
    /// `load_from_bin`.
    pub fn is_reverted(&self) -> bool {
        self.reverted
    }

    /// Push all dirty cells to the ECU, coalescing consecutive indices
    /// into single Mode 10 frames. Dirty indices are cleared only when
    /// every run went through.
    pub fn send_updates(&mut self) -> Result<(), FlashError> {
        if self.dirty.is_empty() {
            return Ok(());
        }

        let offsets: Vec<usize> = self.dirty.iter().copied().collect();
        for (start, len) in find_runs(&offsets) {
            let data = &self.shadow[start..start + len];
            self.session.write_cal_ram(start as u16, data).map_err(|e| {
                log::warn!("RT write failed for offset ${start:04X}");
                e
            })?;
        }

        self.dirty.clear();
        Ok(())
    }

    /// Feed one decoded sensor sample to the watchdog. An Err means the
    /// tune is unsafe; on sustained knock the shadow has already been
    /// reverted to ROM.
    pub fn check_safety(
        &mut self,
        sample: &HashMap<&'static str, f64>,
    ) -> Result<(), FlashError> {
        if self.reverted {
            return Err(FlashError::SafetyViolation(
                "shadow reverted — reload the table to re-arm".into(),
            ));
        }

        let knock = sample.get("Knock Retard").copied().unwrap_or(0.0);
        if self.knock_ring.len() == KNOCK_RING_DEPTH {
            self.knock_ring.pop_front();
        }
        self.knock_ring.push_back(knock);

        if self.knock_ring.len() >= 3
            && self.knock_ring.iter().rev().take(3).all(|&k| k > KNOCK_LIMIT_DEG)
        {
            self.session.emit_log(
                LogLevel::Error,
                "SAFETY: knock retard above 5° for 3 consecutive samples — reverting to ROM",
            );
            self.revert_to_rom();
            return Err(FlashError::SafetyViolation(
                "sustained knock retard — reverted to ROM values".into(),
            ));
        }

        let coolant = sample.get("ECT Temp").copied().unwrap_or(0.0);
        if coolant > ECT_LIMIT_C {
            return Err(FlashError::SafetyViolation(format!(
                "coolant temp {coolant:.1}°C above {ECT_LIMIT_C}°C — refusing writes"
            )));
        }

        let rpm = sample.get("RPM").copied().unwrap_or(0.0);
        if rpm > RPM_LIMIT {
            return Err(FlashError::SafetyViolation(format!(
                "RPM {rpm:.0} above {RPM_LIMIT} — refusing writes"
            )));
        }

        Ok(())
    }

    /// Copy the ROM baseline back over the shadow and push it out. The
    /// push is best-effort: a failed send leaves the cells dirty for the
    /// next attempt.
    pub fn revert_to_rom(&mut self) {
        self.shadow.copy_from_slice(&self.rom);
        self.dirty = (0..self.table.byte_size()).collect();
        self.reverted = true;
        if let Err(e) = self.send_updates() {
            log::warn!("revert push failed, cells stay dirty: {e}");
        }
    }
}

/// Coalesce sorted offsets into (start, len) runs of strictly
/// consecutive indices, none longer than `MAX_RUN_BYTES`.
pub fn find_runs(offsets: &[usize]) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut iter = offsets.iter().copied();
    let first = match iter.next() {
        Some(o) => o,
        None => return runs,
    };

    let mut start = first;
    let mut end = first;
    for o in iter {
        if o == end + 1 && o - start < MAX_RUN_BYTES {
            end = o;
        } else {
            runs.push((start, end - start + 1));
            start = o;
            end = o;
        }
    }
    runs.push((start, end - start + 1));
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommConfig;
    use crate::image::BIN_SIZE;
    use crate::sim::EcuSim;
    use crate::tables::table_by_key;
    use crate::transport::Transport;

    fn sim_tuner() -> (EcuSim, LiveTuner) {
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

        let mut tuner = LiveTuner::new(session, table_by_key("spark_hi_oct").unwrap());
        let mut raw = vec![0xFF; BIN_SIZE];
        let t = tuner.table();
        raw[t.rom_offset..t.rom_offset + t.byte_size()].fill(100);
        tuner.load_from_bin(&BinImage::from_bytes(raw, false).unwrap());
        (sim, tuner)
    }

    fn sample(knock: f64, ect: f64, rpm: f64) -> HashMap<&'static str, f64> {
        HashMap::from([("Knock Retard", knock), ("ECT Temp", ect), ("RPM", rpm)])
    }

    #[test]
    fn test_set_cell_within_delta() {
        let (_sim, mut tuner) = sim_tuner();
        tuner.set_cell(0, 0, 110).unwrap();
        tuner.set_cell(0, 1, 90).unwrap();
        assert_eq!(tuner.get_cell(0, 0), Some(110));
        assert!(tuner.is_editing());
    }

    #[test]
    fn test_set_cell_delta_bound() {
        let (_sim, mut tuner) = sim_tuner();
        assert!(matches!(
            tuner.set_cell(0, 0, 111),
            Err(FlashError::SafetyViolation(_))
        ));
        assert!(matches!(
            tuner.set_cell(0, 0, 89),
            Err(FlashError::SafetyViolation(_))
        ));
        assert!(!tuner.is_editing());
    }

    #[test]
    fn test_set_cell_out_of_range() {
        let (_sim, mut tuner) = sim_tuner();
        assert!(tuner.set_cell(17, 0, 100).is_err());
        assert!(tuner.set_cell(0, 17, 100).is_err());
    }

    #[test]
    fn test_send_updates_coalesces_runs() {
        let (sim, mut tuner) = sim_tuner();
        // cells 0..4 of row 0 are consecutive offsets; cell (1,0) is not
        for col in 0..4 {
            tuner.set_cell(0, col, 105).unwrap();
        }
        tuner.set_cell(1, 0, 105).unwrap();
        tuner.send_updates().unwrap();
        assert!(!tuner.is_editing());

        let writes = sim.cal_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], (0, vec![105, 105, 105, 105]));
        assert_eq!(writes[1], (17, vec![105]));
    }

    #[test]
    fn test_find_runs_law() {
        let offsets: Vec<usize> = (0..120).chain([200, 201, 300]).collect();
        let runs = find_runs(&offsets);

        // concatenation reproduces the input
        let mut flat = Vec::new();
        for &(start, len) in &runs {
            assert!(len <= MAX_RUN_BYTES);
            flat.extend(start..start + len);
        }
        assert_eq!(flat, offsets);
        assert_eq!(runs, vec![(0, 50), (50, 50), (100, 20), (200, 2), (300, 1)]);
    }

    #[test]
    fn test_find_runs_empty() {
        assert!(find_runs(&[]).is_empty());
    }

    #[test]
    fn test_watchdog_knock_reverts() {
        let (sim, mut tuner) = sim_tuner();
        tuner.set_cell(0, 0, 110).unwrap();
        tuner.send_updates().unwrap();

        assert!(tuner.check_safety(&sample(6.0, 90.0, 2000.0)).is_ok());
        assert!(tuner.check_safety(&sample(6.5, 90.0, 2000.0)).is_ok());
        let result = tuner.check_safety(&sample(7.0, 90.0, 2000.0));
        assert!(matches!(result, Err(FlashError::SafetyViolation(_))));

        assert!(tuner.is_reverted());
        assert_eq!(tuner.get_cell(0, 0), Some(100));
        // the revert was pushed out over Mode 10
        let pushed: usize = sim.cal_writes().iter().map(|(_, d)| d.len()).sum();
        assert!(pushed >= tuner.table().byte_size());
    }

    #[test]
    fn test_watchdog_interrupted_knock_does_not_revert() {
        let (_sim, mut tuner) = sim_tuner();
        assert!(tuner.check_safety(&sample(6.0, 90.0, 2000.0)).is_ok());
        assert!(tuner.check_safety(&sample(6.0, 90.0, 2000.0)).is_ok());
        assert!(tuner.check_safety(&sample(1.0, 90.0, 2000.0)).is_ok());
        assert!(tuner.check_safety(&sample(6.0, 90.0, 2000.0)).is_ok());
        assert!(!tuner.is_reverted());
    }

    #[test]
    fn test_watchdog_ect_and_rpm_guards() {
        let (_sim, mut tuner) = sim_tuner();
        assert!(tuner.check_safety(&sample(0.0, 111.0, 2000.0)).is_err());
        assert!(!tuner.is_reverted());
        assert!(tuner.check_safety(&sample(0.0, 90.0, 5600.0)).is_err());
        assert!(!tuner.is_reverted());
        assert!(tuner.check_safety(&sample(0.0, 90.0, 2000.0)).is_ok());
    }

    #[test]
    fn test_watchdog_terminal_until_reload() {
        let (_sim, mut tuner) = sim_tuner();
        for _ in 0..3 {
            let _ = tuner.check_safety(&sample(9.0, 90.0, 2000.0));
        }
        assert!(tuner.is_reverted());
        // still unsafe even with clean telemetry
        assert!(tuner.check_safety(&sample(0.0, 90.0, 2000.0)).is_err());

        let mut raw = vec![0xFF; BIN_SIZE];
        let t = tuner.table();
        raw[t.rom_offset..t.rom_offset + t.byte_size()].fill(100);
        tuner.load_from_bin(&BinImage::from_bytes(raw, false).unwrap());
        assert!(!tuner.is_reverted());
        assert!(tuner.check_safety(&sample(0.0, 90.0, 2000.0)).is_ok());
    }
}
