// In-process ECU simulator. Models a Delco HC11 ECM running OS $060A:
// seed/key security, programming mode, kernel upload, flash reads and
// writes against a 128 KiB image. Responses are seeded synchronously on
// each write(), so a following read() returns the prepared bytes.
//
// Cloning an EcuSim yields a handle onto the same simulated ECU, which
// lets a test hand one clone to the session and inspect the other.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::aldl::{self, Frame};
use crate::error::FlashError;
use crate::image::{BinImage, BIN_SIZE};
use crate::kernel;
use crate::transport::Transport;

#[derive(Clone)]
pub struct EcuSim {
    state: Arc<Mutex<SimState>>,
}

struct SimState {
    device_id: u8,
    opened: bool,
    silenced: bool,
    unlocked: bool,
    in_programming: bool,
    kernel_uploaded: bool,
    seed: (u8, u8),
    write_bank: u8,
    fail_checksum: bool,
    rx: Vec<u8>,
    tx_log: Vec<Vec<u8>>,
    /// Simulated flash contents served by Mode 2 and updated by Mode 16.
    image: Vec<u8>,
    /// Mode 10 cal-RAM writes as (offset, data), in arrival order.
    cal_writes: Vec<(u16, Vec<u8>)>,
}

impl EcuSim {
    /// Simulator with blank (all-zero) flash.
    pub fn new() -> Self {
        Self::with_bytes(vec![0u8; BIN_SIZE])
    }

    /// Simulator whose flash is preloaded from a real image, so Mode 2
    /// reads return file bytes.
    pub fn with_image(image: &BinImage) -> Self {
        Self::with_bytes(image.bytes().to_vec())
    }

    fn with_bytes(image: Vec<u8>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                device_id: aldl::DEVICE_VX_VY,
                opened: false,
                silenced: false,
                unlocked: false,
                in_programming: false,
                kernel_uploaded: false,
                seed: (0x12, 0x34),
                write_bank: 0x48,
                fail_checksum: false,
                rx: Vec::new(),
                tx_log: Vec::new(),
                image,
                cal_writes: Vec::new(),
            })),
        }
    }

    /// Override the seed handed out by Mode 13. (0, 0) means already
    /// unlocked.
    pub fn set_seed(&self, hi: u8, lo: u8) {
        self.state.lock().unwrap().seed = (hi, lo);
    }

    /// Make the on-device checksum verification report a mismatch of
    /// 0xBEEF instead of passing.
    pub fn set_fail_checksum(&self, fail: bool) {
        self.state.lock().unwrap().fail_checksum = fail;
    }

    /// Queue a lone device-id byte as the next read, as a chattering bus
    /// heartbeat would appear.
    pub fn push_heartbeat(&self) {
        let mut st = self.state.lock().unwrap();
        let id = st.device_id;
        st.rx.push(id);
    }

    /// Every frame (or raw byte run) the host has transmitted.
    pub fn tx_frames(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().tx_log.clone()
    }

    /// Snapshot of the simulated flash contents.
    pub fn flash_bytes(&self) -> Vec<u8> {
        self.state.lock().unwrap().image.clone()
    }

    /// Mode 10 cal-RAM writes received so far.
    pub fn cal_writes(&self) -> Vec<(u16, Vec<u8>)> {
        self.state.lock().unwrap().cal_writes.clone()
    }

    pub fn is_unlocked(&self) -> bool {
        self.state.lock().unwrap().unlocked
    }

    pub fn is_silenced(&self) -> bool {
        self.state.lock().unwrap().silenced
    }
}

impl Default for EcuSim {
    fn default() -> Self {
        Self::new()
    }
}

impl SimState {
    fn respond(&mut self, mode: u8, extra: &[u8]) {
        let frame: Frame = aldl::build_simple(self.device_id, mode, extra);
        self.rx.extend_from_slice(&frame[..aldl::wire_length(&frame)]);
    }

    /// Generate the simulated ECU response for one transmitted frame.
    fn simulate(&mut self, data: &[u8]) {
        if data.len() < 3 || data[0] != self.device_id {
            return;
        }
        let mode = data[2];

        match mode {
            aldl::mode::SILENCE => {
                self.silenced = true;
                self.respond(aldl::mode::SILENCE, &[]);
            }
            aldl::mode::UNSILENCE => {
                self.silenced = false;
                self.respond(aldl::mode::UNSILENCE, &[]);
            }
            aldl::mode::SECURITY => match data.get(3).copied() {
                Some(0x01) => {
                    let (hi, lo) = self.seed;
                    self.respond(aldl::mode::SECURITY, &[0x01, hi, lo]);
                }
                Some(0x02) => {
                    self.unlocked = true;
                    self.respond(aldl::mode::SECURITY, &[0x02, 0xAA]);
                }
                _ => {}
            },
            aldl::mode::ENTER_PROG => {
                self.in_programming = true;
                self.respond(aldl::mode::ENTER_PROG, &[0xAA]);
            }
            aldl::mode::UPLOAD => self.handle_upload(data),
            aldl::mode::DATASTREAM => {
                let mut sensors = [0u8; 60];
                sensors[0] = 0x00; // RPM hi (0x0020 · 25 = 800 RPM)
                sensors[1] = 0x20;
                sensors[5] = 120; // ECT = 120·0.75−40 = 50°C
                sensors[29] = 140; // battery 14.0 V
                sensors[42] = 30; // IAC steps
                self.respond(aldl::mode::DATASTREAM, &sensors);
            }
            aldl::mode::READ_RAM => {
                let addr = if data[1] == 0x59 {
                    ((data[3] as usize) << 16) | ((data[4] as usize) << 8) | data[5] as usize
                } else {
                    ((data[3] as usize) << 8) | data[4] as usize
                };
                let end = (addr + 64).min(self.image.len());
                let block = if addr < end { self.image[addr..end].to_vec() } else { Vec::new() };
                self.respond(aldl::mode::READ_RAM, &block);
            }
            aldl::mode::FLASH_WRITE => {
                let data_len = (data[1] as usize).saturating_sub(85 + 4);
                if data.len() >= 6 + data_len {
                    let addr =
                        ((data[3] as usize) << 16) | ((data[4] as usize) << 8) | data[5] as usize;
                    let chunk = &data[6..6 + data_len];
                    let end = (addr + chunk.len()).min(self.image.len());
                    if addr < end {
                        self.image[addr..end].copy_from_slice(&chunk[..end - addr]);
                    }
                }
                self.respond(aldl::mode::FLASH_WRITE, &[0xAA]);
            }
            aldl::mode::WRITE_CAL => {
                let data_len = (data[1] as usize).saturating_sub(85 + 3);
                if data.len() >= 5 + data_len {
                    let addr = ((data[3] as u16) << 8) | data[4] as u16;
                    self.cal_writes.push((addr, data[5..5 + data_len].to_vec()));
                }
                self.respond(aldl::mode::WRITE_CAL, &[0xAA]);
            }
            _ => log::debug!("sim: unknown mode 0x{mode:02X}"),
        }
    }

    /// Mode 6 carries both kernel blocks and kernel invocations; the
    /// length byte tells them apart.
    fn handle_upload(&mut self, data: &[u8]) {
        match data[1] {
            // flash-info invocation: AMD 29F010
            0xDE => self.respond(aldl::mode::UPLOAD, &[0x01, 0x20]),
            // checksum verify: the failing reply carries the ECU's sum
            0xE1 if self.fail_checksum => self.respond(aldl::mode::UPLOAD, &[0x55, 0xBE, 0xEF]),
            // write-bank setup: latch the bank byte
            0xF1 => {
                if data.len() > kernel::WRITE_BANK_IDX {
                    self.write_bank = data[kernel::WRITE_BANK_IDX];
                }
                self.respond(aldl::mode::UPLOAD, &[0xAA]);
            }
            // exec blocks, erase, checksum, cleanup: plain ack
            _ => {
                self.kernel_uploaded = true;
                self.respond(aldl::mode::UPLOAD, &[0xAA]);
            }
        }
    }
}

impl Transport for EcuSim {
    fn open(&mut self) -> Result<(), FlashError> {
        let mut st = self.state.lock().unwrap();
        st.opened = true;
        log::info!("simulator transport opened");
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().unwrap().opened = false;
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, FlashError> {
        let mut st = self.state.lock().unwrap();
        if !st.opened {
            return Err(FlashError::TransportNotOpen);
        }
        st.tx_log.push(data.to_vec());
        st.simulate(data);
        Ok(data.len())
    }

    fn read(&mut self, count: usize, _timeout: Duration) -> Result<Vec<u8>, FlashError> {
        // Responses are seeded on write, so there is never anything to
        // wait for: return what is buffered and let the caller's retry
        // logic handle shortfalls.
        let mut st = self.state.lock().unwrap();
        let n = count.min(st.rx.len());
        Ok(st.rx.drain(..n).collect())
    }

    fn flush_input(&mut self) {
        self.state.lock().unwrap().rx.clear();
    }

    fn flush_output(&mut self) {}

    fn is_open(&self) -> bool {
        self.state.lock().unwrap().opened
    }

    fn bytes_available(&self) -> usize {
        self.state.lock().unwrap().rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_sim() -> EcuSim {
        let mut sim = EcuSim::new();
        sim.open().unwrap();
        sim
    }

    #[test]
    fn test_silence_response() {
        let mut sim = open_sim();
        let frame = aldl::build_silence_frame(aldl::DEVICE_VX_VY);
        sim.write(&frame[..aldl::wire_length(&frame)]).unwrap();
        let resp = sim.read(4, Duration::ZERO).unwrap();
        assert_eq!(resp[2], aldl::mode::SILENCE);
        assert!(aldl::verify_checksum(&resp));
        assert!(sim.is_silenced());
    }

    #[test]
    fn test_seed_response() {
        let mut sim = open_sim();
        let frame = aldl::build_seed_request(aldl::DEVICE_VX_VY);
        sim.write(&frame[..aldl::wire_length(&frame)]).unwrap();
        let resp = sim.read(7, Duration::ZERO).unwrap();
        assert_eq!((resp[4], resp[5]), (0x12, 0x34));
    }

    #[test]
    fn test_other_device_ignored() {
        let mut sim = open_sim();
        let frame = aldl::build_silence_frame(aldl::DEVICE_BCM);
        sim.write(&frame[..aldl::wire_length(&frame)]).unwrap();
        assert_eq!(sim.bytes_available(), 0);
    }

    #[test]
    fn test_mode2_serves_image_bytes() {
        let mut raw = vec![0u8; BIN_SIZE];
        raw[0x4000..0x4040].fill(0x5A);
        let img = BinImage::from_bytes(raw, false).unwrap();
        let mut sim = EcuSim::with_image(&img);
        sim.open().unwrap();

        let frame = aldl::build_mode2_read(aldl::DEVICE_VX_VY, 0x4000, true);
        sim.write(&frame[..aldl::wire_length(&frame)]).unwrap();
        let resp = sim.read(70, Duration::ZERO).unwrap();
        assert_eq!(resp[2], aldl::mode::READ_RAM);
        assert!(resp[3..67].iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn test_mode16_updates_flash() {
        let mut sim = open_sim();
        let frame =
            aldl::build_write_frame(aldl::DEVICE_VX_VY, 0x4000, &[1, 2, 3, 4], aldl::mode::FLASH_WRITE, true);
        sim.write(&frame[..aldl::wire_length(&frame)]).unwrap();
        let resp = sim.read(5, Duration::ZERO).unwrap();
        assert_eq!(resp[3], 0xAA);
        assert_eq!(&sim.flash_bytes()[0x4000..0x4004], &[1, 2, 3, 4]);
    }
}
