// ALDL frame building, checksum and parsing. Pure functions over byte
// buffers; no I/O here, framing policy lives in the session engine.
//
// All frames: [DeviceID] [Length] [Mode] [Data…] [Checksum]
//
// Length byte encoding (OSE convention):
//   wire bytes       = frame[1] - 82
//   checksum index   = frame[1] - 83
//   payload length   = frame[1] - 85  (mode byte + data)

/// Fixed scratch buffer size, matching the OSE tool's frame buffer.
pub const FRAME_BUF_LEN: usize = 201;

/// `frame[1] = LENGTH_OFFSET + payload_len` for built frames.
pub const LENGTH_OFFSET: u8 = 85;

/// Seed/key obfuscation constant (0x934D). Published, not a secret.
pub const SEED_KEY_MAGIC: u16 = 37709;

/// A frame scratch buffer. Only the first `wire_length` bytes go on the wire.
pub type Frame = [u8; FRAME_BUF_LEN];

// ── Device identifiers ───────────────────────────────────────────────────

/// VR-era ECM.
pub const DEVICE_VR: u8 = 0xF4;
/// VS/VT-era ECM.
pub const DEVICE_VS_VT: u8 = 0xF5;
/// VX/VY-era ECM (target family, default).
pub const DEVICE_VX_VY: u8 = 0xF7;
/// Body control module, silenced alongside the ECM.
pub const DEVICE_BCM: u8 = 0x08;

// ── Mode bytes ───────────────────────────────────────────────────────────

pub mod mode {
    pub const DATASTREAM: u8 = 0x01;
    pub const READ_RAM: u8 = 0x02;
    pub const ENTER_PROG: u8 = 0x05;
    pub const UPLOAD: u8 = 0x06;
    pub const SILENCE: u8 = 0x08;
    pub const UNSILENCE: u8 = 0x09;
    pub const WRITE_CAL: u8 = 0x0A;
    pub const SECURITY: u8 = 0x0D;
    pub const FLASH_WRITE: u8 = 0x10;
}

// ── Checksum ─────────────────────────────────────────────────────────────

/// Index of the checksum byte within the frame buffer.
pub fn checksum_index(frame: &[u8]) -> usize {
    frame[1] as usize - 83
}

/// Number of bytes actually transmitted on the wire.
pub fn wire_length(frame: &[u8]) -> usize {
    frame[1] as usize - 82
}

/// Two's-complement of the byte sum before the checksum position, mod 256.
/// A zero sum maps through 256 (OSE quirk, kept bit-exact).
pub fn compute_checksum(frame: &[u8]) -> u8 {
    let mut total: u16 = 0;
    for &b in &frame[..checksum_index(frame)] {
        total = (total + b as u16) & 0xFF;
    }
    if total == 0 {
        total = 256;
    }
    (256 - total) as u8
}

/// Compute and write the checksum into the frame.
pub fn apply_checksum(frame: &mut Frame) {
    let idx = checksum_index(frame);
    frame[idx] = compute_checksum(frame);
}

/// Verify a received frame: all bytes through the checksum sum to 0 mod 256.
pub fn verify_checksum(frame: &[u8]) -> bool {
    let idx = checksum_index(frame);
    if idx >= frame.len() {
        return false;
    }
    let mut total: u8 = 0;
    for &b in &frame[..=idx] {
        total = total.wrapping_add(b);
    }
    total == 0
}

// ── Frame builders ───────────────────────────────────────────────────────

/// Build a frame with mode byte and optional data payload.
pub fn build_simple(device_id: u8, mode: u8, data: &[u8]) -> Frame {
    let mut frame = [0u8; FRAME_BUF_LEN];
    frame[0] = device_id;
    frame[1] = LENGTH_OFFSET + 1 + data.len() as u8;
    frame[2] = mode;
    frame[3..3 + data.len()].copy_from_slice(data);
    apply_checksum(&mut frame);
    frame
}

/// Mode 1 data stream request for one message selector.
pub fn build_mode1_request(device_id: u8, message: u8) -> Frame {
    build_simple(device_id, mode::DATASTREAM, &[message])
}

/// Mode 2 read request. Extended = 24-bit address (kernel-backed flash
/// read), otherwise 16-bit RAM address.
pub fn build_mode2_read(device_id: u8, address: u32, extended: bool) -> Frame {
    let mut frame = [0u8; FRAME_BUF_LEN];
    frame[0] = device_id;
    frame[2] = mode::READ_RAM;
    if extended {
        frame[1] = 0x59;
        frame[3] = (address >> 16) as u8;
        frame[4] = (address >> 8) as u8;
        frame[5] = address as u8;
    } else {
        frame[1] = 0x58;
        frame[3] = (address >> 8) as u8;
        frame[4] = address as u8;
    }
    apply_checksum(&mut frame);
    frame
}

/// Mode 13 subcommand 0x01: request the security seed.
pub fn build_seed_request(device_id: u8) -> Frame {
    build_simple(device_id, mode::SECURITY, &[0x01])
}

/// Mode 13 subcommand 0x02: answer with the computed key (hi, lo).
pub fn build_key_response(device_id: u8, key: u16) -> Frame {
    let mut frame = [0u8; FRAME_BUF_LEN];
    frame[0] = device_id;
    frame[1] = 0x59;
    frame[2] = mode::SECURITY;
    frame[3] = 0x02;
    frame[4] = (key >> 8) as u8;
    frame[5] = key as u8;
    apply_checksum(&mut frame);
    frame
}

/// Mode 5: enter programming mode. No payload.
pub fn build_mode5_request(device_id: u8) -> Frame {
    let mut frame = [0u8; FRAME_BUF_LEN];
    frame[0] = device_id;
    frame[1] = 0x56;
    frame[2] = mode::ENTER_PROG;
    apply_checksum(&mut frame);
    frame
}

/// Mode 8: suppress bus chatter.
pub fn build_silence_frame(device_id: u8) -> Frame {
    let mut frame = [0u8; FRAME_BUF_LEN];
    frame[0] = device_id;
    frame[1] = 0x56;
    frame[2] = mode::SILENCE;
    apply_checksum(&mut frame);
    frame
}

/// Mode 9: re-enable bus chatter.
pub fn build_unsilence_frame(device_id: u8) -> Frame {
    let mut frame = [0u8; FRAME_BUF_LEN];
    frame[0] = device_id;
    frame[1] = 0x56;
    frame[2] = mode::UNSILENCE;
    apply_checksum(&mut frame);
    frame
}

/// Write-data frame. Extended = 24-bit address (Mode 16 flash writes),
/// otherwise 16-bit (Mode 10 cal-RAM writes).
pub fn build_write_frame(device_id: u8, address: u32, data: &[u8], mode: u8, extended: bool) -> Frame {
    let mut frame = [0u8; FRAME_BUF_LEN];
    frame[0] = device_id;
    frame[2] = mode;
    if extended {
        frame[1] = LENGTH_OFFSET + data.len() as u8 + 4;
        frame[3] = (address >> 16) as u8;
        frame[4] = (address >> 8) as u8;
        frame[5] = address as u8;
        frame[6..6 + data.len()].copy_from_slice(data);
    } else {
        frame[1] = LENGTH_OFFSET + data.len() as u8 + 3;
        frame[3] = (address >> 8) as u8;
        frame[4] = address as u8;
        frame[5..5 + data.len()].copy_from_slice(data);
    }
    apply_checksum(&mut frame);
    frame
}

/// Finalise a pre-formed kernel/template block: the blob already carries
/// its own device, length and body bytes; only the checksum is computed
/// here, using the blob's own byte-1 length.
pub fn build_blob_frame(blob: &[u8]) -> Frame {
    let mut frame = [0u8; FRAME_BUF_LEN];
    frame[..blob.len()].copy_from_slice(blob);
    apply_checksum(&mut frame);
    frame
}

// ── Seed → key ───────────────────────────────────────────────────────────

/// `key = (37709 - (seed_lo·256 + seed_hi)) mod 65536`.
///
/// The byte order in the subtrahend really is swapped; the ECU firmware
/// assembles the seed low-byte-first.
pub fn compute_seed_key(seed_hi: u8, seed_lo: u8) -> u16 {
    let seed = ((seed_lo as u16) << 8) | seed_hi as u16;
    SEED_KEY_MAGIC.wrapping_sub(seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_length_identity() {
        let frame = build_silence_frame(DEVICE_VX_VY);
        assert_eq!(wire_length(&frame), frame[1] as usize - 82);
        assert_eq!(checksum_index(&frame), frame[1] as usize - 83);
        assert_eq!(wire_length(&frame), 4);
    }

    #[test]
    fn test_apply_verify_roundtrip() {
        let frame = build_simple(DEVICE_VX_VY, mode::SILENCE, &[]);
        assert!(verify_checksum(&frame));
    }

    #[test]
    fn test_verify_detects_corruption() {
        let mut frame = build_simple(DEVICE_VX_VY, mode::SILENCE, &[]);
        frame[2] ^= 0xFF;
        assert!(!verify_checksum(&frame));
    }

    #[test]
    fn test_single_bit_flips_detected() {
        let frame = build_mode1_request(DEVICE_VX_VY, 0);
        let cs = checksum_index(&frame);
        for i in 0..cs {
            for bit in 0..8 {
                let mut bad = frame;
                bad[i] ^= 1 << bit;
                assert!(!verify_checksum(&bad), "flip at byte {i} bit {bit} undetected");
            }
        }
    }

    #[test]
    fn test_seed_request_bytes() {
        let frame = build_seed_request(DEVICE_VX_VY);
        assert_eq!(&frame[..4], &[0xF7, 0x57, 0x0D, 0x01]);
        assert!(verify_checksum(&frame));
    }

    #[test]
    fn test_key_response_bytes() {
        let frame = build_key_response(DEVICE_VX_VY, 0xABCD);
        assert_eq!(frame[2], mode::SECURITY);
        assert_eq!(frame[3], 0x02);
        assert_eq!(frame[4], 0xAB);
        assert_eq!(frame[5], 0xCD);
        assert!(verify_checksum(&frame));
    }

    #[test]
    fn test_mode2_read_standard() {
        let frame = build_mode2_read(DEVICE_VX_VY, 0x0089, false);
        assert_eq!(frame[1], 0x58);
        assert_eq!(frame[3], 0x00);
        assert_eq!(frame[4], 0x89);
        assert!(verify_checksum(&frame));
    }

    #[test]
    fn test_mode2_read_extended() {
        let frame = build_mode2_read(DEVICE_VX_VY, 0x010089, true);
        assert_eq!(frame[1], 0x59);
        assert_eq!(&frame[3..6], &[0x01, 0x00, 0x89]);
        assert!(verify_checksum(&frame));
    }

    #[test]
    fn test_write_frame_extended() {
        let frame = build_write_frame(DEVICE_VX_VY, 0x018000, &[0x11, 0x22, 0x33], mode::FLASH_WRITE, true);
        assert_eq!(frame[2], mode::FLASH_WRITE);
        assert_eq!(&frame[3..9], &[0x01, 0x80, 0x00, 0x11, 0x22, 0x33]);
        assert!(verify_checksum(&frame));
    }

    #[test]
    fn test_write_frame_cal_ram() {
        let frame = build_write_frame(DEVICE_VX_VY, 0x4000, &[0xAA, 0xBB], mode::WRITE_CAL, false);
        assert_eq!(frame[2], mode::WRITE_CAL);
        assert_eq!(&frame[3..7], &[0x40, 0x00, 0xAA, 0xBB]);
        assert!(verify_checksum(&frame));
    }

    #[test]
    fn test_seed_key_known_values() {
        // 37709 - (0x34·256 + 0x12) = 37709 - 13330 = 24379
        assert_eq!(compute_seed_key(0x12, 0x34), 24379);
    }

    #[test]
    fn test_seed_key_zero_seed() {
        assert_eq!(compute_seed_key(0, 0), 37709);
    }

    #[test]
    fn test_seed_key_wraps_negative() {
        let expected = (37709i32 - 0xFFFF).rem_euclid(65536) as u16;
        assert_eq!(compute_seed_key(0xFF, 0xFF), expected);
    }

    #[test]
    fn test_all_builders_verify() {
        let frames = [
            build_simple(DEVICE_VX_VY, mode::DATASTREAM, &[]),
            build_mode1_request(DEVICE_VX_VY, 0),
            build_mode2_read(DEVICE_VX_VY, 0x0089, false),
            build_seed_request(DEVICE_VX_VY),
            build_key_response(DEVICE_VX_VY, 0x1234),
            build_mode5_request(DEVICE_VX_VY),
            build_silence_frame(DEVICE_VX_VY),
            build_unsilence_frame(DEVICE_VX_VY),
            build_write_frame(DEVICE_VX_VY, 0x8000, &[0xAB, 0xCD], mode::FLASH_WRITE, true),
        ];
        for (i, frame) in frames.iter().enumerate() {
            assert!(verify_checksum(frame), "frame {i} has a bad checksum");
        }
    }
}
