// 128 KiB calibration image model: load/save, the skip-window checksum,
// sector diffing, and calibration-table access.

use std::path::Path;

use crate::error::FlashError;
use crate::tables::TableDef;

/// Full image size (AMD 29F010, 8 × 16 KiB sectors).
pub const BIN_SIZE: usize = 131_072;
/// Calibration-only file size.
pub const CAL_SIZE: usize = 16_384;
/// Where the calibration area sits in the full image.
pub const CAL_OFFSET: usize = 0x4000;
/// One erasable flash sector.
pub const SECTOR_SIZE: usize = 0x4000;

/// Stored 16-bit checksum, big-endian.
pub const CHECKSUM_OFFSET_HI: usize = 0x4006;
pub const CHECKSUM_OFFSET_LO: usize = 0x4007;

// Checksum input is $2000-$1FFFF with the storage region excluded.
const CHECKSUM_RANGE_START: usize = 0x2000;
const CHECKSUM_RANGE_END: usize = 0x20000;
const CHECKSUM_SKIP_START: usize = 0x4000;
const CHECKSUM_SKIP_END: usize = 0x4008;

/// An in-memory 128 KiB PCM image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinImage {
    data: Vec<u8>,
    padded_from_cal: bool,
}

impl BinImage {
    /// Wrap a full 128 KiB image, or pad a 16 KiB cal-only file into one
    /// (cal at $4000, 0xFF elsewhere, the erased-flash state). Any other
    /// length is rejected.
    pub fn from_bytes(raw: Vec<u8>, allow_cal_padding: bool) -> Result<BinImage, FlashError> {
        if raw.len() == BIN_SIZE {
            return Ok(BinImage { data: raw, padded_from_cal: false });
        }
        if raw.len() == CAL_SIZE && allow_cal_padding {
            let mut data = vec![0xFF; BIN_SIZE];
            data[CAL_OFFSET..CAL_OFFSET + CAL_SIZE].copy_from_slice(&raw);
            log::info!("padded 16KB cal file to 128KB (cal at ${CAL_OFFSET:04X})");
            return Ok(BinImage { data, padded_from_cal: true });
        }
        Err(FlashError::BadImageSize(raw.len()))
    }

    /// Load a .bin file from disk.
    pub fn load(path: &Path, allow_cal_padding: bool) -> Result<BinImage, FlashError> {
        let raw = std::fs::read(path)?;
        Self::from_bytes(raw, allow_cal_padding)
    }

    /// Save the raw image bytes.
    pub fn save(&self, path: &Path) -> Result<(), FlashError> {
        std::fs::write(path, &self.data)?;
        Ok(())
    }

    /// True when this image was padded up from a 16 KiB cal-only file.
    pub fn padded_from_cal(&self) -> bool {
        self.padded_from_cal
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The two OS identifier bytes at $2000-$2001, formatted like "$060A".
    pub fn os_id(&self) -> String {
        format!("${:02X}{:02X}", self.data[0x2000], self.data[0x2001])
    }

    // ── Checksum ─────────────────────────────────────────────────────────

    /// Sum of image[$2000..$20000) excluding $4000..$4008, mod 65536.
    pub fn compute_checksum(&self) -> u16 {
        let mut total: u16 = 0;
        for addr in CHECKSUM_RANGE_START..CHECKSUM_RANGE_END {
            if (CHECKSUM_SKIP_START..CHECKSUM_SKIP_END).contains(&addr) {
                continue;
            }
            total = total.wrapping_add(self.data[addr] as u16);
        }
        total
    }

    /// The big-endian checksum stored at $4006-$4007.
    pub fn stored_checksum(&self) -> u16 {
        ((self.data[CHECKSUM_OFFSET_HI] as u16) << 8) | self.data[CHECKSUM_OFFSET_LO] as u16
    }

    /// True when the stored checksum matches the computed one.
    pub fn verify_checksum(&self) -> bool {
        self.stored_checksum() == self.compute_checksum()
    }

    /// Recompute and store the checksum. Returns (old, new).
    pub fn fix_checksum(&mut self) -> (u16, u16) {
        let old = self.stored_checksum();
        let new = self.compute_checksum();
        self.data[CHECKSUM_OFFSET_HI] = (new >> 8) as u8;
        self.data[CHECKSUM_OFFSET_LO] = new as u8;
        (old, new)
    }

    // ── Sector diff ──────────────────────────────────────────────────────

    /// Indices in [0,8) of the 16 KiB sectors that differ between two
    /// images. Sector 0 = $0000-$3FFF, sector 1 = $4000-$7FFF, …
    pub fn diff_sectors(&self, other: &BinImage) -> Vec<usize> {
        (0..BIN_SIZE / SECTOR_SIZE)
            .filter(|&s| {
                let start = s * SECTOR_SIZE;
                self.data[start..start + SECTOR_SIZE] != other.data[start..start + SECTOR_SIZE]
            })
            .collect()
    }

    // ── Calibration tables ───────────────────────────────────────────────

    /// Read a table as rows × cols cell values (2-byte cells big-endian).
    pub fn read_table(&self, table: &TableDef) -> Vec<Vec<u16>> {
        let mut offset = table.rom_offset;
        let mut out = Vec::with_capacity(table.rows);
        for _ in 0..table.rows {
            let mut row = Vec::with_capacity(table.cols);
            for _ in 0..table.cols {
                let v = match table.element_size {
                    1 => self.data[offset] as u16,
                    _ => ((self.data[offset] as u16) << 8) | self.data[offset + 1] as u16,
                };
                row.push(v);
                offset += table.element_size;
            }
            out.push(row);
        }
        out
    }

    /// Write a rows × cols value matrix into the table region.
    pub fn write_table(&mut self, table: &TableDef, values: &[Vec<u16>]) {
        let mut offset = table.rom_offset;
        for row in values.iter().take(table.rows) {
            for &v in row.iter().take(table.cols) {
                match table.element_size {
                    1 => self.data[offset] = v as u8,
                    _ => {
                        self.data[offset] = (v >> 8) as u8;
                        self.data[offset + 1] = v as u8;
                    }
                }
                offset += table.element_size;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::table_by_key;

    fn blank_image() -> BinImage {
        BinImage::from_bytes(vec![0xFF; BIN_SIZE], false).unwrap()
    }

    #[test]
    fn test_padding_law() {
        let img = BinImage::from_bytes(vec![0xAA; CAL_SIZE], true).unwrap();
        assert_eq!(img.bytes().len(), BIN_SIZE);
        assert!(img.padded_from_cal());
        assert_eq!(img.bytes()[0x4000], 0xAA);
        assert_eq!(img.bytes()[0x7FFF], 0xAA);
        assert_eq!(img.bytes()[0x3FFF], 0xFF);
        assert_eq!(img.bytes()[0x8000], 0xFF);
    }

    #[test]
    fn test_size_rejection() {
        for len in [0usize, 1, CAL_SIZE - 1, CAL_SIZE + 1, BIN_SIZE - 1, BIN_SIZE + 1] {
            assert!(matches!(
                BinImage::from_bytes(vec![0; len], true),
                Err(FlashError::BadImageSize(_))
            ));
        }
        // cal-sized input without padding allowed is also rejected
        assert!(BinImage::from_bytes(vec![0; CAL_SIZE], false).is_err());
    }

    #[test]
    fn test_fix_checksum_idempotent() {
        let mut img = blank_image();
        img.fix_checksum();
        assert!(img.verify_checksum());
        let before = img.clone();
        let (old, new) = img.fix_checksum();
        assert_eq!(old, new);
        assert_eq!(img, before);
    }

    #[test]
    fn test_checksum_skip_window() {
        let mut img = blank_image();
        let base = img.compute_checksum();
        for addr in 0x4000..0x4008 {
            if addr == CHECKSUM_OFFSET_HI || addr == CHECKSUM_OFFSET_LO {
                continue;
            }
            img.bytes_mut()[addr] = 0x00;
            assert_eq!(img.compute_checksum(), base, "byte ${addr:04X} not skipped");
        }
        // a byte just outside the window does count
        img.bytes_mut()[0x4008] = 0x00;
        assert_ne!(img.compute_checksum(), base);
    }

    #[test]
    fn test_diff_sectors() {
        let a = blank_image();
        let mut b = a.clone();
        b.bytes_mut()[0x4000] = 0x00;
        assert_eq!(a.diff_sectors(&b), vec![1]);
        assert!(a.diff_sectors(&a.clone()).is_empty());
    }

    #[test]
    fn test_table_roundtrip() {
        let mut img = blank_image();
        let table = table_by_key("spark_hi_oct").unwrap();
        let values: Vec<Vec<u16>> = (0..table.rows)
            .map(|r| (0..table.cols).map(|c| ((r * table.cols + c) % 256) as u16).collect())
            .collect();
        img.write_table(table, &values);
        assert_eq!(img.read_table(table), values);
    }

    #[test]
    fn test_load_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.bin");
        let mut img = blank_image();
        img.bytes_mut()[0x2000] = 0x06;
        img.bytes_mut()[0x2001] = 0x0A;
        img.save(&path).unwrap();
        let back = BinImage::load(&path, true).unwrap();
        assert_eq!(back, img);
        assert_eq!(back.os_id(), "$060A");
    }
}
