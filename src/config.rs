// Persistent communication settings: device id, timing, retry policy.
// Stored as JSON in <config_dir>/ecoflash/config.json

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::aldl;

/// Defaults match the OSE tool's shipped settings.
pub const DEFAULT_BAUD: u32 = 8192;
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_INTER_FRAME_DELAY_MS: u64 = 10;
pub const DEFAULT_SILENCE_POLL_MS: u64 = 50;
pub const DEFAULT_MAX_RETRIES: u32 = 10;
pub const DEFAULT_WRITE_CHUNK_SIZE: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommConfig {
    /// ALDL device identifier of the target ECM.
    pub device_id: u8,
    /// Body control module silenced alongside the ECM (0 = skip).
    pub bcm_device_id: u8,
    pub baud: u32,
    /// Per-transaction response deadline.
    pub timeout_ms: u64,
    /// Mandatory sleep between silence-wait and transmit.
    pub inter_frame_delay_ms: u64,
    /// Polling interval while arbitrating for bus silence.
    pub silence_poll_ms: u64,
    /// Maximum retries per transaction.
    pub max_retries: u32,
    /// Bytes per Mode 16 flash write frame.
    pub write_chunk_size: usize,
    /// Patch the kernel for the faster read routine.
    pub high_speed_read: bool,
    /// Consume our own echoed bytes after every transmit.
    pub ignore_echo: bool,
    /// Fix a bad image checksum in memory before flashing.
    pub auto_checksum_fix: bool,
    /// Last directory used when opening bin files.
    pub last_bin_dir: Option<String>,

    /// Expected echo length for the next transmit; set per-frame by the
    /// session engine, never persisted.
    #[serde(skip)]
    pub echo_byte_count: usize,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            device_id: aldl::DEVICE_VX_VY,
            bcm_device_id: aldl::DEVICE_BCM,
            baud: DEFAULT_BAUD,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            inter_frame_delay_ms: DEFAULT_INTER_FRAME_DELAY_MS,
            silence_poll_ms: DEFAULT_SILENCE_POLL_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            write_chunk_size: DEFAULT_WRITE_CHUNK_SIZE,
            high_speed_read: false,
            ignore_echo: true,
            auto_checksum_fix: true,
            last_bin_dir: None,
            echo_byte_count: 0,
        }
    }
}

impl CommConfig {
    /// Path to the config file.
    pub fn config_path() -> Option<PathBuf> {
        config_dir().map(|d| d.join("config.json"))
    }

    /// Load config from disk, or return defaults if not found / invalid.
    pub fn load() -> Self {
        let path = match Self::config_path() {
            Some(p) if p.exists() => p,
            _ => return Self::default(),
        };
        match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                log::warn!("cannot parse config: {e}");
                Self::default()
            }),
            Err(e) => {
                log::warn!("cannot read config: {e}");
                Self::default()
            }
        }
    }

    /// Save config to disk.
    pub fn save(&self) {
        let path = match Self::config_path() {
            Some(p) => p,
            None => return,
        };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(self) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    log::warn!("cannot save config: {e}");
                }
            }
            Err(e) => log::warn!("cannot serialise config: {e}"),
        }
    }

    /// Remember a directory from a bin file path.
    pub fn remember_bin_dir(&mut self, path: &std::path::Path) {
        if let Some(parent) = path.parent() {
            self.last_bin_dir = Some(parent.to_string_lossy().into_owned());
        }
    }
}

/// Get the application config directory.
fn config_dir() -> Option<PathBuf> {
    // macOS:   ~/Library/Application Support/ecoflash/
    // Linux:   ~/.config/ecoflash/
    // Windows: %APPDATA%/ecoflash/

    #[cfg(target_os = "macos")]
    {
        let home = std::env::var("HOME").ok()?;
        Some(
            PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("ecoflash"),
        )
    }

    #[cfg(target_os = "windows")]
    {
        let appdata = std::env::var("APPDATA").ok()?;
        Some(PathBuf::from(appdata).join("ecoflash"))
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        let home = std::env::var("HOME").ok()?;
        Some(PathBuf::from(home).join(".config").join("ecoflash"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = CommConfig::default();
        assert_eq!(c.device_id, 0xF7);
        assert_eq!(c.baud, 8192);
        assert_eq!(c.max_retries, 10);
        assert_eq!(c.write_chunk_size, 32);
        assert!(c.auto_checksum_fix);
    }

    #[test]
    fn test_json_roundtrip_ignores_runtime_fields() {
        let mut c = CommConfig::default();
        c.echo_byte_count = 12;
        c.high_speed_read = true;
        let json = serde_json::to_string(&c).unwrap();
        let back: CommConfig = serde_json::from_str(&json).unwrap();
        assert!(back.high_speed_read);
        assert_eq!(back.echo_byte_count, 0);
    }
}
