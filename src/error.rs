// Error taxonomy for the whole engine. Transport failures never unwind:
// everything fallible returns one of these kinds.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlashError {
    /// Transport used before `open()` or after `close()`.
    #[error("transport not open")]
    TransportNotOpen,

    /// OS-level serial failure. Terminal for the current operation.
    #[error("transport I/O failure: {0}")]
    TransportIo(String),

    /// No (or not enough) bytes arrived within the response deadline.
    #[error("no response within deadline")]
    FrameTimeout,

    /// Bad length byte, truncated body, or bad frame checksum.
    #[error("malformed frame: {0}")]
    FrameMalformed(String),

    /// A frame arrived but its mode/ack byte is wrong for the request.
    #[error("unexpected response (mode 0x{mode:02X}, result 0x{result:02X})")]
    ResponseMismatch { mode: u8, result: u8 },

    /// The ECU actively rejected the request (non-0xAA ack). Not retried.
    #[error("request denied by ECU (result 0x{0:02X})")]
    ProtocolDenied(u8),

    /// Stored and computed image checksums disagree, either host-side or
    /// in the on-device post-write verification.
    #[error("checksum mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    /// The live-tune watchdog tripped (revert already performed) or a
    /// bounded-delta cell edit was refused.
    #[error("safety limit: {0}")]
    SafetyViolation(String),

    /// Cooperative cancel observed. Treated as failure by workflows.
    #[error("operation cancelled")]
    Cancelled,

    /// Image file is neither a full 128 KiB bin nor a 16 KiB cal.
    #[error("invalid bin size: {0} bytes (expected 131072 or 16384)")]
    BadImageSize(usize),

    /// Filesystem failure while loading or saving an image or datalog.
    #[error("file I/O failure: {0}")]
    FileIo(#[from] std::io::Error),
}

impl FlashError {
    /// Wire-level kinds the transaction loop is allowed to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FlashError::FrameTimeout
                | FlashError::FrameMalformed(_)
                | FlashError::ResponseMismatch { .. }
        )
    }
}
