// Byte-level ALDL link abstraction.
//
// Variants: SerialTransport (VCP cable, covers FTDI/CH340 adapters),
// EcuSim (in-process simulator, sim.rs). No variant retries and no
// variant reframes; framing policy belongs to the session engine.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};

use crate::error::FlashError;

/// Common interface for ALDL link backends.
pub trait Transport: Send {
    fn open(&mut self) -> Result<(), FlashError>;
    fn close(&mut self);
    fn write(&mut self, data: &[u8]) -> Result<usize, FlashError>;
    /// Read up to `count` bytes, waiting at most `timeout`. May return
    /// fewer bytes on deadline; never errors on a plain timeout.
    fn read(&mut self, count: usize, timeout: Duration) -> Result<Vec<u8>, FlashError>;
    fn flush_input(&mut self);
    fn flush_output(&mut self);
    fn is_open(&self) -> bool;
    fn bytes_available(&self) -> usize;
}

/// Serial-port (COM / VCP) transport, 8N1.
pub struct SerialTransport {
    port_name: String,
    baud: u32,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn new(port_name: &str, baud: u32) -> Self {
        Self {
            port_name: port_name.to_string(),
            baud,
            port: None,
        }
    }

    /// List available serial ports.
    pub fn list_ports() -> Vec<String> {
        serialport::available_ports()
            .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
            .unwrap_or_default()
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> Result<(), FlashError> {
        let port = serialport::new(&self.port_name, self.baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| FlashError::TransportIo(format!("cannot open {}: {e}", self.port_name)))?;
        log::info!("opened {} at {} baud", self.port_name, self.baud);
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            log::info!("closed {}", self.port_name);
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, FlashError> {
        let port = self.port.as_mut().ok_or(FlashError::TransportNotOpen)?;
        port.write_all(data)
            .map_err(|e| FlashError::TransportIo(e.to_string()))?;
        Ok(data.len())
    }

    fn read(&mut self, count: usize, timeout: Duration) -> Result<Vec<u8>, FlashError> {
        let port = self.port.as_mut().ok_or(FlashError::TransportNotOpen)?;
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; count];
        let mut filled = 0;

        while filled < count {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let _ = port.set_timeout(remaining);
            match port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(FlashError::TransportIo(e.to_string())),
            }
        }

        buf.truncate(filled);
        Ok(buf)
    }

    fn flush_input(&mut self) {
        if let Some(port) = self.port.as_mut() {
            let _ = port.clear(ClearBuffer::Input);
        }
    }

    fn flush_output(&mut self) {
        if let Some(port) = self.port.as_mut() {
            let _ = port.clear(ClearBuffer::Output);
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn bytes_available(&self) -> usize {
        self.port
            .as_ref()
            .map(|p| p.bytes_to_read().unwrap_or(0) as usize)
            .unwrap_or(0)
    }
}
