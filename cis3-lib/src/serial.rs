//! Byte-level access to the LIN line.
//!
//! The master engine only needs five primitives, captured by
//! [`SerialTransport`]. All of them may block; callers run them off the
//! async runtime.

use crate::error::BridgeError;
use crate::lin::Frame;
use bytes::{Bytes, BytesMut};
use serialport::{ClearBuffer, SerialPort};
use std::collections::BTreeMap;
use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

pub trait SerialTransport: Send {
    /// Start holding the line in the break (dominant) state.
    fn assert_break(&mut self) -> Result<(), BridgeError>;
    fn release_break(&mut self) -> Result<(), BridgeError>;
    fn write(&mut self, bytes: &[u8]) -> Result<(), BridgeError>;
    /// Wait up to `timeout` for input and return whatever arrived (possibly nothing).
    fn read_available(&mut self, timeout: Duration) -> Result<Bytes, BridgeError>;
    fn clear_input_buffer(&mut self) -> Result<(), BridgeError>;
}

/// A UART opened through the `serialport` crate.
pub struct PortTransport {
    port: Box<dyn SerialPort>,
    name: String,
}

impl PortTransport {
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, BridgeError> {
        let port = serialport::new(path, baud_rate)
            .timeout(Duration::from_millis(10))
            .open()?;
        info!("UART interface initialized on {} at {} baud.", path, baud_rate);
        Ok(Self {
            port,
            name: path.to_string(),
        })
    }
}

impl SerialTransport for PortTransport {
    fn assert_break(&mut self) -> Result<(), BridgeError> {
        self.port.set_break()?;
        Ok(())
    }

    fn release_break(&mut self) -> Result<(), BridgeError> {
        self.port.clear_break()?;
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), BridgeError> {
        debug!(bytes = %hex::encode(bytes), "UART Write");
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_available(&mut self, timeout: Duration) -> Result<Bytes, BridgeError> {
        self.port.set_timeout(timeout)?;
        let mut chunk = [0u8; 64];
        let mut received = BytesMut::new();
        match self.port.read(&mut chunk) {
            Ok(n) => received.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::TimedOut => return Ok(Bytes::new()),
            Err(e) => return Err(e.into()),
        }

        // Drain anything else already sitting in the driver buffer.
        let mut pending = self.port.bytes_to_read()? as usize;
        while pending > 0 {
            let n = self.port.read(&mut chunk[..pending.min(64)])?;
            if n == 0 {
                break;
            }
            received.extend_from_slice(&chunk[..n]);
            pending = pending.saturating_sub(n);
        }
        debug!(bytes = %hex::encode(&received), "UART Read");
        Ok(received.freeze())
    }

    fn clear_input_buffer(&mut self) -> Result<(), BridgeError> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

impl Drop for PortTransport {
    fn drop(&mut self) {
        info!("UART interface {} closed.", self.name);
    }
}

/// Pretends to be a LIN slave for running without hardware.
///
/// Every header written after a complete break is echoed back (as a
/// single-wire transceiver does) and, for PIDs in the value table, followed
/// by a valid response frame carrying the raw value.
#[derive(Debug, Default)]
pub struct SimulatedResponder {
    sync_byte: u8,
    values: BTreeMap<u8, u16>,
    pending: BytesMut,
    break_active: bool,
    break_seen: bool,
}

impl SimulatedResponder {
    pub fn new(sync_byte: u8, values: BTreeMap<u8, u16>) -> Self {
        Self {
            sync_byte,
            values,
            ..Default::default()
        }
    }

    pub fn set_value(&mut self, pid: u8, raw: u16) {
        self.values.insert(pid, raw);
    }
}

impl SerialTransport for SimulatedResponder {
    fn assert_break(&mut self) -> Result<(), BridgeError> {
        self.break_active = true;
        Ok(())
    }

    fn release_break(&mut self) -> Result<(), BridgeError> {
        if self.break_active {
            self.break_seen = true;
        }
        self.break_active = false;
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), BridgeError> {
        self.pending.extend_from_slice(bytes);
        let header_complete = bytes.len() == 2 && bytes[0] == self.sync_byte;
        if self.break_seen && header_complete {
            let pid = bytes[1];
            if let Some(raw) = self.values.get(&pid) {
                let frame = Frame::new(pid, &raw.to_le_bytes());
                self.pending.extend_from_slice(&frame.response_bytes());
            }
        }
        self.break_seen = false;
        Ok(())
    }

    fn read_available(&mut self, timeout: Duration) -> Result<Bytes, BridgeError> {
        if self.pending.is_empty() {
            thread::sleep(timeout);
            return Ok(Bytes::new());
        }
        Ok(self.pending.split().freeze())
    }

    fn clear_input_buffer(&mut self) -> Result<(), BridgeError> {
        self.pending.clear();
        Ok(())
    }
}
