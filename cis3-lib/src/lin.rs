//! # LIN master engine
//!
//! Drives the single-master serial bus one PID at a time. For each entry of
//! the PID table the master walks the state machine
//!
//! ```text
//! Idle ─► Break ─► Header ─► AwaitResponse ─► Validate ─► Idle
//!                                  │               │
//!                                  └── timeout     └─► Discard ─► Idle
//! ```
//!
//! ## Wire format
//!
//! ```text
//! master:  [break ≈1.35 ms] SYNC PID
//! slave:                             D0 D1 CHK
//! CHK = !(PID + D0 + D1)   (8-bit wrapping sum)
//! ```
//!
//! On a single-wire transceiver the master reads its own header back, so
//! the receive side looks for `SYNC PID` and treats whatever follows as the
//! slave payload. Bytes in front of that preamble (noise, leftovers from a
//! previous frame) are dropped.
//!
//! Nothing here is fatal: every exchange ends with a [`PidOutcome`] and the
//! cycle moves on to the next PID. There is no retry within a cycle.

use crate::config::{LinConfig, PidConfig};
use crate::error::BridgeError;
use crate::serial::SerialTransport;
use crate::store::TelemetryStore;
use bytes::{Buf, Bytes, BytesMut};
use std::thread;
use std::time::{Duration, Instant};
use strum_macros::Display;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

/// Checksum of a response: inverted 8-bit sum of the PID and data bytes.
pub fn checksum(pid: u8, data: &[u8]) -> u8 {
    !data.iter().fold(pid, |acc, b| acc.wrapping_add(*b))
}

/// One slave response: data bytes and the checksum that came with them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub pid: u8,
    pub data: Bytes,
    pub checksum: u8,
}

impl Frame {
    /// Build a frame with a correct checksum.
    pub fn new(pid: u8, data: &[u8]) -> Self {
        Self {
            pid,
            data: Bytes::copy_from_slice(data),
            checksum: checksum(pid, data),
        }
    }

    /// Split a received payload of `data_len` data bytes plus the trailing checksum.
    pub fn from_payload(pid: u8, payload: &[u8], data_len: usize) -> Result<Self, BridgeError> {
        let expected = data_len + 1;
        if !(1..=8).contains(&data_len) || payload.len() != expected {
            return Err(BridgeError::InvalidLength {
                expected,
                actual: payload.len(),
            });
        }
        let (&received, data) = payload.split_last().ok_or(BridgeError::InvalidLength {
            expected,
            actual: 0,
        })?;
        Ok(Self {
            pid,
            data: Bytes::copy_from_slice(data),
            checksum: received,
        })
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        let expected = checksum(self.pid, &self.data);
        if expected != self.checksum {
            return Err(BridgeError::ChecksumMismatch {
                pid: self.pid,
                expected,
                received: self.checksum,
            });
        }
        Ok(())
    }

    /// Data bytes as a little-endian unsigned integer.
    pub fn raw_value(&self) -> u64 {
        self.data
            .iter()
            .rev()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    }

    pub fn value(&self, scale: f64) -> f64 {
        self.raw_value() as f64 / scale
    }

    /// Bytes the slave puts on the line after the header.
    pub fn response_bytes(&self) -> Vec<u8> {
        let mut bytes = self.data.to_vec();
        bytes.push(self.checksum);
        bytes
    }

    /// Header and response as seen on a single-wire bus.
    pub fn wire_bytes(&self, sync_byte: u8) -> Vec<u8> {
        let mut bytes = vec![sync_byte, self.pid];
        bytes.extend_from_slice(&self.response_bytes());
        bytes
    }
}

/// Accumulates received bytes for one exchange and realigns on `SYNC PID`.
#[derive(Debug)]
pub struct ResponseBuffer {
    preamble: [u8; 2],
    buf: BytesMut,
}

impl ResponseBuffer {
    pub fn new(sync_byte: u8, pid: u8) -> Self {
        Self {
            preamble: [sync_byte, pid],
            buf: BytesMut::with_capacity(16),
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Move the preamble to offset 0. Returns `false` if it is not there yet.
    pub fn resync(&mut self) -> bool {
        match self.buf.windows(2).position(|w| w == &self.preamble[..]) {
            Some(0) => true,
            Some(offset) => {
                debug!("Skipping {} bytes before SYNC + PID.", offset);
                self.buf.advance(offset);
                true
            }
            None => {
                // Only the last byte can still start a preamble.
                let keep = usize::from(self.buf.last() == Some(&self.preamble[0]));
                let drop = self.buf.len() - keep;
                self.buf.advance(drop);
                false
            }
        }
    }

    /// Take `payload_len` bytes following the preamble once they are all here.
    pub fn take_payload(&mut self, payload_len: usize) -> Option<Bytes> {
        if !self.resync() || self.buf.len() < 2 + payload_len {
            return None;
        }
        self.buf.advance(2);
        Some(self.buf.split_to(payload_len).freeze())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum EngineState {
    Idle,
    Break,
    Header,
    AwaitResponse,
    Validate,
    Discard,
}

/// Result of polling one PID.
#[derive(Debug, Clone, PartialEq)]
pub enum PidOutcome {
    /// Value decoded and written to the store.
    Committed(f64),
    Timeout,
    ChecksumMismatch { expected: u8, received: u8 },
    /// Break, write or read failed; the PID was abandoned.
    Transport(String),
    Cancelled,
}

impl PidOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, PidOutcome::Committed(_))
    }
}

/// Outcomes of one cycle, in PID table order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub outcomes: Vec<(u8, PidOutcome)>,
}

impl CycleReport {
    pub fn committed(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_committed()).count()
    }

    pub fn outcome(&self, pid: u8) -> Option<&PidOutcome> {
        self.outcomes.iter().find(|(p, _)| *p == pid).map(|(_, o)| o)
    }
}

pub struct LinMaster<T: SerialTransport> {
    transport: T,
    config: LinConfig,
    store: TelemetryStore,
    shutdown: Option<watch::Receiver<bool>>,
    state: EngineState,
}

impl<T: SerialTransport> LinMaster<T> {
    pub fn new(transport: T, config: LinConfig, store: TelemetryStore) -> Self {
        Self {
            transport,
            config,
            store,
            shutdown: None,
            state: EngineState::Idle,
        }
    }

    /// Abandon in-flight exchanges once `shutdown` turns `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn config(&self) -> &LinConfig {
        &self.config
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn cancelled(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    fn transition(&mut self, next: EngineState) {
        trace!(from = %self.state, to = %next, "LIN state");
        self.state = next;
    }

    /// Poll every configured PID once, strictly in table order.
    pub fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        let pids = self.config.pids.clone();
        for entry in &pids {
            if self.cancelled() {
                report.outcomes.push((entry.pid, PidOutcome::Cancelled));
                continue;
            }
            debug!("Processing PID: 0x{:02X}", entry.pid);
            let outcome = self.poll_pid(entry);
            report.outcomes.push((entry.pid, outcome));
            self.pause(self.config.inter_request_pause());
        }
        report
    }

    /// Run one exchange for `entry` and commit the value if it checks out.
    pub fn poll_pid(&mut self, entry: &PidConfig) -> PidOutcome {
        let outcome = match self.exchange(entry) {
            Ok(frame) => {
                let value = frame.value(entry.scale);
                self.store.set_sensor(&entry.sensor, value);
                debug!("Updated {}: {:.2}", entry.sensor, value);
                PidOutcome::Committed(value)
            }
            Err(BridgeError::Timeout { pid, waited_ms }) => {
                warn!("No response for PID 0x{:02X} within {} ms", pid, waited_ms);
                PidOutcome::Timeout
            }
            Err(BridgeError::ChecksumMismatch { expected, received, .. }) => {
                error!(
                    "Checksum mismatch. Expected: 0x{:02X}, Received: 0x{:02X}",
                    expected, received
                );
                PidOutcome::ChecksumMismatch { expected, received }
            }
            Err(BridgeError::Cancelled) => {
                info!("PID 0x{:02X} abandoned on shutdown", entry.pid);
                PidOutcome::Cancelled
            }
            Err(e) => {
                error!("Serial failure on PID 0x{:02X}: {}", entry.pid, e);
                PidOutcome::Transport(e.to_string())
            }
        };
        self.transition(EngineState::Idle);
        outcome
    }

    fn exchange(&mut self, entry: &PidConfig) -> Result<Frame, BridgeError> {
        self.transition(EngineState::Break);
        self.send_break()?;

        self.transition(EngineState::Header);
        self.transport.clear_input_buffer()?;
        self.transport.write(&[self.config.sync_byte, entry.pid])?;
        debug!(
            "Header sent: SYNC=0x{:02X}, PID=0x{:02X} ({})",
            self.config.sync_byte, entry.pid, entry.sensor
        );

        self.transition(EngineState::AwaitResponse);
        let payload = self.await_response(entry.pid, entry.payload_len)?;

        self.transition(EngineState::Validate);
        let frame = Frame::from_payload(entry.pid, &payload, entry.data_len())?;
        if let Err(e) = frame.validate() {
            self.transition(EngineState::Discard);
            return Err(e);
        }
        Ok(frame)
    }

    fn send_break(&mut self) -> Result<(), BridgeError> {
        self.transport.assert_break()?;
        thread::sleep(self.config.break_duration());
        self.transport.release_break()?;
        thread::sleep(self.config.break_settle());
        Ok(())
    }

    fn await_response(&mut self, pid: u8, payload_len: usize) -> Result<Bytes, BridgeError> {
        let timeout = self.config.response_timeout();
        let deadline = Instant::now() + timeout;
        let mut buffer = ResponseBuffer::new(self.config.sync_byte, pid);

        loop {
            if self.cancelled() {
                return Err(BridgeError::Cancelled);
            }
            if let Some(payload) = buffer.take_payload(payload_len) {
                debug!("Extracted Response: {}", hex::encode(&payload));
                return Ok(payload);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(BridgeError::Timeout {
                    pid,
                    waited_ms: timeout.as_millis() as u64,
                });
            }
            let wait = self.config.poll_interval().min(deadline - now);
            let chunk = self.transport.read_available(wait)?;
            if !chunk.is_empty() {
                debug!("Received bytes: {}", hex::encode(&chunk));
                buffer.extend(&chunk);
            }
        }
    }

    /// Sleep between requests, waking early on shutdown.
    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let slice = self.config.poll_interval();
        while !self.cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(slice.min(deadline - now));
        }
    }
}
