//! Common test utilities and shared imports

// Allow unused imports and dead code since this is a shared module
// used across multiple test files - not all items are used in every test file
#[allow(unused_imports)]
pub use bytes::Bytes;
#[allow(unused_imports)]
pub use cis3_lib::config::{AdcConfig, BridgeConfig, ChannelConfig, LinConfig, PidConfig, UnitKind};
#[allow(unused_imports)]
pub use cis3_lib::error::BridgeError;
#[allow(unused_imports)]
pub use cis3_lib::lin::{Frame, LinMaster, PidOutcome};
#[allow(unused_imports)]
pub use cis3_lib::serial::SerialTransport;
#[allow(unused_imports)]
pub use cis3_lib::source::SampleSource;
#[allow(unused_imports)]
pub use cis3_lib::store::{ChannelReading, TelemetryStore};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub const SYNC: u8 = 0x55;

/// Route library logs to the test harness; honours `RUST_LOG`.
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// LIN settings that keep tests fast: short timeout, no inter-request pause.
#[allow(dead_code)]
pub fn fast_lin_config(pids: Vec<PidConfig>) -> LinConfig {
    LinConfig {
        break_duration_us: 50,
        break_settle_us: 10,
        response_timeout_ms: 60,
        poll_interval_ms: 2,
        inter_request_pause_ms: 0,
        pids,
        ..LinConfig::default()
    }
}

/// One primitive call on the mock line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    BreakOn,
    BreakOff,
    Clear,
    Write(Vec<u8>),
}

/// What the mock line saw, shared with the test after the transport moves away.
#[derive(Debug, Default)]
pub struct WireLog {
    pub writes: Vec<Vec<u8>>,
    pub breaks: usize,
    pub clears: usize,
    /// Every call in order, with the time it happened.
    pub events: Vec<(Instant, WireEvent)>,
}

#[allow(dead_code)]
impl WireLog {
    fn record(&mut self, event: WireEvent) {
        self.events.push((Instant::now(), event));
    }

    pub fn event_kinds(&self) -> Vec<WireEvent> {
        self.events.iter().map(|(_, e)| e.clone()).collect()
    }

    /// Instants of the header writes, in order.
    pub fn write_times(&self) -> Vec<Instant> {
        self.events
            .iter()
            .filter(|(_, e)| matches!(e, WireEvent::Write(_)))
            .map(|(at, _)| *at)
            .collect()
    }
}

/// Scripted LIN slave: each header write queues the chunks registered for its PID.
#[derive(Clone, Default)]
pub struct MockTransport {
    pub log: Arc<Mutex<WireLog>>,
    replies: HashMap<u8, Vec<Vec<u8>>>,
    failing_writes: HashSet<u8>,
    incoming: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

#[allow(dead_code)]
impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply to `pid` with `chunks`, delivered one per read.
    pub fn reply(mut self, pid: u8, chunks: Vec<Vec<u8>>) -> Self {
        self.replies.insert(pid, chunks);
        self
    }

    pub fn fail_write(mut self, pid: u8) -> Self {
        self.failing_writes.insert(pid);
        self
    }

    pub fn headers(&self) -> Vec<Vec<u8>> {
        self.log.lock().unwrap().writes.clone()
    }
}

impl SerialTransport for MockTransport {
    fn assert_break(&mut self) -> Result<(), BridgeError> {
        let mut log = self.log.lock().unwrap();
        log.breaks += 1;
        log.record(WireEvent::BreakOn);
        Ok(())
    }

    fn release_break(&mut self) -> Result<(), BridgeError> {
        self.log.lock().unwrap().record(WireEvent::BreakOff);
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), BridgeError> {
        let pid = bytes[1];
        if self.failing_writes.contains(&pid) {
            return Err(BridgeError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mock write failure",
            )));
        }
        let mut log = self.log.lock().unwrap();
        log.writes.push(bytes.to_vec());
        log.record(WireEvent::Write(bytes.to_vec()));
        drop(log);
        if let Some(chunks) = self.replies.get(&pid) {
            self.incoming.lock().unwrap().extend(chunks.iter().cloned());
        }
        Ok(())
    }

    fn read_available(&mut self, timeout: Duration) -> Result<Bytes, BridgeError> {
        match self.incoming.lock().unwrap().pop_front() {
            Some(chunk) => Ok(Bytes::from(chunk)),
            None => {
                thread::sleep(timeout);
                Ok(Bytes::new())
            }
        }
    }

    fn clear_input_buffer(&mut self) -> Result<(), BridgeError> {
        let mut log = self.log.lock().unwrap();
        log.clears += 1;
        log.record(WireEvent::Clear);
        drop(log);
        self.incoming.lock().unwrap().clear();
        Ok(())
    }
}

/// Sample source returning scripted raw values per channel, or an error.
#[derive(Debug, Clone, Default)]
pub struct FixedSource {
    values: HashMap<usize, VecDeque<Option<u16>>>,
}

#[allow(dead_code)]
impl FixedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` entries make the read fail.
    pub fn with(mut self, channel: usize, samples: Vec<Option<u16>>) -> Self {
        self.values.insert(channel, samples.into());
        self
    }
}

impl SampleSource for FixedSource {
    fn read_raw(&mut self, channel: usize) -> Result<u16, BridgeError> {
        let queue = self.values.entry(channel).or_default();
        // The last scripted value repeats once the script runs out.
        let next = if queue.len() > 1 { queue.pop_front() } else { queue.front().copied() };
        match next.flatten() {
            Some(raw) => Ok(raw),
            None => Err(BridgeError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "mock ADC failure",
            ))),
        }
    }
}
