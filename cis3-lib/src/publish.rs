//! Read-only consumers of telemetry snapshots.
//!
//! Topics use the layout the Home Assistant side subscribes to:
//!
//! ```text
//! cis3/channel_0/voltage      5.47
//! cis3/channel_4/resistance   100.5
//! cis3/slave_1/temperature    21.5
//! cis3/can/status             ON | OFF
//! cis3/status                 online | offline   (availability, retained)
//! ```

use crate::error::BridgeError;
use crate::store::TelemetrySnapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use tracing::{debug, info};

/// Every LIN sensor hangs off the one slave node.
pub const SLAVE_NODE: &str = "slave_1";

/// Flatten a snapshot into `(topic, payload)` pairs.
pub fn state_messages(snapshot: &TelemetrySnapshot, prefix: &str) -> Vec<(String, String)> {
    let mut messages = Vec::with_capacity(snapshot.channels.len() + snapshot.sensors.len() + 1);
    for (channel, reading) in &snapshot.channels {
        messages.push((
            format!("{prefix}/{channel}/{}", reading.unit_name()),
            reading.value().to_string(),
        ));
    }
    for (sensor, value) in &snapshot.sensors {
        messages.push((
            format!("{prefix}/{SLAVE_NODE}/{}", sensor.to_lowercase()),
            value.to_string(),
        ));
    }
    let status = if snapshot.bus_alive { "ON" } else { "OFF" };
    messages.push((format!("{prefix}/can/status"), status.to_string()));
    messages
}

/// Retained availability message: `online` while publishing, `offline` after.
pub fn availability_message(prefix: &str, online: bool) -> (String, String) {
    let payload = if online { "online" } else { "offline" };
    (format!("{prefix}/status"), payload.to_string())
}

/// Destination for periodic snapshot publishing.
pub trait SnapshotSink: Send {
    fn publish(&mut self, snapshot: &TelemetrySnapshot) -> Result<(), BridgeError>;

    /// Called once when the consumer cycle stops.
    fn finish(&mut self) -> Result<(), BridgeError> {
        Ok(())
    }
}

/// Writes every topic/payload pair to the tracing log.
pub struct LogSink {
    prefix: String,
    announced: bool,
}

impl LogSink {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            announced: false,
        }
    }
}

impl SnapshotSink for LogSink {
    fn publish(&mut self, snapshot: &TelemetrySnapshot) -> Result<(), BridgeError> {
        if !self.announced {
            let (topic, payload) = availability_message(&self.prefix, true);
            info!(%topic, %payload, "Availability");
            self.announced = true;
        }
        for (topic, payload) in state_messages(snapshot, &self.prefix) {
            debug!(%topic, %payload, "Published");
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), BridgeError> {
        if self.announced {
            let (topic, payload) = availability_message(&self.prefix, false);
            info!(%topic, %payload, "Availability");
            self.announced = false;
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    snapshot: &'a TelemetrySnapshot,
}

/// One timestamped JSON object per line.
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> SnapshotSink for JsonLinesSink<W> {
    fn publish(&mut self, snapshot: &TelemetrySnapshot) -> Result<(), BridgeError> {
        let record = JsonRecord {
            timestamp: Utc::now(),
            snapshot,
        };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}
