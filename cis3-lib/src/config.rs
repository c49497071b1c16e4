//! Configuration surface consumed by the bridge at construction time.
//!
//! Every field has a default matching the deployed CIS3 board, so an empty
//! JSON object (`{}`) is a valid configuration. Durations are plain integer
//! milliseconds or microseconds to keep the file format obvious.

use crate::error::BridgeError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use strum_macros::Display;

/// Physical quantity measured by an analog channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    #[strum(to_string = "voltage")]
    Voltage,
    #[strum(to_string = "resistance")]
    Resistance,
}

impl UnitKind {
    /// Default EMA smoothing factor for this kind of channel.
    pub fn default_alpha(&self) -> f64 {
        match self {
            UnitKind::Voltage => 0.2,
            UnitKind::Resistance => 0.1,
        }
    }

    /// Default moving-average window capacity for this kind of channel.
    pub fn default_window(&self) -> usize {
        match self {
            UnitKind::Voltage => 20,
            UnitKind::Resistance => 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub kind: UnitKind,
    #[serde(default)]
    pub alpha: Option<f64>,
    #[serde(default)]
    pub window: Option<usize>,
}

impl ChannelConfig {
    pub fn new(kind: UnitKind) -> Self {
        Self {
            kind,
            alpha: None,
            window: None,
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha.unwrap_or_else(|| self.kind.default_alpha())
    }

    pub fn window(&self) -> usize {
        self.window.unwrap_or_else(|| self.kind.default_window())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdcConfig {
    pub vref: f64,
    pub resolution: f64,
    pub voltage_multiplier: f64,
    /// Reference resistor of the divider, in ohms.
    pub resistance_reference: f64,
    /// Filtered voltages below this value are reported as 0.0.
    pub voltage_threshold: f64,
    pub channels: Vec<ChannelConfig>,
}

impl Default for AdcConfig {
    fn default() -> Self {
        let mut channels = vec![ChannelConfig::new(UnitKind::Voltage); 4];
        channels.extend(vec![ChannelConfig::new(UnitKind::Resistance); 2]);
        Self {
            vref: 3.3,
            resolution: 1023.0,
            voltage_multiplier: 3.31,
            resistance_reference: 10_000.0,
            voltage_threshold: 0.02,
            channels,
        }
    }
}

/// One entry of the PID table polled by the LIN master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidConfig {
    pub pid: u8,
    pub sensor: String,
    /// Data bytes plus the trailing checksum byte.
    #[serde(default = "default_payload_len")]
    pub payload_len: usize,
    /// Divisor applied to the decoded little-endian integer.
    #[serde(default = "default_scale")]
    pub scale: f64,
}

fn default_payload_len() -> usize {
    3
}

fn default_scale() -> f64 {
    100.0
}

impl PidConfig {
    pub fn new(pid: u8, sensor: impl Into<String>) -> Self {
        Self {
            pid,
            sensor: sensor.into(),
            payload_len: default_payload_len(),
            scale: default_scale(),
        }
    }

    pub fn data_len(&self) -> usize {
        self.payload_len.saturating_sub(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinConfig {
    pub port: String,
    pub baud_rate: u32,
    pub sync_byte: u8,
    pub break_duration_us: u64,
    pub break_settle_us: u64,
    pub response_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub inter_request_pause_ms: u64,
    pub pids: Vec<PidConfig>,
}

impl Default for LinConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyAMA2".to_string(),
            baud_rate: 9600,
            sync_byte: 0x55,
            break_duration_us: 1350,
            break_settle_us: 100,
            response_timeout_ms: 2000,
            poll_interval_ms: 10,
            inter_request_pause_ms: 100,
            pids: vec![PidConfig::new(0x50, "Temperature"), PidConfig::new(0x51, "Humidity")],
        }
    }
}

impl LinConfig {
    pub fn break_duration(&self) -> Duration {
        Duration::from_micros(self.break_duration_us)
    }

    pub fn break_settle(&self) -> Duration {
        Duration::from_micros(self.break_settle_us)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn inter_request_pause(&self) -> Duration {
        Duration::from_millis(self.inter_request_pause_ms)
    }

    pub fn sensor_name(&self, pid: u8) -> Option<&str> {
        self.pids.iter().find(|p| p.pid == pid).map(|p| p.sensor.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub adc_interval_ms: u64,
    pub lin_interval_ms: u64,
    pub publish_interval_ms: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            adc_interval_ms: 100,
            lin_interval_ms: 2000,
            publish_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub timeout_ms: u64,
    pub pause_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 1000,
            pause_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub topic_prefix: String,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "cis3".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub adc: AdcConfig,
    pub lin: LinConfig,
    pub schedule: ScheduleConfig,
    pub heartbeat: HeartbeatConfig,
    pub publish: PublishConfig,
}

impl BridgeConfig {
    /// Load and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BridgeError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, BridgeError> {
        let config: BridgeConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        let adc = &self.adc;
        if adc.channels.is_empty() {
            return Err(BridgeError::Config("at least one ADC channel is required".into()));
        }
        if adc.resolution <= 0.0 {
            return Err(BridgeError::Config(format!("ADC resolution must be positive, got {}", adc.resolution)));
        }
        for (index, channel) in adc.channels.iter().enumerate() {
            let alpha = channel.alpha();
            if !(alpha > 0.0 && alpha <= 1.0) {
                return Err(BridgeError::Config(format!(
                    "channel {index}: alpha must be in (0, 1], got {alpha}"
                )));
            }
            if channel.window() == 0 {
                return Err(BridgeError::Config(format!("channel {index}: window must not be empty")));
            }
        }

        let mut seen = HashSet::new();
        for entry in &self.lin.pids {
            if !seen.insert(entry.pid) {
                return Err(BridgeError::Config(format!("duplicate PID 0x{:02X}", entry.pid)));
            }
            if entry.sensor.trim().is_empty() {
                return Err(BridgeError::Config(format!("PID 0x{:02X} has no sensor name", entry.pid)));
            }
            if !(2..=9).contains(&entry.payload_len) {
                return Err(BridgeError::Config(format!(
                    "PID 0x{:02X}: payload_len must be in 2..=9, got {}",
                    entry.pid, entry.payload_len
                )));
            }
            if entry.scale == 0.0 {
                return Err(BridgeError::Config(format!("PID 0x{:02X}: scale must not be zero", entry.pid)));
            }
        }
        if self.lin.response_timeout_ms == 0 || self.lin.poll_interval_ms == 0 {
            return Err(BridgeError::Config("LIN timeout and poll interval must be non-zero".into()));
        }

        let schedule = &self.schedule;
        if schedule.adc_interval_ms == 0 || schedule.lin_interval_ms == 0 || schedule.publish_interval_ms == 0 {
            return Err(BridgeError::Config("cycle intervals must be non-zero".into()));
        }
        if self.heartbeat.timeout_ms == 0 {
            return Err(BridgeError::Config("heartbeat timeout must be non-zero".into()));
        }
        Ok(())
    }
}
