//! Last-known-good telemetry shared between producers and consumers.
//!
//! Producers only call the narrow `set_*` operations and consumers only
//! take owned [`TelemetrySnapshot`] copies. Each setter holds the write
//! lock for a single field, so a snapshot never observes a half-written
//! value, but two snapshots may reflect different producer progress.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Filtered value of one analog channel, tagged with its unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelReading {
    /// Volts
    Voltage(f64),
    /// Ohms
    Resistance(f64),
}

impl ChannelReading {
    pub fn value(&self) -> f64 {
        match self {
            ChannelReading::Voltage(v) | ChannelReading::Resistance(v) => *v,
        }
    }

    pub fn unit_name(&self) -> &'static str {
        match self {
            ChannelReading::Voltage(_) => "voltage",
            ChannelReading::Resistance(_) => "resistance",
        }
    }
}

impl fmt::Display for ChannelReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelReading::Voltage(v) => write!(f, "{v:.2} V"),
            ChannelReading::Resistance(r) => write!(f, "{r:.2} Ω"),
        }
    }
}

/// Point-in-time copy of everything the bridge knows.
///
/// Channels are grouped under `channels` (`channel_0` .. `channel_5`) rather
/// than sitting at the top level, and each carries its unit tag:
/// `{"channels": {"channel_0": {"voltage": 5.47}}, "sensors": {..}, "bus_alive": true}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub channels: BTreeMap<String, ChannelReading>,
    pub sensors: BTreeMap<String, f64>,
    pub bus_alive: bool,
}

impl TelemetrySnapshot {
    pub fn channel(&self, index: usize) -> Option<ChannelReading> {
        self.channels.get(&channel_key(index)).copied()
    }

    pub fn sensor(&self, name: &str) -> Option<f64> {
        self.sensors.get(name).copied()
    }
}

/// Key under which channel `index` is stored (`channel_0`, `channel_1`, ...).
pub fn channel_key(index: usize) -> String {
    format!("channel_{index}")
}

/// Cloneable handle to the shared telemetry state.
#[derive(Debug, Clone, Default)]
pub struct TelemetryStore {
    inner: Arc<RwLock<TelemetrySnapshot>>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_channel(&self, index: usize, reading: ChannelReading) {
        let mut state = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        state.channels.insert(channel_key(index), reading);
    }

    pub fn set_sensor(&self, name: &str, value: f64) {
        let mut state = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        state.sensors.insert(name.to_string(), value);
    }

    pub fn set_bus_alive(&self, alive: bool) {
        let mut state = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        state.bus_alive = alive;
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn starts_empty() {
        let snapshot = TelemetryStore::new().snapshot();
        assert!(snapshot.channels.is_empty());
        assert!(snapshot.sensors.is_empty());
        assert!(!snapshot.bus_alive);
    }

    #[test]
    fn last_write_wins_per_field() {
        let store = TelemetryStore::new();
        store.set_channel(0, ChannelReading::Voltage(1.0));
        store.set_channel(0, ChannelReading::Voltage(2.5));
        store.set_sensor("Temperature", 21.0);
        store.set_bus_alive(true);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.channel(0), Some(ChannelReading::Voltage(2.5)));
        assert_eq!(snapshot.sensor("Temperature"), Some(21.0));
        assert!(snapshot.bus_alive);
    }

    #[test]
    fn snapshot_is_detached_copy() {
        let store = TelemetryStore::new();
        store.set_sensor("Humidity", 40.0);
        let before = store.snapshot();
        store.set_sensor("Humidity", 55.0);
        assert_eq!(before.sensor("Humidity"), Some(40.0));
        assert_eq!(store.snapshot().sensor("Humidity"), Some(55.0));
    }

    #[test]
    fn concurrent_writers_do_not_clobber_each_other() {
        let store = TelemetryStore::new();
        let writers: Vec<_> = (0..6)
            .map(|index| {
                let store = store.clone();
                thread::spawn(move || {
                    for i in 0..500 {
                        store.set_channel(index, ChannelReading::Voltage((index * 1000 + i) as f64));
                    }
                })
            })
            .collect();

        // Readers only ever see values some writer committed for that channel.
        for _ in 0..200 {
            let snapshot = store.snapshot();
            for (key, reading) in &snapshot.channels {
                let index: usize = key.trim_start_matches("channel_").parse().unwrap();
                let value = reading.value() as usize;
                assert_eq!(value / 1000, index);
            }
        }

        for writer in writers {
            writer.join().unwrap();
        }
        let snapshot = store.snapshot();
        for index in 0..6 {
            assert_eq!(snapshot.channel(index), Some(ChannelReading::Voltage((index * 1000 + 499) as f64)));
        }
    }

    #[test]
    fn serializes_in_consumer_shape() {
        let store = TelemetryStore::new();
        store.set_channel(0, ChannelReading::Voltage(5.49));
        store.set_channel(4, ChannelReading::Resistance(102.3));
        store.set_sensor("Temperature", 0.16);
        let json = serde_json::to_value(store.snapshot()).unwrap();
        assert_eq!(json["channels"]["channel_0"]["voltage"], 5.49);
        assert_eq!(json["channels"]["channel_4"]["resistance"], 102.3);
        assert_eq!(json["sensors"]["Temperature"], 0.16);
        assert_eq!(json["bus_alive"], false);
    }
}
