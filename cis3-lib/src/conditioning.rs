//! Analog signal conditioning: raw counts to filtered engineering units.
//!
//! Each tick a channel goes through
//!
//! ```text
//! raw ──► units ──► moving average (window) ──► EMA ──► noise gate ──► store
//! ```
//!
//! The moving average and the EMA are deliberately cascaded. The noise gate
//! only applies to voltage channels and clamps the EMA state itself, so a
//! gated channel restarts its EMA from zero.

use crate::config::{AdcConfig, ChannelConfig, UnitKind};
use crate::error::BridgeError;
use crate::source::SampleSource;
use crate::store::{ChannelReading, TelemetryStore};
use std::collections::VecDeque;
use tracing::{debug, error, warn};

/// Converter constants shared by every channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub vref: f64,
    pub resolution: f64,
    pub voltage_multiplier: f64,
    pub resistance_reference: f64,
    pub voltage_threshold: f64,
}

impl From<&AdcConfig> for Calibration {
    fn from(config: &AdcConfig) -> Self {
        Self {
            vref: config.vref,
            resolution: config.resolution,
            voltage_multiplier: config.voltage_multiplier,
            resistance_reference: config.resistance_reference,
            voltage_threshold: config.voltage_threshold,
        }
    }
}

impl Calibration {
    pub fn raw_to_voltage(&self, raw: u16) -> f64 {
        (raw as f64 / self.resolution) * self.vref * self.voltage_multiplier
    }

    /// Divider resistance in tens of ohms; a zero reading means an open input.
    pub fn raw_to_resistance(&self, raw: u16) -> f64 {
        if raw == 0 {
            return 0.0;
        }
        ((self.resistance_reference * (self.resolution - raw as f64)) / raw as f64) / 10.0
    }

    pub fn convert(&self, kind: UnitKind, raw: u16) -> f64 {
        match kind {
            UnitKind::Voltage => self.raw_to_voltage(raw),
            UnitKind::Resistance => self.raw_to_resistance(raw),
        }
    }
}

/// Filter state of one analog input.
#[derive(Debug, Clone)]
pub struct Channel {
    index: usize,
    kind: UnitKind,
    alpha: f64,
    capacity: usize,
    window: VecDeque<f64>,
    ema: Option<f64>,
}

impl Channel {
    pub fn new(index: usize, config: &ChannelConfig) -> Self {
        let capacity = config.window();
        Self {
            index,
            kind: config.kind,
            alpha: config.alpha(),
            capacity,
            window: VecDeque::with_capacity(capacity),
            ema: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn ema(&self) -> Option<f64> {
        self.ema
    }

    /// Push a converted sample and return the window mean.
    pub fn push(&mut self, value: f64) -> f64 {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    /// Feed the moving average into the EMA and return the new EMA.
    pub fn smooth(&mut self, moving_average: f64) -> f64 {
        let next = match self.ema {
            None => moving_average,
            Some(previous) => self.alpha * moving_average + (1.0 - self.alpha) * previous,
        };
        self.ema = Some(next);
        next
    }

    /// Clamp the EMA state to zero when it falls below `threshold`.
    pub fn gate(&mut self, threshold: f64) -> f64 {
        match self.ema {
            Some(value) if value < threshold => {
                self.ema = Some(0.0);
                0.0
            }
            Some(value) => value,
            None => 0.0,
        }
    }
}

/// Round to two decimals for publishing.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Samples, filters and commits every configured channel.
pub struct ConditioningPipeline<S: SampleSource> {
    source: S,
    calibration: Calibration,
    channels: Vec<Channel>,
    store: TelemetryStore,
}

impl<S: SampleSource> ConditioningPipeline<S> {
    pub fn new(source: S, config: &AdcConfig, store: TelemetryStore) -> Self {
        let channels = config
            .channels
            .iter()
            .enumerate()
            .map(|(index, channel)| Channel::new(index, channel))
            .collect();
        Self {
            source,
            calibration: Calibration::from(config),
            channels,
            store,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, index: usize) -> Option<&Channel> {
        self.channels.get(index)
    }

    /// Run one conditioning step for `index` and commit the result.
    ///
    /// A failed hardware read is logged and processed as a zero sample; the
    /// only error returned is an index outside the configured channels.
    pub fn process(&mut self, index: usize) -> Result<ChannelReading, BridgeError> {
        let max_raw = self.calibration.resolution as u16;
        let channel = self.channels.get_mut(index).ok_or(BridgeError::InvalidChannel(index))?;

        let raw = match self.source.read_raw(index) {
            Ok(raw) if raw > max_raw => {
                warn!(channel = index, raw, "Sample above ADC resolution, clamping");
                max_raw
            }
            Ok(raw) => raw,
            Err(e) => {
                error!(channel = index, "Error reading ADC channel: {e}");
                0
            }
        };

        let converted = self.calibration.convert(channel.kind, raw);
        let moving_average = channel.push(converted);
        let mut filtered = channel.smooth(moving_average);
        if channel.kind == UnitKind::Voltage {
            filtered = channel.gate(self.calibration.voltage_threshold);
        }

        let reading = match channel.kind {
            UnitKind::Voltage => ChannelReading::Voltage(round2(filtered)),
            UnitKind::Resistance => ChannelReading::Resistance(round2(filtered)),
        };
        self.store.set_channel(index, reading);
        debug!(channel = index, raw, %reading, "Channel conditioned");
        Ok(reading)
    }

    /// One scheduler tick: every channel once.
    pub fn process_all(&mut self) {
        for index in 0..self.channels.len() {
            if let Err(e) = self.process(index) {
                error!("Conditioning failed: {e}");
            }
        }
    }
}
