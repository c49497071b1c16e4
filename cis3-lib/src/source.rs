//! Raw ADC sample sources.
//!
//! On the CIS3 board the MCP3008 is bound to the Linux `mcp320x` IIO
//! driver, which exposes each channel as
//! `/sys/bus/iio/devices/iio:deviceN/in_voltageC_raw`.

use crate::error::BridgeError;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// Supplies one raw 10-bit sample per channel on demand.
pub trait SampleSource: Send {
    fn read_raw(&mut self, channel: usize) -> Result<u16, BridgeError>;
}

pub const IIO_DEVICES_ROOT: &str = "/sys/bus/iio/devices";

/// Reads samples from a Linux IIO ADC device through sysfs.
#[derive(Debug, Clone)]
pub struct IioSampleSource {
    device_dir: PathBuf,
}

impl IioSampleSource {
    /// Open `iio:device{index}` under the standard sysfs root.
    pub fn open(index: u32) -> Result<Self, BridgeError> {
        Self::with_dir(PathBuf::from(IIO_DEVICES_ROOT).join(format!("iio:device{index}")))
    }

    pub fn with_dir(device_dir: impl Into<PathBuf>) -> Result<Self, BridgeError> {
        let device_dir = device_dir.into();
        if !device_dir.is_dir() {
            return Err(BridgeError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("IIO device directory {} not found", device_dir.display()),
            )));
        }
        Ok(Self { device_dir })
    }

    fn channel_path(&self, channel: usize) -> PathBuf {
        self.device_dir.join(format!("in_voltage{channel}_raw"))
    }
}

impl SampleSource for IioSampleSource {
    fn read_raw(&mut self, channel: usize) -> Result<u16, BridgeError> {
        // MCP3008 has eight single-ended inputs.
        if channel > 7 {
            return Err(BridgeError::InvalidChannel(channel));
        }
        let text = fs::read_to_string(self.channel_path(channel))?;
        let raw = text.trim().parse::<u16>().map_err(|e| {
            BridgeError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("channel {channel}: unparsable sample {:?}: {e}", text.trim()),
            ))
        })?;
        debug!(channel, raw, "IIO sample");
        Ok(raw)
    }
}

/// Deterministic source for running without hardware.
///
/// Each channel follows a triangle wave of `amplitude` counts around its
/// base value, advancing one step per read.
#[derive(Debug, Clone)]
pub struct SimulatedSource {
    base: Vec<u16>,
    amplitude: u16,
    step: Vec<u16>,
}

impl SimulatedSource {
    pub fn new(base: Vec<u16>, amplitude: u16) -> Self {
        let step = vec![0; base.len()];
        Self { base, amplitude, step }
    }

    /// Plausible bench values: a few volts on 0..3, a few hundred ohms on 4..5.
    pub fn bench_defaults() -> Self {
        Self::new(vec![512, 310, 0, 1000, 90, 480], 4)
    }
}

impl SampleSource for SimulatedSource {
    fn read_raw(&mut self, channel: usize) -> Result<u16, BridgeError> {
        let base = *self.base.get(channel).ok_or(BridgeError::InvalidChannel(channel))?;
        let period = self.amplitude.saturating_mul(2).max(1);
        let step = &mut self.step[channel];
        *step = (*step + 1) % period;
        let offset = if *step <= self.amplitude { *step } else { period - *step };
        Ok(base.saturating_add(offset).min(1023))
    }
}
