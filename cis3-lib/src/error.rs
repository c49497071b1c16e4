use std::io;
use thiserror::Error;

/// The primary error type for the `cis3-lib` library.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid ADC channel {0}")]
    InvalidChannel(usize),

    #[error("No response for PID 0x{pid:02X} within {waited_ms} ms")]
    Timeout { pid: u8, waited_ms: u64 },

    #[error("Checksum mismatch for PID 0x{pid:02X}: expected 0x{expected:02X}, received 0x{received:02X}")]
    ChecksumMismatch { pid: u8, expected: u8, received: u8 },

    #[error("Invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled by shutdown")]
    Cancelled,
}
