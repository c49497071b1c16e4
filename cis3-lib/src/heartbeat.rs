//! Bus liveness: `bus_alive` is true while frames keep arriving.
//!
//! On the board the monitored bus is CAN, read through SocketCAN. Frame
//! contents are ignored; any frame inside the listen window counts.

use crate::config::HeartbeatConfig;
use crate::error::BridgeError;
use crate::store::TelemetryStore;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, trace};

/// Anything that can tell whether the monitored bus carried traffic.
pub trait BusListener: Send {
    /// Block for up to `timeout`; `Ok(true)` if a frame was seen.
    fn wait_for_frame(&mut self, timeout: Duration) -> Result<bool, BridgeError>;
}

/// Turns listener results into the `bus_alive` flag.
pub struct Heartbeat<L: BusListener> {
    listener: L,
    store: TelemetryStore,
    timeout: Duration,
    pause: Duration,
    last: Option<bool>,
}

impl<L: BusListener> Heartbeat<L> {
    pub fn new(listener: L, config: &HeartbeatConfig, store: TelemetryStore) -> Self {
        Self {
            listener,
            store,
            timeout: Duration::from_millis(config.timeout_ms),
            pause: Duration::from_millis(config.pause_ms),
            last: None,
        }
    }

    pub fn pause(&self) -> Duration {
        self.pause
    }

    /// One listen window. Errors count as a dead bus.
    pub fn check(&mut self) -> bool {
        let alive = match self.listener.wait_for_frame(self.timeout) {
            Ok(seen) => seen,
            Err(e) => {
                error!("Error receiving bus traffic: {e}");
                false
            }
        };
        if self.last != Some(alive) {
            info!("Bus status: {}", if alive { "ON" } else { "OFF" });
            self.last = Some(alive);
        } else {
            debug!(alive, "Bus heartbeat");
        }
        self.store.set_bus_alive(alive);
        alive
    }
}

/// Listens on a SocketCAN interface such as `can0`.
#[cfg(target_os = "linux")]
pub struct SocketCanListener {
    socket: socketcan::CanSocket,
    interface: String,
}

#[cfg(target_os = "linux")]
impl SocketCanListener {
    pub fn open(interface: &str) -> Result<Self, BridgeError> {
        use socketcan::Socket;

        let socket = socketcan::CanSocket::open(interface)?;
        info!("CAN interface {} opened.", interface);
        Ok(Self {
            socket,
            interface: interface.to_string(),
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }
}

#[cfg(target_os = "linux")]
impl BusListener for SocketCanListener {
    fn wait_for_frame(&mut self, timeout: Duration) -> Result<bool, BridgeError> {
        use socketcan::Socket;
        use std::io::ErrorKind;

        match self.socket.read_frame_timeout(timeout) {
            Ok(_frame) => {
                trace!(interface = %self.interface, "CAN frame received");
                Ok(true)
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Emits a frame every `period`, optionally going quiet after `frames`.
#[derive(Debug, Clone)]
pub struct SimulatedBus {
    period: Duration,
    remaining: Option<u64>,
}

impl SimulatedBus {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            remaining: None,
        }
    }

    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.remaining = Some(frames);
        self
    }
}

impl BusListener for SimulatedBus {
    fn wait_for_frame(&mut self, timeout: Duration) -> Result<bool, BridgeError> {
        match self.remaining {
            Some(0) => {
                thread::sleep(timeout);
                Ok(false)
            }
            _ if self.period > timeout => {
                thread::sleep(timeout);
                Ok(false)
            }
            _ => {
                thread::sleep(self.period);
                if let Some(n) = self.remaining.as_mut() {
                    *n -= 1;
                }
                Ok(true)
            }
        }
    }
}
