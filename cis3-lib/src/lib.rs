pub mod conditioning;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod lin;
pub mod publish;
pub mod scheduler;
pub mod serial;
pub mod source;
pub mod store;

// Re-export the types every binary touches
pub use config::BridgeConfig;
pub use error::BridgeError;
pub use lin::{LinMaster, PidOutcome};
pub use scheduler::Scheduler;
pub use store::{ChannelReading, TelemetrySnapshot, TelemetryStore};
