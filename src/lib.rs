//! # Sinapsi - Alfa energy meter poller and load controller
//!
//! Polls a Sinapsi Alfa meter over Modbus TCP, decodes its holding registers
//! into telemetry and drives a priority based load-shedding controller from
//! that telemetry.
//!
//! ## Architecture
//!
//! - `registers`: register map and read groups
//! - `decode`: word decoding and telemetry assembly
//! - `modbus`: transport seam and the Modbus TCP transport
//! - `connection`: connection state machine and serialized operation queue
//! - `telemetry`: telemetry model and the deduplicating reader
//! - `controller`: load decisions and the control loop
//! - `publisher`: periodic telemetry output
//! - `messages`: outbound/inbound messages and status indicators
//! - `scheduler`: cancellable skip-if-busy periodic tasks
//! - `config`, `logging`, `error`: ambient plumbing

pub mod config;
pub mod connection;
pub mod controller;
pub mod decode;
pub mod error;
pub mod logging;
pub mod messages;
pub mod modbus;
pub mod publisher;
pub mod registers;
pub mod scheduler;
pub mod telemetry;

// Re-export commonly used types
pub use config::Config;
pub use connection::ConnectionManager;
pub use error::{Result, SinapsiError};
pub use telemetry::{Telemetry, TelemetryReader};
