//! CAN Bus Endpoint Library
//!
//! Simulates one node on a CAN bus: it periodically transmits a configured
//! bundle of messages, reacts to value changes from the application and
//! records the traffic it receives. Signal layouts come from DBC files;
//! message values are persisted between runs as JSON value files.
//!
//! # Architecture
//!
//! - [`MessageManager`] is the application-facing facade: load a DBC and an
//!   initial-values file, start, modify signal values, stop.
//! - [`Transceiver`] runs one cyclic transmission task per frame id plus a
//!   background receive loop; it drives any [`CanBus`] transport.
//! - [`SocketCanBus`] talks to Linux SocketCAN; [`VirtualBus`] is an
//!   in-memory loopback pair used by the tests.
//!
//! The library does NOT:
//! - Bring the CAN interface up or set its bitrate (that stays with the
//!   system configuration)
//! - Interpret transport protocols layered above raw frames
//!
//! # Example Usage
//!
//! ```no_run
//! use can_endpoint::{BusConfig, ManagerConfig, MessageManager, SignalValues};
//! use std::time::Duration;
//!
//! let config = ManagerConfig::new("powertrain.dbc", "initial_values.json")
//!     .with_bus(BusConfig::new("can0"))
//!     .with_default_period(Duration::from_millis(500))
//!     .add_target_name("GTW")
//!     .with_recording(true);
//!
//! let manager = MessageManager::open(config).unwrap();
//! manager.start();
//!
//! let mut values = SignalValues::new();
//! values.insert("BatteryVoltage".to_string(), 12.6);
//! manager.modify("0x101", &values, false).unwrap();
//!
//! manager.stop().unwrap();
//! ```

// Public modules
pub mod bus;
pub mod config;
pub mod manager;
pub mod message;
pub mod signals;
pub mod store;
pub mod transceiver;
pub mod types;

// Re-export main types for convenience
pub use bus::{CanBus, CanIdFilter, CyclicTask, SocketCanBus, VirtualBus};
pub use config::{BusConfig, ManagerConfig, TransceiverConfig};
pub use manager::MessageManager;
pub use message::TxMessage;
pub use signals::{
    ByteOrder, DatabaseStats, MessageSpec, SignalDatabase, SignalSpec, ValueType,
};
pub use store::ValueStore;
pub use transceiver::{FrameCallback, Transceiver};
pub use types::{CanFrame, EndpointError, ReceivedFrame, Result, SignalValues};

// Internal modules (not exposed in public API)
mod codec;

pub use codec::EncodeOptions;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
