//! Core types for the CAN endpoint library
//!
//! This module defines the raw frame type exchanged with the transport layer
//! and the library-wide error enum. Signal-level types live in [`crate::signals`].

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;

/// Timestamp type used for received-frame bookkeeping
pub type Timestamp = DateTime<Utc>;

/// Result type for endpoint operations
pub type Result<T> = std::result::Result<T, EndpointError>;

/// Signal name → physical value mapping, as read from and written to frames
pub type SignalValues = HashMap<String, f64>;

/// Largest standard (11-bit) CAN identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Largest extended (29-bit) CAN identifier
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// Maximum payload length of a classic CAN frame
pub const MAX_FRAME_LEN: usize = 8;

/// A raw CAN frame: identifier, payload bytes, extended-ID flag.
///
/// Immutable value once constructed; every encode of a message builds a
/// fresh frame rather than patching an existing one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    /// CAN identifier (11-bit standard or 29-bit extended)
    pub id: u32,
    /// True if this is an extended (29-bit) identifier
    pub extended: bool,
    /// Payload bytes (0-8 for classic CAN)
    pub data: Vec<u8>,
}

impl CanFrame {
    /// Create a standard-ID frame. The id is masked to 11 bits and the
    /// payload truncated to 8 bytes.
    pub fn new(id: u32, data: Vec<u8>) -> Self {
        let mut data = data;
        data.truncate(MAX_FRAME_LEN);
        Self {
            id: id & MAX_STANDARD_ID,
            extended: false,
            data,
        }
    }

    /// Create an extended-ID frame. The id is masked to 29 bits and the
    /// payload truncated to 8 bytes.
    pub fn new_extended(id: u32, data: Vec<u8>) -> Self {
        let mut data = data;
        data.truncate(MAX_FRAME_LEN);
        Self {
            id: id & MAX_EXTENDED_ID,
            extended: true,
            data,
        }
    }

    /// Create a frame with the extended flag chosen by the caller.
    pub fn with_id_flag(id: u32, extended: bool, data: Vec<u8>) -> Self {
        if extended {
            Self::new_extended(id, data)
        } else {
            Self::new(id, data)
        }
    }

    /// Get the data length code (DLC) - number of data bytes
    pub fn dlc(&self) -> usize {
        self.data.len()
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X} [{}]", self.id, self.dlc())?;
        for byte in &self.data {
            write!(f, " {:02X}", byte)?;
        }
        Ok(())
    }
}

/// A received frame together with the time it was seen, as kept by the
/// engine's last-seen recording.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedFrame {
    /// The frame as it arrived from the bus
    pub frame: CanFrame,
    /// When the receive loop pulled it from the transport
    pub timestamp: Timestamp,
}

/// Errors that can occur across the endpoint
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("No frame with ID 0x{0:X} in the signal database")]
    UnknownFrameId(u32),

    #[error("Frame 0x{id:X} has no signal named '{signal}'")]
    UnknownSignal { id: u32, signal: String },

    #[error("Signal '{signal}' value {value} outside declared range [{min}, {max}]")]
    OutOfRange {
        signal: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Failed to encode frame 0x{id:X}: {reason}")]
    EncodeFailure { id: u32, reason: String },

    #[error("Periodic task for frame 0x{0:X} is already scheduled")]
    AlreadyScheduled(u32),

    #[error("No periodic task scheduled for frame 0x{0:X}")]
    NotScheduled(u32),

    #[error("Periodic task for frame 0x{0:X} has already been stopped")]
    AlreadyStopped(u32),

    #[error("Periodic task for frame 0x{0:X} is currently running")]
    AlreadyRunning(u32),

    #[error("Last-seen recording was not enabled at construction")]
    RecordingDisabled,

    #[error("No identifier filter configured; bus left in receive-all mode")]
    FilterNotConfigured,

    #[error("Failed to parse DBC file: {0}")]
    DbcParse(String),

    #[error("Invalid frame ID string '{0}'")]
    InvalidFrameId(String),

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Bus closed")]
    BusClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EndpointError {
    /// True if this error is the normal end-of-traffic signal from the
    /// transport, as opposed to an actual failure.
    pub fn is_closed(&self) -> bool {
        matches!(self, EndpointError::BusClosed)
    }
}
