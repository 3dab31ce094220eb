//! Endpoint configuration types
//!
//! Plain builder-style structs consumed by the library. File-based
//! configuration (TOML) lives in the CLI crate and converts into these.

use std::path::PathBuf;
use std::time::Duration;

/// Default SocketCAN channel
pub const DEFAULT_CHANNEL: &str = "vcan0";

/// Default bus bitrate in bits per second
pub const DEFAULT_BITRATE: u32 = 500_000;

/// Default transmission period for messages without a declared cycle time
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(500);

/// Physical bus parameters for the SocketCAN transport
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Interface name (e.g. "can0", "vcan0")
    pub channel: String,
    /// Nominal bitrate in bits per second. Informational on SocketCAN:
    /// the kernel interface carries the real setting.
    pub bitrate: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            channel: DEFAULT_CHANNEL.to_string(),
            bitrate: DEFAULT_BITRATE,
        }
    }
}

impl BusConfig {
    /// Create a configuration for the given channel with the default bitrate
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ..Self::default()
        }
    }

    /// Builder method: set the bitrate
    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }
}

/// Configuration for the transceiver engine
#[derive(Debug, Clone, Default)]
pub struct TransceiverConfig {
    /// Identifiers allowed through to the receive loop. `None` leaves the
    /// bus unfiltered (receive-all); the engine logs a warning in that case.
    pub filter_ids: Option<Vec<u32>>,
    /// Keep the most recent frame per identifier while receiving
    pub record_last_frames: bool,
    /// Log every received frame at debug level
    pub log_frames: bool,
}

impl TransceiverConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: restrict reception to the given identifiers
    pub fn with_filter_ids(mut self, ids: Vec<u32>) -> Self {
        self.filter_ids = Some(ids);
        self
    }

    /// Builder method: enable last-seen recording
    pub fn with_recording(mut self, enabled: bool) -> Self {
        self.record_last_frames = enabled;
        self
    }

    /// Builder method: enable per-frame receive logging
    pub fn with_frame_logging(mut self, enabled: bool) -> Self {
        self.log_frames = enabled;
        self
    }
}

/// Configuration for the message manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Path to the DBC signal database
    pub dbc_path: PathBuf,
    /// Path to the persisted initial-values JSON file
    pub initial_values_path: PathBuf,
    /// Where to persist last-modified values on stop. `None` disables
    /// persistence.
    pub save_values_path: Option<PathBuf>,
    /// Bus parameters, used by [`crate::manager::MessageManager::open`]
    pub bus: BusConfig,
    /// Period for messages without a declared cycle time
    pub default_period: Duration,
    /// Restrict reception to frames whose declared sender set contains ALL
    /// of these node names. Empty means no filtering.
    pub target_names: Vec<String>,
    /// Keep the most recent received frame per identifier
    pub record_last_frames: bool,
    /// Log received and modified frames at debug level
    pub log_frames: bool,
}

impl ManagerConfig {
    /// Create a configuration from the two mandatory file paths
    pub fn new(dbc_path: impl Into<PathBuf>, initial_values_path: impl Into<PathBuf>) -> Self {
        Self {
            dbc_path: dbc_path.into(),
            initial_values_path: initial_values_path.into(),
            save_values_path: None,
            bus: BusConfig::default(),
            default_period: DEFAULT_PERIOD,
            target_names: Vec::new(),
            record_last_frames: false,
            log_frames: false,
        }
    }

    /// Builder method: persist last-modified values to this path on stop
    pub fn with_save_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.save_values_path = Some(path.into());
        self
    }

    /// Builder method: set the bus parameters
    pub fn with_bus(mut self, bus: BusConfig) -> Self {
        self.bus = bus;
        self
    }

    /// Builder method: set the fallback transmission period
    pub fn with_default_period(mut self, period: Duration) -> Self {
        self.default_period = period;
        self
    }

    /// Builder method: add a target node name to the sender filter
    pub fn add_target_name(mut self, name: impl Into<String>) -> Self {
        self.target_names.push(name.into());
        self
    }

    /// Builder method: enable last-seen recording
    pub fn with_recording(mut self, enabled: bool) -> Self {
        self.record_last_frames = enabled;
        self
    }

    /// Builder method: enable per-frame logging
    pub fn with_frame_logging(mut self, enabled: bool) -> Self {
        self.log_frames = enabled;
        self
    }

    /// The engine configuration implied by this manager configuration.
    /// Filter ids are derived separately from the target names.
    pub fn transceiver_config(&self, filter_ids: Option<Vec<u32>>) -> TransceiverConfig {
        TransceiverConfig {
            filter_ids,
            record_last_frames: self.record_last_frames,
            log_frames: self.log_frames,
        }
    }
}
