//! Unified signal database
//!
//! Holds message layouts keyed by frame id and provides lookups used by the
//! transmit and receive paths. Layouts are normally loaded from a DBC file
//! but can also be built programmatically, which the tests rely on.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::codec::{self, EncodeOptions};
use crate::types::{EndpointError, Result, SignalValues};

/// Byte order of a signal within the frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Intel format, start bit is the LSB
    LittleEndian,
    /// Motorola format, start bit is the MSB
    BigEndian,
}

/// Value type of the raw signal bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Unsigned,
    Signed,
}

/// Definition of a single signal within a message
#[derive(Debug, Clone)]
pub struct SignalSpec {
    /// Signal name, unique within its message
    pub name: String,
    /// Start bit position within the frame
    pub start_bit: u16,
    /// Length in bits
    pub length: u16,
    /// Byte order (Intel or Motorola)
    pub byte_order: ByteOrder,
    /// Signed or unsigned raw value
    pub value_type: ValueType,
    /// Scaling factor (physical = offset + factor * raw)
    pub factor: f64,
    /// Scaling offset
    pub offset: f64,
    /// Minimum physical value, `None` when the definition gives no bound
    pub min: Option<f64>,
    /// Maximum physical value, `None` when the definition gives no bound
    pub max: Option<f64>,
    /// Physical unit, if any
    pub unit: Option<String>,
}

impl SignalSpec {
    /// Check a physical value against the declared bounds.
    ///
    /// A missing bound does not constrain the value, so a signal without
    /// declared limits accepts everything.
    pub fn in_range(&self, value: f64) -> bool {
        if let Some(min) = self.min {
            if value < min {
                return false;
            }
        }
        if let Some(max) = self.max {
            if value > max {
                return false;
            }
        }
        true
    }

    /// Initial value for this signal when none was supplied: the declared
    /// minimum, or zero without one.
    pub fn default_value(&self) -> f64 {
        self.min.unwrap_or(0.0)
    }
}

/// Definition of a CAN message (frame layout)
#[derive(Debug, Clone)]
pub struct MessageSpec {
    /// Frame id without the extended flag bit
    pub id: u32,
    /// Message name
    pub name: String,
    /// Frame payload size in bytes
    pub size: usize,
    /// True for 29-bit extended ids
    pub extended: bool,
    /// Transmission period from the database, `None` for event messages
    pub cycle_time: Option<Duration>,
    /// Nodes that transmit this message
    pub senders: Vec<String>,
    /// Signals carried by this message
    pub signals: Vec<SignalSpec>,
}

impl MessageSpec {
    /// Look up a signal by name
    pub fn signal(&self, name: &str) -> Option<&SignalSpec> {
        self.signals.iter().find(|s| s.name == name)
    }

    /// True if the given node is listed as a transmitter of this message
    pub fn has_sender(&self, node: &str) -> bool {
        self.senders.iter().any(|s| s == node)
    }

    /// Encode a value map into frame bytes with the given options
    pub fn encode(&self, values: &SignalValues, options: EncodeOptions) -> Result<Vec<u8>> {
        codec::encode_signals(self, values, options).map_err(|reason| {
            EndpointError::EncodeFailure {
                id: self.id,
                reason,
            }
        })
    }

    /// Encode with full validation, falling back to raw truncating mode if
    /// the strict pass fails numerically.
    ///
    /// Returns [`EndpointError::EncodeFailure`] only when both passes fail;
    /// in that case no frame bytes are produced.
    pub fn encode_with_fallback(&self, values: &SignalValues) -> Result<Vec<u8>> {
        match self.encode(values, EncodeOptions::strict()) {
            Ok(data) => Ok(data),
            Err(first) => {
                log::warn!(
                    "Strict encode failed for 0x{:X} ({}), retrying without scaling",
                    self.id,
                    first
                );
                self.encode(values, EncodeOptions::permissive())
            }
        }
    }

    /// Decode frame bytes into a value map
    pub fn decode(&self, data: &[u8]) -> SignalValues {
        codec::decode_signals(self, data)
    }

    /// Fill in defaults for any signal missing from the value map
    pub fn fill_defaults(&self, values: &mut SignalValues) {
        for signal in &self.signals {
            values
                .entry(signal.name.clone())
                .or_insert_with(|| signal.default_value());
        }
    }
}

/// Statistics about loaded message definitions
#[derive(Debug, Clone, Default)]
pub struct DatabaseStats {
    pub message_count: usize,
    pub signal_count: usize,
    pub cyclic_count: usize,
}

/// Database of message layouts keyed by frame id
#[derive(Debug, Clone, Default)]
pub struct SignalDatabase {
    messages: HashMap<u32, MessageSpec>,
}

impl SignalDatabase {
    /// Create an empty database
    pub fn new() -> Self {
        Self {
            messages: HashMap::new(),
        }
    }

    /// Load message definitions from a DBC file
    pub fn from_dbc_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut db = Self::new();
        for message in super::dbc::parse_dbc_file(path.as_ref())? {
            db.add_message(message);
        }
        Ok(db)
    }

    /// Parse message definitions from DBC text
    pub fn from_dbc_str(content: &str) -> Result<Self> {
        let mut db = Self::new();
        for message in super::dbc::parse_dbc_str(content)? {
            db.add_message(message);
        }
        Ok(db)
    }

    /// Add a message definition, replacing any existing layout for the id
    pub fn add_message(&mut self, message: MessageSpec) {
        if let Some(old) = self.messages.insert(message.id, message) {
            log::warn!("Replaced existing definition for frame 0x{:X}", old.id);
        }
    }

    /// Look up a message by frame id
    pub fn get(&self, id: u32) -> Option<&MessageSpec> {
        self.messages.get(&id)
    }

    /// Look up a message by frame id, failing if the id is not defined
    pub fn message_by_id(&self, id: u32) -> Result<&MessageSpec> {
        self.messages.get(&id).ok_or(EndpointError::UnknownFrameId(id))
    }

    /// Look up a message by name
    pub fn message_by_name(&self, name: &str) -> Option<&MessageSpec> {
        self.messages.values().find(|m| m.name == name)
    }

    /// Iterate over all message definitions
    pub fn messages(&self) -> impl Iterator<Item = &MessageSpec> {
        self.messages.values()
    }

    /// All defined frame ids, sorted for deterministic iteration
    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.messages.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Frame ids of messages transmitted by every one of the given nodes.
    ///
    /// An empty node list matches all messages. Ids are sorted.
    pub fn ids_sent_by_all(&self, nodes: &[String]) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .messages
            .values()
            .filter(|m| nodes.iter().all(|n| m.has_sender(n)))
            .map(|m| m.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Number of message definitions
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// True if no messages are loaded
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Get statistics about the loaded definitions
    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            message_count: self.messages.len(),
            signal_count: self.messages.values().map(|m| m.signals.len()).sum(),
            cyclic_count: self
                .messages
                .values()
                .filter(|m| m.cycle_time.is_some())
                .count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(name: &str, start_bit: u16, min: Option<f64>, max: Option<f64>) -> SignalSpec {
        SignalSpec {
            name: name.to_string(),
            start_bit,
            length: 8,
            byte_order: ByteOrder::LittleEndian,
            value_type: ValueType::Unsigned,
            factor: 1.0,
            offset: 0.0,
            min,
            max,
            unit: None,
        }
    }

    fn message(id: u32, name: &str, senders: &[&str]) -> MessageSpec {
        MessageSpec {
            id,
            name: name.to_string(),
            size: 8,
            extended: false,
            cycle_time: Some(Duration::from_millis(100)),
            senders: senders.iter().map(|s| s.to_string()).collect(),
            signals: vec![signal("Sig", 0, Some(0.0), Some(10.0))],
        }
    }

    #[test]
    fn test_add_and_lookup() {
        let mut db = SignalDatabase::new();
        db.add_message(message(0x101, "MsgA", &["ECU1"]));

        assert_eq!(db.len(), 1);
        assert_eq!(db.message_by_id(0x101).unwrap().name, "MsgA");
        assert!(db.message_by_name("MsgA").is_some());
        assert!(matches!(
            db.message_by_id(0x999),
            Err(EndpointError::UnknownFrameId(0x999))
        ));
    }

    #[test]
    fn test_in_range_with_partial_bounds() {
        let bounded = signal("Sig", 0, Some(0.0), Some(10.0));
        assert!(bounded.in_range(0.0));
        assert!(bounded.in_range(10.0));
        assert!(!bounded.in_range(-0.5));
        assert!(!bounded.in_range(10.5));

        let unbounded = signal("Sig", 0, None, None);
        assert!(unbounded.in_range(-1e12));
        assert!(unbounded.in_range(1e12));

        let min_only = signal("Sig", 0, Some(5.0), None);
        assert!(!min_only.in_range(4.9));
        assert!(min_only.in_range(1e12));
    }

    #[test]
    fn test_default_value_uses_minimum() {
        assert_eq!(signal("Sig", 0, Some(3.0), None).default_value(), 3.0);
        assert_eq!(signal("Sig", 0, None, None).default_value(), 0.0);
    }

    #[test]
    fn test_fill_defaults_keeps_supplied_values() {
        let mut msg = message(0x101, "MsgA", &["ECU1"]);
        msg.signals.push(signal("Other", 8, Some(2.0), None));

        let mut values = SignalValues::new();
        values.insert("Sig".to_string(), 7.0);
        msg.fill_defaults(&mut values);

        assert_eq!(values["Sig"], 7.0);
        assert_eq!(values["Other"], 2.0);
    }

    #[test]
    fn test_ids_sent_by_all_is_an_intersection() {
        let mut db = SignalDatabase::new();
        db.add_message(message(0x101, "MsgA", &["ECU1", "ECU2"]));
        db.add_message(message(0x102, "MsgB", &["ECU1"]));
        db.add_message(message(0x103, "MsgC", &["ECU2"]));

        let both = vec!["ECU1".to_string(), "ECU2".to_string()];
        assert_eq!(db.ids_sent_by_all(&both), vec![0x101]);

        let one = vec!["ECU1".to_string()];
        assert_eq!(db.ids_sent_by_all(&one), vec![0x101, 0x102]);

        // No filter nodes means every message qualifies
        assert_eq!(db.ids_sent_by_all(&[]), vec![0x101, 0x102, 0x103]);
    }

    #[test]
    fn test_encode_failure_carries_frame_id() {
        let msg = message(0x42, "MsgA", &["ECU1"]);
        let mut values = SignalValues::new();
        values.insert("Sig".to_string(), f64::INFINITY);

        match msg.encode(&values, EncodeOptions::strict()) {
            Err(EndpointError::EncodeFailure { id, .. }) => assert_eq!(id, 0x42),
            other => panic!("expected encode failure, got {:?}", other),
        }
    }

    #[test]
    fn test_stats() {
        let mut db = SignalDatabase::new();
        let mut event = message(0x201, "Event", &["ECU1"]);
        event.cycle_time = None;
        db.add_message(message(0x101, "MsgA", &["ECU1"]));
        db.add_message(event);

        let stats = db.stats();
        assert_eq!(stats.message_count, 2);
        assert_eq!(stats.signal_count, 2);
        assert_eq!(stats.cyclic_count, 1);
    }
}
