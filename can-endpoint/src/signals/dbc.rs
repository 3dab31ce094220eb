//! DBC file parser
//!
//! Parses Vector DBC files and converts them into the message layouts used
//! by the endpoint. Cycle times come from the `GenMsgCycleTime` message
//! attribute; a value of zero (the DBC convention for "not cyclic") leaves
//! the message without a period.

use crate::signals::database::{ByteOrder, MessageSpec, SignalSpec, ValueType};
use crate::types::{EndpointError, Result, MAX_EXTENDED_ID};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Bit 31 of a raw DBC message id marks an extended (29-bit) frame
const EXTENDED_ID_FLAG: u32 = 0x8000_0000;

/// Parse a DBC file and return message definitions
pub fn parse_dbc_file(path: &Path) -> Result<Vec<MessageSpec>> {
    log::info!("Parsing DBC file: {:?}", path);

    // Read the DBC file as bytes first (handle non-UTF8 encodings)
    let bytes = std::fs::read(path)
        .map_err(|e| EndpointError::DbcParse(format!("Failed to read file {:?}: {}", path, e)))?;

    // Try UTF-8 first, then fall back to Latin-1/Windows-1252 encoding
    let content = match String::from_utf8(bytes) {
        Ok(content) => content,
        Err(err) => {
            log::warn!("DBC file is not UTF-8, trying Latin-1 encoding");
            err.into_bytes().iter().map(|&b| b as char).collect()
        }
    };

    let messages = parse_dbc_str(&content)?;

    log::info!("Parsed {} messages from {:?}", messages.len(), path);

    Ok(messages)
}

/// Parse DBC text and return message definitions
pub fn parse_dbc_str(content: &str) -> Result<Vec<MessageSpec>> {
    let dbc = can_dbc::DBC::from_slice(content.as_bytes())
        .map_err(|e| EndpointError::DbcParse(format!("Failed to parse DBC: {:?}", e)))?;

    let cycle_times = extract_cycle_times(content);

    let mut messages = Vec::new();
    for dbc_msg in dbc.messages() {
        messages.push(convert_message(&dbc, dbc_msg, &cycle_times));
    }

    Ok(messages)
}

/// Convert a can-dbc message into a MessageSpec
fn convert_message(
    dbc: &can_dbc::DBC,
    dbc_msg: &can_dbc::Message,
    cycle_times: &HashMap<u32, Duration>,
) -> MessageSpec {
    let raw_id = dbc_msg.message_id().0;
    let extended = raw_id & EXTENDED_ID_FLAG != 0;
    let id = raw_id & MAX_EXTENDED_ID;

    let mut signals = Vec::new();
    let mut multiplexed = false;

    for dbc_sig in dbc_msg.signals() {
        if !matches!(
            dbc_sig.multiplexer_indicator(),
            can_dbc::MultiplexIndicator::Plain
        ) {
            multiplexed = true;
        }
        signals.push(convert_signal(dbc_sig));
    }

    if multiplexed {
        log::warn!(
            "Message '{}' (0x{:X}) uses multiplexing; all signals treated as plain",
            dbc_msg.message_name(),
            id
        );
    }

    MessageSpec {
        id,
        name: dbc_msg.message_name().to_string(),
        size: *dbc_msg.message_size() as usize,
        extended,
        cycle_time: cycle_times.get(&id).copied(),
        senders: collect_senders(dbc, dbc_msg),
        signals,
    }
}

/// Gather the transmitting nodes for a message.
///
/// The BO_ line names one transmitter; additional senders may appear in
/// BO_TX_BU_ entries. Vector placeholder nodes are skipped.
fn collect_senders(dbc: &can_dbc::DBC, dbc_msg: &can_dbc::Message) -> Vec<String> {
    let mut senders = Vec::new();

    if let can_dbc::Transmitter::NodeName(name) = dbc_msg.transmitter() {
        senders.push(name.to_string());
    }

    for entry in dbc.message_transmitters() {
        if entry.message_id().0 != dbc_msg.message_id().0 {
            continue;
        }
        for transmitter in entry.transmitter() {
            if let can_dbc::Transmitter::NodeName(name) = transmitter {
                if !senders.iter().any(|s| s == name) {
                    senders.push(name.to_string());
                }
            }
        }
    }

    senders
}

/// Convert a can-dbc signal into a SignalSpec
fn convert_signal(dbc_sig: &can_dbc::Signal) -> SignalSpec {
    let byte_order = match *dbc_sig.byte_order() {
        can_dbc::ByteOrder::LittleEndian => ByteOrder::LittleEndian,
        can_dbc::ByteOrder::BigEndian => ByteOrder::BigEndian,
    };

    let value_type = match *dbc_sig.value_type() {
        can_dbc::ValueType::Signed => ValueType::Signed,
        can_dbc::ValueType::Unsigned => ValueType::Unsigned,
    };

    // A DBC range of [0|0] means "no declared range"
    let (min, max) = if *dbc_sig.min() == 0.0 && *dbc_sig.max() == 0.0 {
        (None, None)
    } else {
        (Some(*dbc_sig.min()), Some(*dbc_sig.max()))
    };

    SignalSpec {
        name: dbc_sig.name().to_string(),
        start_bit: *dbc_sig.start_bit() as u16,
        length: *dbc_sig.signal_size() as u16,
        byte_order,
        value_type,
        factor: *dbc_sig.factor(),
        offset: *dbc_sig.offset(),
        min,
        max,
        unit: if dbc_sig.unit().is_empty() {
            None
        } else {
            Some(dbc_sig.unit().to_string())
        },
    }
}

/// Extract per-message cycle times from `GenMsgCycleTime` attribute lines.
///
/// The attribute line format is stable across DBC exporters:
/// `BA_ "GenMsgCycleTime" BO_ <message id> <milliseconds>;`
fn extract_cycle_times(content: &str) -> HashMap<u32, Duration> {
    // TODO: can-dbc v5.0 attribute value API needs investigation before
    // this scan can move onto the parsed representation
    let mut cycle_times = HashMap::new();

    for line in content.lines() {
        let rest = match line.trim().strip_prefix("BA_ \"GenMsgCycleTime\" BO_ ") {
            Some(rest) => rest.trim_end_matches(';').trim(),
            None => continue,
        };

        let mut parts = rest.split_whitespace();
        let id_str = parts.next();
        let ms_str = parts.next();

        if let (Some(id_str), Some(ms_str)) = (id_str, ms_str) {
            if let (Ok(id), Ok(ms)) = (id_str.parse::<u32>(), ms_str.parse::<f64>()) {
                if ms > 0.0 {
                    cycle_times
                        .insert(id & MAX_EXTENDED_ID, Duration::from_millis(ms.round() as u64));
                }
            }
        }
    }

    cycle_times
}
