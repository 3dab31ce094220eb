//! Signal value persistence
//!
//! JSON maps keyed by hexadecimal frame id, one value map per frame:
//! `{"0x101": {"SigA": 1.0}, "0x201": {"Mode": 2.0}}`. The manager loads a
//! store once at construction and writes the last-modified values wholesale
//! when it stops.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use crate::types::{EndpointError, Result, SignalValues};

/// Per-frame value maps keyed by frame id
pub type ValueStore = HashMap<u32, SignalValues>;

/// Parse a frame id string such as `0x101`; the `0x` prefix is optional
pub fn parse_frame_id(text: &str) -> Result<u32> {
    let digits = text
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    u32::from_str_radix(digits, 16).map_err(|_| EndpointError::InvalidFrameId(text.to_string()))
}

/// Format a frame id the way the store keys it
pub fn format_frame_id(id: u32) -> String {
    format!("0x{:x}", id)
}

/// Load a value store from a JSON file
pub fn load_values<P: AsRef<Path>>(path: P) -> Result<ValueStore> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    let raw: HashMap<String, SignalValues> = serde_json::from_str(&content)?;

    let mut store = ValueStore::new();
    for (key, values) in raw {
        let id = parse_frame_id(&key)?;
        store.insert(id, values);
    }

    log::info!(
        "Loaded initial values for {} frames from {:?}",
        store.len(),
        path
    );
    Ok(store)
}

/// Write a value store to a JSON file, replacing any existing content.
///
/// Keys come out sorted so saved files diff cleanly between runs.
pub fn save_values<P: AsRef<Path>>(path: P, store: &ValueStore) -> Result<()> {
    let path = path.as_ref();

    let mut raw: BTreeMap<String, &SignalValues> = BTreeMap::new();
    for (id, values) in store {
        raw.insert(format_frame_id(*id), values);
    }

    let content = serde_json::to_string_pretty(&raw)?;
    fs::write(path, content)?;

    log::info!("Saved values for {} frames to {:?}", store.len(), path);
    Ok(())
}
