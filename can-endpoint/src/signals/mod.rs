//! Signal database and DBC parser
//!
//! This module contains the DBC file parser and the signal database that
//! maps frame ids to message layouts.

pub mod database;
pub mod dbc;

// Re-export key types for convenience
pub use database::{
    ByteOrder, DatabaseStats, MessageSpec, SignalDatabase, SignalSpec, ValueType,
};
