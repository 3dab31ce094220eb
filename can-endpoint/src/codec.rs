//! Signal packing and unpacking
//!
//! Converts between physical signal values and raw frame bytes based on
//! signal definitions from the database. Handles bit extraction and
//! insertion with both byte orders, sign extension, and factor/offset
//! scaling. Encoding supports a strict mode and a permissive fallback mode
//! (no scaling, truncation to field width) used when strict encoding fails
//! numerically.

use crate::signals::{ByteOrder, MessageSpec, SignalSpec, ValueType};
use crate::types::SignalValues;

/// Controls how signal values are converted into raw bits.
///
/// The normal path is [`EncodeOptions::strict`]. When a strict encode fails
/// numerically, callers retry once with [`EncodeOptions::permissive`]; if
/// that also fails the failure is surfaced and no frame is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    /// Apply factor/offset scaling when converting to raw values
    pub scaling: bool,
    /// Reject values that do not fit the signal's bit width
    pub strict: bool,
}

impl EncodeOptions {
    /// Full validation: scaling applied, bit-width overflow rejected
    pub fn strict() -> Self {
        Self {
            scaling: true,
            strict: true,
        }
    }

    /// Fallback mode: values taken as raw, truncated to the field width
    pub fn permissive() -> Self {
        Self {
            scaling: false,
            strict: false,
        }
    }
}

/// Encode a value map into frame bytes for the given message layout.
///
/// Returns the reason string on failure; the caller attaches the frame id.
pub fn encode_signals(
    message: &MessageSpec,
    values: &SignalValues,
    options: EncodeOptions,
) -> std::result::Result<Vec<u8>, String> {
    let mut data = vec![0u8; message.size];

    for signal in &message.signals {
        let value = match values.get(&signal.name) {
            Some(v) => *v,
            None if options.strict => {
                return Err(format!("signal '{}' missing from value map", signal.name));
            }
            // Permissive mode leaves absent signals at zero bits
            None => continue,
        };

        let raw = raw_from_physical(signal, value, options)?;
        insert_signal_value(&mut data, signal, raw);
    }

    Ok(data)
}

/// Decode frame bytes into a value map for the given message layout.
///
/// Signals that do not fit within the supplied data are skipped with a
/// warning rather than failing the whole frame.
pub fn decode_signals(message: &MessageSpec, data: &[u8]) -> SignalValues {
    let mut values = SignalValues::new();

    for signal in &message.signals {
        if let Some(raw) = extract_signal_value(data, signal) {
            let physical = signal.offset + signal.factor * (raw as f64);
            values.insert(signal.name.clone(), physical);
        }
    }

    values
}

/// Convert a physical value into the raw bit pattern for one signal
fn raw_from_physical(
    signal: &SignalSpec,
    value: f64,
    options: EncodeOptions,
) -> std::result::Result<u64, String> {
    let raw_f = if options.scaling {
        if signal.factor == 0.0 {
            return Err(format!("zero scale factor for signal '{}'", signal.name));
        }
        (value - signal.offset) / signal.factor
    } else {
        value
    };

    if !raw_f.is_finite() {
        return Err(format!(
            "non-finite raw value {} for signal '{}'",
            raw_f, signal.name
        ));
    }

    let length = signal.length as u32;
    let rounded = raw_f.round();

    match signal.value_type {
        ValueType::Unsigned => {
            let max = max_unsigned(length) as f64;
            if options.strict && (rounded < 0.0 || rounded > max) {
                return Err(format!(
                    "raw value {} does not fit in {} unsigned bits for signal '{}'",
                    rounded, length, signal.name
                ));
            }
            // Saturating float cast, then truncate to the field width
            Ok((rounded as u64) & max_unsigned(length))
        }
        ValueType::Signed => {
            let (min, max) = signed_bounds(length);
            if options.strict && (rounded < min as f64 || rounded > max as f64) {
                return Err(format!(
                    "raw value {} does not fit in {} signed bits for signal '{}'",
                    rounded, length, signal.name
                ));
            }
            Ok((rounded as i64 as u64) & max_unsigned(length))
        }
    }
}

fn max_unsigned(length: u32) -> u64 {
    if length >= 64 {
        u64::MAX
    } else {
        (1u64 << length) - 1
    }
}

fn signed_bounds(length: u32) -> (i64, i64) {
    if length >= 64 {
        (i64::MIN, i64::MAX)
    } else {
        let half = 1i64 << (length - 1);
        (-half, half - 1)
    }
}

/// Extract the raw signal value from frame data, sign-extended if needed.
///
/// Returns `None` (with a warning) if the signal does not fit the data.
pub fn extract_signal_value(data: &[u8], signal: &SignalSpec) -> Option<i64> {
    let start_bit = signal.start_bit as usize;
    let length = signal.length as usize;

    let needed = required_bytes(signal);
    if needed > data.len() {
        log::warn!(
            "Signal '{}' requires {} bytes but frame only has {} bytes",
            signal.name,
            needed,
            data.len()
        );
        return None;
    }

    let raw_value = match signal.byte_order {
        ByteOrder::LittleEndian => extract_little_endian(data, start_bit, length),
        ByteOrder::BigEndian => extract_big_endian(data, start_bit, length),
    };

    let signed_value = match signal.value_type {
        ValueType::Unsigned => raw_value as i64,
        ValueType::Signed => sign_extend(raw_value, length),
    };

    Some(signed_value)
}

/// Insert a raw value into frame data at the signal's bit positions.
///
/// The inverse of [`extract_signal_value`]: target bits are cleared before
/// writing so that multiple signals can be packed into the same frame.
fn insert_signal_value(data: &mut [u8], signal: &SignalSpec, raw: u64) {
    let start_bit = signal.start_bit as usize;
    let length = signal.length as usize;

    let needed = required_bytes(signal);
    if needed > data.len() {
        log::warn!(
            "Signal '{}' requires {} bytes but frame only has {} bytes",
            signal.name,
            needed,
            data.len()
        );
        return;
    }

    match signal.byte_order {
        ByteOrder::LittleEndian => insert_little_endian(data, start_bit, length, raw),
        ByteOrder::BigEndian => insert_big_endian(data, start_bit, length, raw),
    }
}

/// Number of frame bytes a signal occupies, accounting for byte order.
///
/// Big-endian signals walk downward from the start bit and may spill into
/// following bytes, so the end position differs from the little-endian case.
fn required_bytes(signal: &SignalSpec) -> usize {
    let start = signal.start_bit as usize;
    let length = signal.length as usize;

    match signal.byte_order {
        ByteOrder::LittleEndian => (start + length + 7) / 8,
        ByteOrder::BigEndian => {
            let in_first_byte = start % 8 + 1;
            let remaining = length.saturating_sub(in_first_byte);
            start / 8 + 1 + (remaining + 7) / 8
        }
    }
}

/// Extract signal with little-endian (Intel) byte order
///
/// Little-endian format:
/// - Start bit points to the LSB (least significant bit)
/// - Bits are numbered from LSB to MSB within each byte
fn extract_little_endian(data: &[u8], start_bit: usize, length: usize) -> u64 {
    let mut result: u64 = 0;

    for i in 0..length {
        let bit_pos = start_bit + i;
        let byte_idx = bit_pos / 8;
        let bit_in_byte = bit_pos % 8;

        if byte_idx < data.len() {
            let bit_value = (data[byte_idx] >> bit_in_byte) & 0x01;
            result |= (bit_value as u64) << i;
        }
    }

    result
}

/// Extract signal with big-endian (Motorola) byte order
///
/// Big-endian format in CAN:
/// - Start bit points to the MSB (most significant bit) of the signal
/// - The signal walks downward within each byte (bit 7 towards bit 0),
///   then continues at bit 7 of the next byte
/// - The first bits walked are the MSBs of the raw value
fn extract_big_endian(data: &[u8], start_bit: usize, length: usize) -> u64 {
    let mut result: u64 = 0;
    let mut byte_idx = start_bit / 8;
    let mut bit_in_byte = start_bit % 8;

    for i in 0..length {
        if byte_idx < data.len() {
            let bit_value = (data[byte_idx] >> bit_in_byte) & 0x01;
            result |= (bit_value as u64) << (length - 1 - i);
        }

        if bit_in_byte == 0 {
            byte_idx += 1;
            bit_in_byte = 7;
        } else {
            bit_in_byte -= 1;
        }
    }

    result
}

/// Write a value with little-endian (Intel) bit placement, the exact
/// inverse of [`extract_little_endian`].
fn insert_little_endian(data: &mut [u8], start_bit: usize, length: usize, raw: u64) {
    for i in 0..length {
        let bit_pos = start_bit + i;
        let byte_idx = bit_pos / 8;
        let bit_in_byte = bit_pos % 8;

        if byte_idx < data.len() {
            let bit_value = ((raw >> i) & 0x01) as u8;
            data[byte_idx] &= !(1 << bit_in_byte);
            data[byte_idx] |= bit_value << bit_in_byte;
        }
    }
}

/// Write a value with big-endian (Motorola) bit placement, the exact
/// inverse of [`extract_big_endian`].
fn insert_big_endian(data: &mut [u8], start_bit: usize, length: usize, raw: u64) {
    let mut byte_idx = start_bit / 8;
    let mut bit_in_byte = start_bit % 8;

    for i in 0..length {
        if byte_idx < data.len() {
            let bit_value = ((raw >> (length - 1 - i)) & 0x01) as u8;
            data[byte_idx] &= !(1 << bit_in_byte);
            data[byte_idx] |= bit_value << bit_in_byte;
        }

        if bit_in_byte == 0 {
            byte_idx += 1;
            bit_in_byte = 7;
        } else {
            bit_in_byte -= 1;
        }
    }
}

/// Sign-extend a value from N bits to 64 bits
fn sign_extend(value: u64, bit_length: usize) -> i64 {
    if bit_length >= 64 {
        return value as i64;
    }

    let sign_bit = 1u64 << (bit_length - 1);
    if (value & sign_bit) != 0 {
        let mask = !0u64 << bit_length;
        (value | mask) as i64
    } else {
        value as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{MessageSpec, SignalSpec};

    fn unsigned_signal(name: &str, start_bit: u16, length: u16) -> SignalSpec {
        SignalSpec {
            name: name.to_string(),
            start_bit,
            length,
            byte_order: ByteOrder::LittleEndian,
            value_type: ValueType::Unsigned,
            factor: 1.0,
            offset: 0.0,
            min: None,
            max: None,
            unit: None,
        }
    }

    fn test_message(signals: Vec<SignalSpec>) -> MessageSpec {
        MessageSpec {
            id: 0x123,
            name: "TestMsg".to_string(),
            size: 8,
            extended: false,
            cycle_time: None,
            senders: vec!["ECU1".to_string()],
            signals,
        }
    }

    #[test]
    fn test_extract_little_endian_simple() {
        let data = vec![0xAB, 0xCD, 0xEF, 0x12];
        assert_eq!(extract_little_endian(&data, 0, 8), 0xAB);
    }

    #[test]
    fn test_extract_little_endian_cross_byte() {
        let data = vec![0xAB, 0xCD, 0xEF, 0x12];
        assert_eq!(extract_little_endian(&data, 0, 16), 0xCDAB);
    }

    #[test]
    fn test_extract_big_endian_simple() {
        let data = vec![0xAB, 0xCD, 0xEF, 0x12];
        assert_eq!(extract_big_endian(&data, 7, 8), 0xAB);
    }

    #[test]
    fn test_extract_big_endian_sawtooth_cross_byte() {
        // 12-bit signal starting at byte 0 bit 0: walks byte 0 bit 0 (MSB),
        // then byte 1 bits 7..0, then byte 2 bits 7..5.
        // 0xA5 bit 0 = 1, 0xB6, 0xD9 bits 7..5 = 0b110 -> 0b1_10110110_110
        let data = vec![0xA5, 0xB6, 0xD9];
        assert_eq!(extract_big_endian(&data, 0, 12), 0xDB6);
    }

    #[test]
    fn test_insert_little_endian_round_trip() {
        let mut data = vec![0u8; 8];
        insert_little_endian(&mut data, 4, 12, 0x9A5);
        assert_eq!(extract_little_endian(&data, 4, 12), 0x9A5);
    }

    #[test]
    fn test_insert_big_endian_round_trip() {
        let mut data = vec![0u8; 8];
        insert_big_endian(&mut data, 7, 16, 0xBEEF);
        assert_eq!(data[0], 0xBE);
        assert_eq!(data[1], 0xEF);
        assert_eq!(extract_big_endian(&data, 7, 16), 0xBEEF);
    }

    #[test]
    fn test_insert_clears_existing_bits() {
        // Writing zero over an all-ones frame must clear exactly the target bits
        let mut data = vec![0xFF; 8];
        insert_little_endian(&mut data, 8, 8, 0);
        assert_eq!(data[0], 0xFF);
        assert_eq!(data[1], 0x00);
        assert_eq!(data[2], 0xFF);
    }

    #[test]
    fn test_sign_extend_positive() {
        assert_eq!(sign_extend(0x7F, 8), 127);
    }

    #[test]
    fn test_sign_extend_negative() {
        assert_eq!(sign_extend(0xFF, 8), -1);
        assert_eq!(sign_extend(0x8000, 16), -32768);
    }

    #[test]
    fn test_encode_applies_scaling() {
        let mut signal = unsigned_signal("Voltage", 0, 16);
        signal.factor = 0.01;
        let message = test_message(vec![signal]);

        let mut values = SignalValues::new();
        values.insert("Voltage".to_string(), 12.34);

        let data = encode_signals(&message, &values, EncodeOptions::strict()).unwrap();
        assert_eq!(extract_little_endian(&data, 0, 16), 1234);

        let decoded = decode_signals(&message, &data);
        assert!((decoded["Voltage"] - 12.34).abs() < 1e-9);
    }

    #[test]
    fn test_encode_applies_offset() {
        let mut signal = unsigned_signal("Temp", 0, 8);
        signal.offset = -40.0;
        let message = test_message(vec![signal]);

        let mut values = SignalValues::new();
        values.insert("Temp".to_string(), 25.0);

        let data = encode_signals(&message, &values, EncodeOptions::strict()).unwrap();
        assert_eq!(data[0], 65);
    }

    #[test]
    fn test_strict_rejects_width_overflow() {
        let message = test_message(vec![unsigned_signal("Counter", 0, 4)]);
        let mut values = SignalValues::new();
        values.insert("Counter".to_string(), 16.0);

        let err = encode_signals(&message, &values, EncodeOptions::strict()).unwrap_err();
        assert!(err.contains("does not fit"));
    }

    #[test]
    fn test_permissive_truncates_width_overflow() {
        let message = test_message(vec![unsigned_signal("Counter", 0, 4)]);
        let mut values = SignalValues::new();
        values.insert("Counter".to_string(), 17.0);

        let data = encode_signals(&message, &values, EncodeOptions::permissive()).unwrap();
        assert_eq!(data[0], 0x01);
    }

    #[test]
    fn test_strict_rejects_zero_factor() {
        let mut signal = unsigned_signal("Broken", 0, 8);
        signal.factor = 0.0;
        let message = test_message(vec![signal]);

        let mut values = SignalValues::new();
        values.insert("Broken".to_string(), 1.0);

        let err = encode_signals(&message, &values, EncodeOptions::strict()).unwrap_err();
        assert!(err.contains("zero scale factor"));

        // Permissive mode skips scaling entirely, so the same write succeeds
        let data = encode_signals(&message, &values, EncodeOptions::permissive()).unwrap();
        assert_eq!(data[0], 1);
    }

    #[test]
    fn test_non_finite_value_fails_both_modes() {
        let message = test_message(vec![unsigned_signal("Sig", 0, 8)]);
        let mut values = SignalValues::new();
        values.insert("Sig".to_string(), f64::NAN);

        assert!(encode_signals(&message, &values, EncodeOptions::strict()).is_err());
        assert!(encode_signals(&message, &values, EncodeOptions::permissive()).is_err());
    }

    #[test]
    fn test_strict_requires_all_signals() {
        let message = test_message(vec![
            unsigned_signal("A", 0, 8),
            unsigned_signal("B", 8, 8),
        ]);
        let mut values = SignalValues::new();
        values.insert("A".to_string(), 1.0);

        assert!(encode_signals(&message, &values, EncodeOptions::strict()).is_err());
        // Permissive leaves the missing signal's bits at zero
        let data = encode_signals(&message, &values, EncodeOptions::permissive()).unwrap();
        assert_eq!(data[0], 1);
        assert_eq!(data[1], 0);
    }

    #[test]
    fn test_signed_encode_round_trip() {
        let mut signal = unsigned_signal("Angle", 0, 12);
        signal.value_type = ValueType::Signed;
        let message = test_message(vec![signal]);

        let mut values = SignalValues::new();
        values.insert("Angle".to_string(), -100.0);

        let data = encode_signals(&message, &values, EncodeOptions::strict()).unwrap();
        let decoded = decode_signals(&message, &data);
        assert_eq!(decoded["Angle"], -100.0);
    }
}
