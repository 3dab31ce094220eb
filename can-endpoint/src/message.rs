//! Managed transmit message
//!
//! A [`TxMessage`] pairs the current signal values of one frame id with the
//! encoded frame bytes, keeping the two consistent: every accepted write
//! re-encodes, every rejected write leaves both untouched. The frame is
//! therefore always ready to hand to the bus.

use std::time::Duration;

use crate::signals::{MessageSpec, SignalDatabase};
use crate::types::{CanFrame, EndpointError, Result, SignalValues};

/// One transmit message under management: layout, values, cached frame and
/// transmission period.
#[derive(Debug, Clone)]
pub struct TxMessage {
    spec: MessageSpec,
    values: SignalValues,
    period: Option<Duration>,
    frame: CanFrame,
}

impl TxMessage {
    /// Build a managed message for `id`.
    ///
    /// Signals missing from `initial` are seeded with their declared
    /// minimum (zero without one); values for signals the layout does not
    /// carry are dropped with a warning. The period starts out as the
    /// database cycle time.
    pub fn new(db: &SignalDatabase, id: u32, initial: SignalValues) -> Result<Self> {
        let spec = db.message_by_id(id)?.clone();

        let mut values = SignalValues::new();
        for (name, value) in initial {
            if spec.signal(&name).is_some() {
                values.insert(name, value);
            } else {
                log::warn!(
                    "Ignoring initial value for unknown signal '{}' on 0x{:X}",
                    name,
                    id
                );
            }
        }
        spec.fill_defaults(&mut values);

        let data = spec.encode_with_fallback(&values)?;
        let frame = CanFrame::with_id_flag(spec.id, spec.extended, data);
        let period = spec.cycle_time;

        Ok(Self {
            spec,
            values,
            period,
            frame,
        })
    }

    /// Set one signal to a physical value, re-encode and return the new
    /// frame.
    ///
    /// The write is rejected without touching state when the signal is
    /// unknown or the value violates its declared bounds. If even the
    /// permissive re-encode fails, the previous value is restored so the
    /// cached frame and the value map stay consistent.
    pub fn set_signal(&mut self, name: &str, value: f64) -> Result<&CanFrame> {
        let signal = self
            .spec
            .signal(name)
            .ok_or_else(|| EndpointError::UnknownSignal {
                id: self.spec.id,
                signal: name.to_string(),
            })?;

        if !signal.in_range(value) {
            return Err(EndpointError::OutOfRange {
                signal: name.to_string(),
                value,
                min: signal.min.unwrap_or(f64::NEG_INFINITY),
                max: signal.max.unwrap_or(f64::INFINITY),
            });
        }

        let previous = self.values.insert(name.to_string(), value);
        match self.spec.encode_with_fallback(&self.values) {
            Ok(data) => {
                self.frame = CanFrame::with_id_flag(self.spec.id, self.spec.extended, data);
                Ok(&self.frame)
            }
            Err(err) => {
                match previous {
                    Some(v) => self.values.insert(name.to_string(), v),
                    None => self.values.remove(name),
                };
                Err(err)
            }
        }
    }

    /// Set several signals at once and return the resulting frame.
    ///
    /// Not transactional: a failing signal is skipped and the rest of the
    /// batch is still applied. The first error is returned once the whole
    /// batch has been attempted.
    pub fn set_signals(&mut self, updates: &SignalValues) -> Result<&CanFrame> {
        let mut first_error = None;

        for (name, value) in updates {
            if let Err(err) = self.set_signal(name, *value) {
                log::error!("Signal write on 0x{:X} failed: {}", self.spec.id, err);
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(&self.frame),
        }
    }

    /// Change the transmission period. `None` turns the message into an
    /// event message with no cyclic schedule.
    pub fn set_period(&mut self, period: Option<Duration>) {
        self.period = period;
    }

    /// Current transmission period, if any
    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    /// The frame encoding the current values
    pub fn frame(&self) -> &CanFrame {
        &self.frame
    }

    /// Current physical values of all signals
    pub fn values(&self) -> &SignalValues {
        &self.values
    }

    /// Frame id
    pub fn id(&self) -> u32 {
        self.spec.id
    }

    /// Message name from the database
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// True for 29-bit identifiers
    pub fn is_extended(&self) -> bool {
        self.spec.extended
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{ByteOrder, SignalSpec, ValueType};

    fn test_db() -> SignalDatabase {
        let mut db = SignalDatabase::new();
        db.add_message(MessageSpec {
            id: 0x101,
            name: "StatusA".to_string(),
            size: 8,
            extended: false,
            cycle_time: Some(Duration::from_millis(100)),
            senders: vec!["Gateway".to_string()],
            signals: vec![
                SignalSpec {
                    name: "SigA".to_string(),
                    start_bit: 0,
                    length: 8,
                    byte_order: ByteOrder::LittleEndian,
                    value_type: ValueType::Unsigned,
                    factor: 1.0,
                    offset: 0.0,
                    min: Some(0.0),
                    max: Some(10.0),
                    unit: None,
                },
                SignalSpec {
                    name: "SigB".to_string(),
                    start_bit: 8,
                    length: 8,
                    byte_order: ByteOrder::LittleEndian,
                    value_type: ValueType::Unsigned,
                    factor: 1.0,
                    offset: 0.0,
                    min: None,
                    max: None,
                    unit: None,
                },
            ],
        });
        db
    }

    #[test]
    fn test_new_fills_missing_signals() {
        let db = test_db();
        let mut initial = SignalValues::new();
        initial.insert("SigA".to_string(), 5.0);

        let msg = TxMessage::new(&db, 0x101, initial).unwrap();
        assert_eq!(msg.values()["SigA"], 5.0);
        assert_eq!(msg.values()["SigB"], 0.0);
        assert_eq!(msg.frame().data[0], 5);
        assert_eq!(msg.frame().data[1], 0);
        assert_eq!(msg.period(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_new_drops_unknown_initial_values() {
        let db = test_db();
        let mut initial = SignalValues::new();
        initial.insert("Nope".to_string(), 1.0);

        let msg = TxMessage::new(&db, 0x101, initial).unwrap();
        assert!(!msg.values().contains_key("Nope"));
        assert_eq!(msg.values().len(), 2);
    }

    #[test]
    fn test_new_unknown_id() {
        let db = test_db();
        assert!(matches!(
            TxMessage::new(&db, 0x999, SignalValues::new()),
            Err(EndpointError::UnknownFrameId(0x999))
        ));
    }

    #[test]
    fn test_set_signal_reencodes() {
        let db = test_db();
        let mut msg = TxMessage::new(&db, 0x101, SignalValues::new()).unwrap();

        msg.set_signal("SigA", 7.0).unwrap();
        assert_eq!(msg.frame().data[0], 7);
        assert_eq!(msg.values()["SigA"], 7.0);
    }

    #[test]
    fn test_set_signal_unknown_name() {
        let db = test_db();
        let mut msg = TxMessage::new(&db, 0x101, SignalValues::new()).unwrap();
        let before = msg.frame().clone();

        let err = msg.set_signal("Missing", 1.0).unwrap_err();
        assert!(matches!(err, EndpointError::UnknownSignal { .. }));
        assert_eq!(msg.frame(), &before);
    }

    #[test]
    fn test_out_of_range_leaves_state_untouched() {
        let db = test_db();
        let mut msg = TxMessage::new(&db, 0x101, SignalValues::new()).unwrap();
        msg.set_signal("SigA", 4.0).unwrap();
        let before = msg.frame().clone();

        let err = msg.set_signal("SigA", 10.5).unwrap_err();
        assert!(matches!(err, EndpointError::OutOfRange { .. }));
        assert_eq!(msg.values()["SigA"], 4.0);
        assert_eq!(msg.frame(), &before);

        // Boundary values are accepted
        msg.set_signal("SigA", 0.0).unwrap();
        msg.set_signal("SigA", 10.0).unwrap();
    }

    #[test]
    fn test_unbounded_signal_takes_any_value_with_truncation() {
        let db = test_db();
        let mut msg = TxMessage::new(&db, 0x101, SignalValues::new()).unwrap();

        // No declared bounds, so the write is accepted; the strict encode
        // fails on width and the permissive retry truncates to 8 bits
        msg.set_signal("SigB", 300.0).unwrap();
        assert_eq!(msg.values()["SigB"], 300.0);
        assert_eq!(msg.frame().data[1], 300u64 as u8);
    }

    #[test]
    fn test_encode_failure_rolls_back_the_write() {
        let db = test_db();
        let mut msg = TxMessage::new(&db, 0x101, SignalValues::new()).unwrap();
        msg.set_signal("SigA", 4.0).unwrap();
        let before = msg.frame().clone();

        // NaN slips past the bounds check but fails both encode passes, so
        // the previous value must be restored
        let err = msg.set_signal("SigA", f64::NAN).unwrap_err();
        assert!(matches!(err, EndpointError::EncodeFailure { id: 0x101, .. }));
        assert_eq!(msg.values()["SigA"], 4.0);
        assert_eq!(msg.frame(), &before);
    }

    #[test]
    fn test_set_signals_applies_rest_after_failure() {
        let db = test_db();
        let mut msg = TxMessage::new(&db, 0x101, SignalValues::new()).unwrap();

        let mut updates = SignalValues::new();
        updates.insert("SigA".to_string(), 3.0);
        updates.insert("Bogus".to_string(), 1.0);

        let err = msg.set_signals(&updates).unwrap_err();
        assert!(matches!(err, EndpointError::UnknownSignal { .. }));
        assert_eq!(msg.values()["SigA"], 3.0);
    }

    #[test]
    fn test_set_period() {
        let db = test_db();
        let mut msg = TxMessage::new(&db, 0x101, SignalValues::new()).unwrap();

        msg.set_period(Some(Duration::from_millis(250)));
        assert_eq!(msg.period(), Some(Duration::from_millis(250)));
        msg.set_period(None);
        assert_eq!(msg.period(), None);
    }
}
