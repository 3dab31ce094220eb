//! Message manager facade
//!
//! [`MessageManager`] ties the pieces together: it loads a DBC signal
//! database, builds the transmit bundle from a persisted initial-values
//! file, narrows reception to the configured target nodes and drives a
//! [`Transceiver`] over one bus. Callers work in frame ids and engineering
//! units; encoding, scheduling and persistence happen behind the facade.
//!
//! The manager keeps a last-modified value store alongside the bundle.
//! Every successful `modify` records the decoded payload there, and `stop`
//! writes the store back to disk so the next run resumes from the values
//! last put on the wire.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bus::{CanBus, CanIdFilter, SocketCanBus};
use crate::config::ManagerConfig;
use crate::message::TxMessage;
use crate::signals::SignalDatabase;
use crate::store::{self, ValueStore};
use crate::transceiver::{FrameCallback, Transceiver};
use crate::types::{CanFrame, EndpointError, ReceivedFrame, Result, SignalValues};

/// High-level endpoint: one signal database, one bus, one engine.
pub struct MessageManager {
    config: ManagerConfig,
    db: Arc<SignalDatabase>,
    engine: Transceiver,
    /// Transmit bundle, keyed by frame id.
    messages: Mutex<HashMap<u32, TxMessage>>,
    /// Decoded values of the frames most recently put on the wire.
    last_modified: Arc<Mutex<ValueStore>>,
    on_frame: Arc<Mutex<Option<FrameCallback>>>,
    on_modified: Arc<Mutex<Option<FrameCallback>>>,
}

impl std::fmt::Debug for MessageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MessageManager {
    /// Open the configured SocketCAN interface and build a manager on it.
    pub fn open(config: ManagerConfig) -> Result<Self> {
        let bus = SocketCanBus::open(&config.bus.channel)?;
        Self::with_bus(config, Arc::new(bus))
    }

    /// Build a manager on an already opened bus.
    ///
    /// Loads the DBC database and the initial-values file; both are
    /// mandatory. Every entry in the values file becomes one bundle
    /// message, so an entry referencing a frame id the database does not
    /// know is fatal. Reception is narrowed to the messages sent by all
    /// configured target nodes; without target nodes (or when none match)
    /// the bus stays unfiltered.
    pub fn with_bus(config: ManagerConfig, bus: Arc<dyn CanBus>) -> Result<Self> {
        let db = Arc::new(SignalDatabase::from_dbc_file(&config.dbc_path)?);
        let stats = db.stats();
        log::info!(
            "Loaded {} messages / {} signals from {}",
            stats.message_count,
            stats.signal_count,
            config.dbc_path.display()
        );

        let initial = store::load_values(&config.initial_values_path)?;
        log::info!(
            "Loaded initial values for {} message(s) from {}",
            initial.len(),
            config.initial_values_path.display()
        );

        let mut messages = HashMap::new();
        for (id, values) in &initial {
            let message = TxMessage::new(&db, *id, values.clone())?;
            messages.insert(*id, message);
        }

        let filter_ids = if config.target_names.is_empty() {
            log::warn!("No target nodes configured; receiving all bus traffic");
            None
        } else {
            let ids = db.ids_sent_by_all(&config.target_names);
            if ids.is_empty() {
                log::warn!(
                    "Target nodes {:?} transmit no known message; receiving all bus traffic",
                    config.target_names
                );
                None
            } else {
                Some(ids)
            }
        };

        let engine = Transceiver::new(bus, config.transceiver_config(None))?;
        if let Some(ids) = &filter_ids {
            // Extended flags come from the database, not from id magnitude
            let filters: Vec<CanIdFilter> = ids
                .iter()
                .filter_map(|id| db.get(*id))
                .map(|spec| CanIdFilter::exact(spec.id, spec.extended))
                .collect();
            engine.set_filters(&filters)?;
            log::info!("Reception narrowed to {} message id(s)", filters.len());
        }

        Ok(Self {
            config,
            db,
            engine,
            messages: Mutex::new(messages),
            last_modified: Arc::new(Mutex::new(initial)),
            on_frame: Arc::new(Mutex::new(None)),
            on_modified: Arc::new(Mutex::new(None)),
        })
    }

    /// Begin periodic transmission of the bundle and start receiving.
    ///
    /// Messages without a declared cycle time use the configured default
    /// period. Scheduling failures are logged per message and do not keep
    /// the rest of the bundle from starting.
    pub fn start(&self) {
        self.install_handlers();

        {
            let messages = self.messages.lock();
            for (id, message) in messages.iter() {
                if self.engine.is_scheduled(*id) {
                    continue;
                }
                let period = message.period().unwrap_or(self.config.default_period);
                if let Err(err) = self.engine.add_periodic(message.frame().clone(), period) {
                    log::error!("Scheduling {} (0x{:X}): {}", message.name(), id, err);
                }
            }
        }

        self.engine.start();
        log::info!(
            "Manager running with {} periodic message(s)",
            self.engine.periodic_ids().len()
        );
    }

    /// Persist the last-modified values and shut the engine down.
    ///
    /// Persistence runs first and a failure there is returned, but never
    /// keeps the engine from stopping.
    pub fn stop(&self) -> Result<()> {
        let persisted = self.persist_last_modified();
        self.engine.stop();
        log::info!("Manager stopped");
        persisted
    }

    /// Update signal values on a bundle message and put it on the wire.
    ///
    /// `frame_id` is hexadecimal with an optional `0x` prefix. With
    /// `as_event` the re-encoded frame is transmitted once; otherwise the
    /// running periodic task's payload is swapped. In-range signals are
    /// applied even when others in the batch are rejected; the first
    /// rejection is returned after the whole batch was attempted and the
    /// frame was transmitted.
    pub fn modify(&self, frame_id: &str, values: &SignalValues, as_event: bool) -> Result<()> {
        let id = store::parse_frame_id(frame_id)?;

        let mut messages = self.messages.lock();
        let message = match messages.get_mut(&id) {
            Some(message) => message,
            None => {
                log::error!("Modify requested for unmanaged frame id 0x{:X}", id);
                return Err(EndpointError::UnknownFrameId(id));
            }
        };

        let write_error = message.set_signals(values).map(|_| ()).err();
        let frame = message.frame().clone();
        drop(messages);

        if as_event {
            self.engine.send_once(&frame)?;
        } else {
            self.engine.modify(frame.clone())?;
        }

        let decoded = self.db.message_by_id(id)?.decode(&frame.data);
        self.last_modified.lock().insert(id, decoded);

        match write_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Add a message to the bundle without scheduling it.
    ///
    /// An id already in the bundle keeps its existing entry.
    pub fn add_message(&self, message: TxMessage) {
        let mut messages = self.messages.lock();
        let id = message.id();
        if messages.contains_key(&id) {
            log::warn!("Message 0x{:X} already managed; keeping the existing entry", id);
            return;
        }
        log::debug!("Added {} (0x{:X}) to the bundle", message.name(), id);
        messages.insert(id, message);
    }

    /// Add several messages to the bundle without scheduling them.
    pub fn add_messages(&self, batch: Vec<TxMessage>) {
        for message in batch {
            self.add_message(message);
        }
    }

    /// Add a message to the bundle and begin transmitting it immediately.
    pub fn add_tx_message(&self, message: TxMessage) -> Result<()> {
        let id = message.id();
        self.add_message(message);

        let messages = self.messages.lock();
        let entry = messages.get(&id).ok_or(EndpointError::UnknownFrameId(id))?;
        let frame = entry.frame().clone();
        let period = entry.period().unwrap_or(self.config.default_period);
        drop(messages);

        self.engine.add_periodic(frame, period)
    }

    /// Add several messages and begin transmitting each.
    ///
    /// Failures are logged per message; the first one is returned after
    /// the whole batch was attempted.
    pub fn add_tx_messages(&self, batch: Vec<TxMessage>) -> Result<()> {
        let mut first_error = None;
        for message in batch {
            let id = message.id();
            if let Err(err) = self.add_tx_message(message) {
                log::error!("Adding periodic message 0x{:X}: {}", id, err);
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Decode a frame against the signal database.
    pub fn decode_frame(&self, frame: &CanFrame) -> Result<SignalValues> {
        Ok(self.db.message_by_id(frame.id)?.decode(&frame.data))
    }

    /// Snapshot of the most recent received frame per id.
    pub fn last_seen(&self) -> Result<HashMap<u32, ReceivedFrame>> {
        self.engine.last_seen()
    }

    /// Most recent received frame for one id, if any.
    pub fn last_seen_frame(&self, id: u32) -> Result<Option<ReceivedFrame>> {
        self.engine.last_seen_frame(id)
    }

    /// Decoded values most recently put on the wire, per frame id.
    pub fn last_modified(&self) -> ValueStore {
        self.last_modified.lock().clone()
    }

    /// Frame ids currently in the transmit bundle, in ascending order.
    pub fn message_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.messages.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// The loaded signal database.
    pub fn database(&self) -> &SignalDatabase {
        &self.db
    }

    /// Register a callback for received frames. Replaces any previous
    /// registration; takes effect immediately, also after `start`.
    pub fn set_on_frame(&self, callback: FrameCallback) {
        *self.on_frame.lock() = Some(callback);
    }

    /// Register a callback for modified payloads. Replaces any previous
    /// registration.
    pub fn set_on_modified(&self, callback: FrameCallback) {
        *self.on_modified.lock() = Some(callback);
    }

    /// Hook the engine callbacks up to decode, log and forward.
    ///
    /// The external slots are read at fire time so registrations made
    /// after `start` still take effect.
    fn install_handlers(&self) {
        let db = Arc::clone(&self.db);
        let external = Arc::clone(&self.on_frame);
        self.engine.set_on_frame(Arc::new(move |frame: &CanFrame| {
            match db.get(frame.id) {
                Some(spec) => log::debug!(
                    "RX {} (0x{:X}): {:?}",
                    spec.name,
                    frame.id,
                    spec.decode(&frame.data)
                ),
                None => log::debug!("RX unknown frame 0x{:X}", frame.id),
            }
            let callback = external.lock().clone();
            if let Some(callback) = callback {
                callback(frame);
            }
        }));

        let db = Arc::clone(&self.db);
        let external = Arc::clone(&self.on_modified);
        self.engine.set_on_modified(Arc::new(move |frame: &CanFrame| {
            if let Some(spec) = db.get(frame.id) {
                log::debug!(
                    "Modified {} (0x{:X}): {:?}",
                    spec.name,
                    frame.id,
                    spec.decode(&frame.data)
                );
            }
            let callback = external.lock().clone();
            if let Some(callback) = callback {
                callback(frame);
            }
        }));
    }

    fn persist_last_modified(&self) -> Result<()> {
        let path = match &self.config.save_values_path {
            Some(path) => path,
            None => {
                log::debug!("No save path configured; last-modified values not persisted");
                return Ok(());
            }
        };

        let snapshot = self.last_modified.lock().clone();
        match store::save_values(path, &snapshot) {
            Ok(()) => {
                log::info!(
                    "Persisted values for {} message(s) to {}",
                    snapshot.len(),
                    path.display()
                );
                Ok(())
            }
            Err(err) => {
                log::error!("Persisting values to {}: {}", path.display(), err);
                Err(err)
            }
        }
    }
}
