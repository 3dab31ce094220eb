//! Periodic transmission engine with a background receive loop.
//!
//! A [`Transceiver`] owns one [`CanBus`] and runs two kinds of work on it:
//! cyclic transmission tasks (one per frame id, each on its own timer) and
//! a single receive loop thread that records incoming frames and hands them
//! to an optional callback. Tasks move through a small per-id state machine:
//! absent, active, and stopped; every transition out of order is reported as
//! a typed error rather than silently ignored.
//!
//! `pause` and `resume` act on the engine as a whole: dispatch of received
//! frames is gated and the currently active tasks are halted, with the
//! active set snapshotted so `resume` restores exactly the tasks that were
//! running before the pause. Tasks stopped explicitly stay stopped across a
//! pause cycle.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Condvar, Mutex};

use crate::bus::{CanBus, CanIdFilter, CyclicTask};
use crate::config::TransceiverConfig;
use crate::types::{CanFrame, EndpointError, ReceivedFrame, Result, MAX_STANDARD_ID};

/// How long one `recv` call may block before the loop rechecks its flags.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Callback invoked with a received or modified frame.
///
/// The slot holds at most one callback; registering a new one replaces the
/// previous registration.
pub type FrameCallback = Arc<dyn Fn(&CanFrame) + Send + Sync>;

/// Dispatch gate shared with the receive loop.
struct DispatchState {
    /// Frames are handed to the callback only while `true`.
    enabled: bool,
    /// Set once by `stop`; tells the loop to exit even while paused.
    stopping: bool,
}

/// State shared between the engine and its receive loop thread.
struct RxShared {
    dispatch: Mutex<DispatchState>,
    gate: Condvar,
    on_frame: Mutex<Option<FrameCallback>>,
    last_seen: Mutex<HashMap<u32, ReceivedFrame>>,
    record_last_frames: bool,
    log_frames: bool,
}

impl RxShared {
    /// Record and dispatch one received frame.
    ///
    /// The callback is invoked without any engine lock held so it may call
    /// back into the engine.
    fn handle_frame(&self, frame: CanFrame) {
        if self.log_frames {
            log::debug!("RX {}", frame);
        }

        if self.record_last_frames {
            let received = ReceivedFrame {
                frame: frame.clone(),
                timestamp: Utc::now(),
            };
            self.last_seen.lock().insert(frame.id, received);
        }

        let callback = self.on_frame.lock().clone();
        if let Some(callback) = callback {
            callback(&frame);
        }
    }
}

/// Engine lifecycle; `start` and `stop` each fire at most once.
#[derive(Default)]
struct Lifecycle {
    started: bool,
    stopped: bool,
}

/// Periodic transmission engine bound to a single bus.
///
/// All methods take `&self`; the engine is safe to share behind an `Arc`
/// and callbacks may call back into it.
pub struct Transceiver {
    bus: Arc<dyn CanBus>,
    rx: Arc<RxShared>,
    rx_handle: Mutex<Option<thread::JoinHandle<()>>>,
    lifecycle: Mutex<Lifecycle>,
    /// Every scheduled task, active or stopped, keyed by frame id.
    tasks: Mutex<HashMap<u32, Box<dyn CyclicTask>>>,
    /// Ids whose tasks were explicitly stopped via `stop_periodic`.
    stopped: Mutex<HashSet<u32>>,
    /// Ids halted by `pause`, in the order they will be restarted.
    pause_snapshot: Mutex<Option<Vec<u32>>>,
    on_modified: Mutex<Option<FrameCallback>>,
}

impl Transceiver {
    /// Create an engine on an already opened bus.
    ///
    /// Filter ids carried in the config are applied as exact-match filters;
    /// ids above the standard range are matched as extended. An empty
    /// configured list is logged and ignored, leaving the bus in
    /// receive-all mode. Without any filter configuration the bus receives
    /// everything.
    pub fn new(bus: Arc<dyn CanBus>, config: TransceiverConfig) -> Result<Self> {
        let transceiver = Self {
            bus,
            rx: Arc::new(RxShared {
                dispatch: Mutex::new(DispatchState {
                    enabled: false,
                    stopping: false,
                }),
                gate: Condvar::new(),
                on_frame: Mutex::new(None),
                last_seen: Mutex::new(HashMap::new()),
                record_last_frames: config.record_last_frames,
                log_frames: config.log_frames,
            }),
            rx_handle: Mutex::new(None),
            lifecycle: Mutex::new(Lifecycle::default()),
            tasks: Mutex::new(HashMap::new()),
            stopped: Mutex::new(HashSet::new()),
            pause_snapshot: Mutex::new(None),
            on_modified: Mutex::new(None),
        };

        match &config.filter_ids {
            Some(ids) if ids.is_empty() => {
                log::warn!(
                    "Empty filter list configured; {} stays in receive-all mode",
                    transceiver.bus.channel()
                );
            }
            Some(ids) => {
                let filters: Vec<CanIdFilter> = ids
                    .iter()
                    .map(|&id| CanIdFilter::exact(id, id > MAX_STANDARD_ID))
                    .collect();
                transceiver.set_filters(&filters)?;
            }
            None => {
                log::debug!("No receive filters configured; accepting all frames");
            }
        }

        Ok(transceiver)
    }

    /// Restrict reception to the given filters.
    ///
    /// An empty list would silently drop every frame, so it is rejected
    /// with [`EndpointError::FilterNotConfigured`] and the bus keeps its
    /// current filter set.
    pub fn set_filters(&self, filters: &[CanIdFilter]) -> Result<()> {
        if filters.is_empty() {
            log::warn!("Refusing empty filter list; reception unchanged");
            return Err(EndpointError::FilterNotConfigured);
        }
        self.bus.set_filters(filters)?;
        log::debug!("Applied {} receive filter(s)", filters.len());
        Ok(())
    }

    /// Spawn the receive loop and enable dispatch.
    ///
    /// Starting twice, or after `stop`, is a logged no-op.
    pub fn start(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.stopped {
            log::warn!("Engine start requested after stop; ignoring");
            return;
        }
        if lifecycle.started {
            log::warn!("Engine already started");
            return;
        }
        lifecycle.started = true;
        drop(lifecycle);

        self.rx.dispatch.lock().enabled = true;

        let bus = Arc::clone(&self.bus);
        let rx = Arc::clone(&self.rx);
        *self.rx_handle.lock() = Some(thread::spawn(move || run_rx_loop(bus, rx)));

        log::info!("Transceiver started on {}", self.bus.channel());
    }

    /// Schedule a new cyclic transmission for `frame.id`.
    ///
    /// The task starts transmitting immediately. One task per id: a second
    /// registration fails with [`EndpointError::AlreadyScheduled`] and the
    /// running task is untouched.
    pub fn add_periodic(&self, frame: CanFrame, period: Duration) -> Result<()> {
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&frame.id) {
            return Err(EndpointError::AlreadyScheduled(frame.id));
        }

        let id = frame.id;
        let task = self.bus.send_periodic(frame, period)?;
        if !task.supports_duration_limit() {
            log::warn!(
                "Task 0x{:X} cannot bound its transmission duration; it runs until stopped",
                id
            );
        }
        tasks.insert(id, task);
        log::debug!("Scheduled periodic transmission of 0x{:X} every {:?}", id, period);
        Ok(())
    }

    /// Halt the cyclic transmission for `id` without discarding the task.
    pub fn stop_periodic(&self, id: u32) -> Result<()> {
        let tasks = self.tasks.lock();
        let task = tasks.get(&id).ok_or(EndpointError::NotScheduled(id))?;

        let mut stopped = self.stopped.lock();
        if stopped.contains(&id) {
            return Err(EndpointError::AlreadyStopped(id));
        }

        // While paused the task is already halted; only the logical state
        // and the resume snapshot change.
        let mut snapshot = self.pause_snapshot.lock();
        match snapshot.as_mut() {
            Some(ids) => ids.retain(|&i| i != id),
            None => task.stop()?,
        }
        stopped.insert(id);
        log::debug!("Stopped periodic transmission of 0x{:X}", id);
        Ok(())
    }

    /// Restart a previously stopped cyclic transmission.
    pub fn start_periodic(&self, id: u32) -> Result<()> {
        let tasks = self.tasks.lock();
        let task = tasks.get(&id).ok_or(EndpointError::NotScheduled(id))?;

        let mut stopped = self.stopped.lock();
        if !stopped.contains(&id) {
            return Err(EndpointError::AlreadyRunning(id));
        }

        // While paused the restart is deferred to `resume` via the
        // snapshot.
        let mut snapshot = self.pause_snapshot.lock();
        match snapshot.as_mut() {
            Some(ids) => {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
            None => task.start()?,
        }
        stopped.remove(&id);
        log::debug!("Restarted periodic transmission of 0x{:X}", id);
        Ok(())
    }

    /// Swap the payload of a scheduled task and notify the modified
    /// callback.
    ///
    /// The swap is atomic with respect to the task's timer: the next cycle
    /// sends either the old or the new payload, never a mix. The callback
    /// observes the frame that was handed to the task, whether or not the
    /// task is currently transmitting.
    pub fn modify(&self, frame: CanFrame) -> Result<()> {
        let tasks = self.tasks.lock();
        let task = tasks
            .get(&frame.id)
            .ok_or(EndpointError::NotScheduled(frame.id))?;
        task.modify_data(frame.clone())?;
        drop(tasks);

        let callback = self.on_modified.lock().clone();
        if let Some(callback) = callback {
            callback(&frame);
        }
        Ok(())
    }

    /// Transmit one frame immediately, independent of any scheduled task.
    pub fn send_once(&self, frame: &CanFrame) -> Result<()> {
        if self.rx.log_frames {
            log::debug!("TX {}", frame);
        }
        self.bus.send(frame)
    }

    /// Suspend dispatch and halt every currently active task.
    ///
    /// The set of active ids is recorded so [`resume`](Self::resume) can
    /// restart exactly those tasks. The receive loop keeps running but
    /// holds incoming frames at the gate. Pausing while already paused is
    /// a logged no-op.
    pub fn pause(&self) {
        {
            let mut dispatch = self.rx.dispatch.lock();
            if !dispatch.enabled {
                log::warn!("Pause requested but dispatch is not running");
                return;
            }
            dispatch.enabled = false;
        }

        let tasks = self.tasks.lock();
        let stopped = self.stopped.lock();
        let mut snapshot: Vec<u32> = Vec::new();
        for (id, task) in tasks.iter() {
            if stopped.contains(id) {
                continue;
            }
            if let Err(err) = task.stop() {
                log::warn!("Halting task 0x{:X} for pause: {}", id, err);
            }
            snapshot.push(*id);
        }
        snapshot.sort_unstable();

        log::info!("Transceiver paused; {} task(s) halted", snapshot.len());
        *self.pause_snapshot.lock() = Some(snapshot);
    }

    /// Restart the tasks halted by the last `pause` and reopen dispatch.
    ///
    /// Tasks stopped explicitly, before or during the pause, stay stopped.
    /// Resuming without a preceding pause is a logged no-op.
    pub fn resume(&self) {
        let tasks = self.tasks.lock();
        let snapshot = match self.pause_snapshot.lock().take() {
            Some(ids) => ids,
            None => {
                log::warn!("Resume requested but the engine is not paused");
                return;
            }
        };

        for id in &snapshot {
            match tasks.get(id) {
                Some(task) => {
                    if let Err(err) = task.start() {
                        log::warn!("Restarting task 0x{:X} after pause: {}", id, err);
                    }
                }
                None => log::warn!("Task 0x{:X} vanished during pause", id),
            }
        }
        drop(tasks);

        let mut dispatch = self.rx.dispatch.lock();
        if !dispatch.stopping {
            dispatch.enabled = true;
            self.rx.gate.notify_all();
        }
        drop(dispatch);

        log::info!("Transceiver resumed; {} task(s) restarted", snapshot.len());
    }

    /// Shut the engine down.
    ///
    /// Any pause is released, the receive loop is told to terminate, every
    /// task is stopped and dropped (joining its timer thread), the bus is
    /// shut down and finally the receive loop is joined. Tasks that
    /// already halted underneath the engine are logged, never fatal.
    /// Stopping twice is a logged no-op.
    pub fn stop(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.stopped {
                log::warn!("Engine already stopped");
                return;
            }
            lifecycle.stopped = true;
        }

        {
            let mut dispatch = self.rx.dispatch.lock();
            dispatch.stopping = true;
            dispatch.enabled = false;
            self.rx.gate.notify_all();
        }

        {
            let mut tasks = self.tasks.lock();
            for (id, task) in tasks.iter() {
                if let Err(err) = task.stop() {
                    log::warn!("Stopping task 0x{:X} during shutdown: {}", id, err);
                }
            }
            tasks.clear();
            self.stopped.lock().clear();
            *self.pause_snapshot.lock() = None;
        }

        self.bus.shutdown();

        if let Some(handle) = self.rx_handle.lock().take() {
            if handle.join().is_err() {
                log::error!("Receive loop panicked");
            }
        }

        log::info!("Transceiver stopped on {}", self.bus.channel());
    }

    /// Snapshot of the most recent frame per id.
    ///
    /// Fails with [`EndpointError::RecordingDisabled`] when the engine was
    /// configured without last-frame recording.
    pub fn last_seen(&self) -> Result<HashMap<u32, ReceivedFrame>> {
        if !self.rx.record_last_frames {
            return Err(EndpointError::RecordingDisabled);
        }
        Ok(self.rx.last_seen.lock().clone())
    }

    /// Most recent frame received for one id, if any.
    pub fn last_seen_frame(&self, id: u32) -> Result<Option<ReceivedFrame>> {
        if !self.rx.record_last_frames {
            return Err(EndpointError::RecordingDisabled);
        }
        Ok(self.rx.last_seen.lock().get(&id).cloned())
    }

    /// Ids with a scheduled task, active or stopped, in ascending order.
    pub fn periodic_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.tasks.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Whether a task exists for `id`, in any state.
    pub fn is_scheduled(&self, id: u32) -> bool {
        self.tasks.lock().contains_key(&id)
    }

    /// Whether the task for `id` exists and has not been explicitly
    /// stopped.
    pub fn is_active(&self, id: u32) -> bool {
        let tasks = self.tasks.lock();
        tasks.contains_key(&id) && !self.stopped.lock().contains(&id)
    }

    /// Register the receive callback. Replaces any previous registration.
    pub fn set_on_frame(&self, callback: FrameCallback) {
        *self.rx.on_frame.lock() = Some(callback);
    }

    /// Register the modified-payload callback. Replaces any previous
    /// registration.
    pub fn set_on_modified(&self, callback: FrameCallback) {
        *self.on_modified.lock() = Some(callback);
    }
}

impl Drop for Transceiver {
    fn drop(&mut self) {
        let stopped = self.lifecycle.lock().stopped;
        if !stopped {
            self.stop();
        }
    }
}

/// Body of the receive loop thread.
///
/// Received frames pass the dispatch gate before they are recorded and
/// handed to the callback, so a paused engine holds at most one frame here
/// while the rest queue in the transport. The loop ends when the bus
/// reports closure or `stop` raises the stopping flag.
fn run_rx_loop(bus: Arc<dyn CanBus>, rx: Arc<RxShared>) {
    log::debug!("Receive loop running on {}", bus.channel());
    loop {
        match bus.recv(RECV_TIMEOUT) {
            Ok(Some(frame)) => {
                {
                    let mut dispatch = rx.dispatch.lock();
                    while !dispatch.enabled && !dispatch.stopping {
                        rx.gate.wait(&mut dispatch);
                    }
                    if dispatch.stopping {
                        break;
                    }
                }
                rx.handle_frame(frame);
            }
            Ok(None) => {
                if rx.dispatch.lock().stopping {
                    break;
                }
            }
            Err(err) if err.is_closed() => {
                log::debug!("Receive loop ending: bus closed");
                break;
            }
            Err(err) => {
                log::warn!("Receive error on {}: {}", bus.channel(), err);
            }
        }
    }
    log::debug!("Receive loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::VirtualBus;
    use crossbeam_channel::{unbounded, RecvTimeoutError};

    fn engine_on_pair() -> (Transceiver, VirtualBus) {
        let (side_a, side_b) = VirtualBus::pair();
        let config = TransceiverConfig::new().with_recording(true);
        let engine = Transceiver::new(Arc::new(side_a), config).unwrap();
        (engine, side_b)
    }

    fn frame(id: u32, byte: u8) -> CanFrame {
        CanFrame::new(id, vec![byte, 0, 0, 0])
    }

    /// Drain `peer` for `window`, counting frames per id.
    fn count_frames(peer: &VirtualBus, window: Duration) -> HashMap<u32, usize> {
        let deadline = std::time::Instant::now() + window;
        let mut counts = HashMap::new();
        while std::time::Instant::now() < deadline {
            match peer.recv(Duration::from_millis(10)) {
                Ok(Some(frame)) => *counts.entry(frame.id).or_insert(0) += 1,
                Ok(None) => {}
                Err(_) => break,
            }
        }
        counts
    }

    #[test]
    fn test_duplicate_schedule_rejected() {
        let (engine, _peer) = engine_on_pair();
        engine
            .add_periodic(frame(0x10, 1), Duration::from_millis(50))
            .unwrap();
        let err = engine
            .add_periodic(frame(0x10, 2), Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, EndpointError::AlreadyScheduled(0x10)));
        engine.start();
        engine.stop();
    }

    #[test]
    fn test_task_state_machine_errors() {
        let (engine, _peer) = engine_on_pair();

        assert!(matches!(
            engine.stop_periodic(0x99).unwrap_err(),
            EndpointError::NotScheduled(0x99)
        ));
        assert!(matches!(
            engine.start_periodic(0x99).unwrap_err(),
            EndpointError::NotScheduled(0x99)
        ));
        assert!(matches!(
            engine.modify(frame(0x99, 0)).unwrap_err(),
            EndpointError::NotScheduled(0x99)
        ));

        engine
            .add_periodic(frame(0x10, 1), Duration::from_millis(50))
            .unwrap();
        assert!(matches!(
            engine.start_periodic(0x10).unwrap_err(),
            EndpointError::AlreadyRunning(0x10)
        ));

        engine.stop_periodic(0x10).unwrap();
        assert!(matches!(
            engine.stop_periodic(0x10).unwrap_err(),
            EndpointError::AlreadyStopped(0x10)
        ));

        engine.start_periodic(0x10).unwrap();
        engine.stop();
    }

    #[test]
    fn test_stop_periodic_halts_transmission() {
        let (engine, peer) = engine_on_pair();
        engine
            .add_periodic(frame(0x20, 1), Duration::from_millis(20))
            .unwrap();

        let counts = count_frames(&peer, Duration::from_millis(150));
        assert!(counts.get(&0x20).copied().unwrap_or(0) >= 2);

        engine.stop_periodic(0x20).unwrap();
        // Drain anything still in flight, then expect silence.
        std::thread::sleep(Duration::from_millis(60));
        let _ = count_frames(&peer, Duration::from_millis(50));
        let counts = count_frames(&peer, Duration::from_millis(150));
        assert_eq!(counts.get(&0x20), None);

        engine.start_periodic(0x20).unwrap();
        let counts = count_frames(&peer, Duration::from_millis(150));
        assert!(counts.get(&0x20).copied().unwrap_or(0) >= 2);

        engine.stop();
    }

    #[test]
    fn test_pause_resume_restores_active_set() {
        let (engine, peer) = engine_on_pair();
        engine.start();
        engine
            .add_periodic(frame(0x201, 1), Duration::from_millis(20))
            .unwrap();
        engine
            .add_periodic(frame(0x202, 2), Duration::from_millis(20))
            .unwrap();
        engine.stop_periodic(0x202).unwrap();

        engine.pause();
        // Drain anything still in flight, then expect silence.
        std::thread::sleep(Duration::from_millis(60));
        let _ = count_frames(&peer, Duration::from_millis(50));
        let counts = count_frames(&peer, Duration::from_millis(150));
        assert_eq!(counts.get(&0x201), None);
        assert_eq!(counts.get(&0x202), None);

        engine.resume();
        let counts = count_frames(&peer, Duration::from_millis(200));
        assert!(counts.get(&0x201).copied().unwrap_or(0) >= 2);
        assert_eq!(counts.get(&0x202), None, "explicitly stopped task must stay stopped");

        engine.stop();
    }

    #[test]
    fn test_stop_while_paused_stays_stopped_after_resume() {
        let (engine, peer) = engine_on_pair();
        engine.start();
        engine
            .add_periodic(frame(0x30, 1), Duration::from_millis(20))
            .unwrap();

        engine.pause();
        engine.stop_periodic(0x30).unwrap();
        engine.resume();

        // Drain anything queued before the pause, then expect silence.
        std::thread::sleep(Duration::from_millis(60));
        let _ = count_frames(&peer, Duration::from_millis(50));
        let counts = count_frames(&peer, Duration::from_millis(150));
        assert_eq!(counts.get(&0x30), None);
        assert!(engine.is_scheduled(0x30));
        assert!(!engine.is_active(0x30));

        engine.stop();
    }

    #[test]
    fn test_receive_callback_and_last_seen() {
        let (engine, peer) = engine_on_pair();
        let (tx, rx) = unbounded();
        engine.set_on_frame(Arc::new(move |frame: &CanFrame| {
            let _ = tx.send(frame.clone());
        }));
        engine.start();

        peer.send(&frame(0x40, 0xAA)).unwrap();
        peer.send(&frame(0x40, 0xBB)).unwrap();

        let first = rx.recv_timeout(Duration::from_millis(500)).unwrap();
        let second = rx.recv_timeout(Duration::from_millis(500)).unwrap();
        assert_eq!(first.data[0], 0xAA);
        assert_eq!(second.data[0], 0xBB);

        // Last write wins in the per-id record.
        let seen = engine.last_seen().unwrap();
        assert_eq!(seen.get(&0x40).unwrap().frame.data[0], 0xBB);
        assert_eq!(
            engine.last_seen_frame(0x40).unwrap().unwrap().frame.data[0],
            0xBB
        );
        assert!(engine.last_seen_frame(0x41).unwrap().is_none());

        engine.stop();
    }

    #[test]
    fn test_recording_disabled_error() {
        let (side_a, _side_b) = VirtualBus::pair();
        let engine = Transceiver::new(Arc::new(side_a), TransceiverConfig::new()).unwrap();
        assert!(matches!(
            engine.last_seen().unwrap_err(),
            EndpointError::RecordingDisabled
        ));
        assert!(matches!(
            engine.last_seen_frame(0x1).unwrap_err(),
            EndpointError::RecordingDisabled
        ));
    }

    #[test]
    fn test_pause_gates_dispatch() {
        let (engine, peer) = engine_on_pair();
        let (tx, rx) = unbounded();
        engine.set_on_frame(Arc::new(move |frame: &CanFrame| {
            let _ = tx.send(frame.id);
        }));
        engine.start();

        peer.send(&frame(0x50, 1)).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_millis(500)).unwrap(), 0x50);

        engine.pause();
        std::thread::sleep(Duration::from_millis(50));
        peer.send(&frame(0x51, 1)).unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(150)).unwrap_err(),
            RecvTimeoutError::Timeout
        );

        engine.resume();
        assert_eq!(rx.recv_timeout(Duration::from_millis(500)).unwrap(), 0x51);

        engine.stop();
    }

    #[test]
    fn test_modify_swaps_payload_and_notifies() {
        let (engine, peer) = engine_on_pair();
        let (tx, rx) = unbounded();
        engine.set_on_modified(Arc::new(move |frame: &CanFrame| {
            let _ = tx.send(frame.clone());
        }));
        engine
            .add_periodic(frame(0x60, 0x11), Duration::from_millis(20))
            .unwrap();

        engine.modify(frame(0x60, 0x22)).unwrap();
        let notified = rx.recv_timeout(Duration::from_millis(500)).unwrap();
        assert_eq!(notified.data[0], 0x22);

        // Give the task a couple of cycles, then check the wire payload.
        std::thread::sleep(Duration::from_millis(60));
        let mut last = None;
        while let Ok(Some(frame)) = peer.recv(Duration::from_millis(10)) {
            last = Some(frame);
        }
        assert_eq!(last.unwrap().data[0], 0x22);

        engine.stop();
    }

    #[test]
    fn test_send_once_bypasses_tasks() {
        let (engine, peer) = engine_on_pair();
        engine.send_once(&frame(0x70, 0x5A)).unwrap();
        let received = peer.recv(Duration::from_millis(500)).unwrap().unwrap();
        assert_eq!(received.id, 0x70);
        assert_eq!(received.data[0], 0x5A);
        assert!(!engine.is_scheduled(0x70));
    }

    #[test]
    fn test_stop_halts_everything_and_is_idempotent() {
        let (engine, peer) = engine_on_pair();
        engine.start();
        engine
            .add_periodic(frame(0x80, 1), Duration::from_millis(20))
            .unwrap();
        let counts = count_frames(&peer, Duration::from_millis(100));
        assert!(counts.get(&0x80).copied().unwrap_or(0) >= 1);

        engine.stop();
        assert!(engine.periodic_ids().is_empty());

        // The shared wire is closed from the engine side.
        std::thread::sleep(Duration::from_millis(60));
        assert!(matches!(
            peer.recv(Duration::from_millis(50)),
            Err(EndpointError::BusClosed) | Ok(None)
        ));

        // Second stop must not panic or deadlock.
        engine.stop();
    }

    #[test]
    fn test_empty_filter_list_rejected() {
        let (engine, _peer) = engine_on_pair();
        assert!(matches!(
            engine.set_filters(&[]).unwrap_err(),
            EndpointError::FilterNotConfigured
        ));
    }

    #[test]
    fn test_filters_limit_reception() {
        let (side_a, side_b) = VirtualBus::pair();
        let config = TransceiverConfig::new()
            .with_recording(true)
            .with_filter_ids(vec![0x100]);
        let engine = Transceiver::new(Arc::new(side_a), config).unwrap();
        engine.start();

        side_b.send(&frame(0x100, 1)).unwrap();
        side_b.send(&frame(0x200, 2)).unwrap();
        std::thread::sleep(Duration::from_millis(200));

        let seen = engine.last_seen().unwrap();
        assert!(seen.contains_key(&0x100));
        assert!(!seen.contains_key(&0x200));

        engine.stop();
    }

    #[test]
    fn test_inspection_accessors() {
        let (engine, _peer) = engine_on_pair();
        engine
            .add_periodic(frame(0x12, 1), Duration::from_millis(50))
            .unwrap();
        engine
            .add_periodic(frame(0x11, 1), Duration::from_millis(50))
            .unwrap();

        assert_eq!(engine.periodic_ids(), vec![0x11, 0x12]);
        assert!(engine.is_scheduled(0x11));
        assert!(engine.is_active(0x11));
        assert!(!engine.is_scheduled(0x13));
        assert!(!engine.is_active(0x13));

        engine.stop_periodic(0x11).unwrap();
        assert!(engine.is_scheduled(0x11));
        assert!(!engine.is_active(0x11));

        engine.stop();
    }
}
