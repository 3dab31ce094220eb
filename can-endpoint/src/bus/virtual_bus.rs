//! In-memory loopback bus
//!
//! A connected pair of endpoints passing frames over channels. Carries the
//! full [`CanBus`] contract (filters, periodic tasks, shutdown) without
//! touching any kernel interface; the test suite and the CLI loopback mode
//! run on it. Shutting down either endpoint closes the whole pair, the way
//! unplugging one end kills a point-to-point link.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::bus::{CanBus, CanIdFilter, CyclicTask, ThreadCyclicTask};
use crate::types::{CanFrame, EndpointError, Result};

/// How often a blocked receive rechecks the closed flag
const POLL_SLICE: Duration = Duration::from_millis(10);

/// One endpoint of an in-memory bus pair
pub struct VirtualBus {
    name: String,
    tx: Sender<CanFrame>,
    rx: Receiver<CanFrame>,
    filters: Mutex<Option<Vec<CanIdFilter>>>,
    closed: Arc<AtomicBool>,
}

impl VirtualBus {
    /// Create a connected pair of endpoints.
    ///
    /// Frames sent on one endpoint arrive at the other, in order.
    pub fn pair() -> (VirtualBus, VirtualBus) {
        let (a_tx, a_rx) = unbounded();
        let (b_tx, b_rx) = unbounded();
        let closed = Arc::new(AtomicBool::new(false));

        (
            VirtualBus {
                name: "vbus-a".to_string(),
                tx: a_tx,
                rx: b_rx,
                filters: Mutex::new(None),
                closed: Arc::clone(&closed),
            },
            VirtualBus {
                name: "vbus-b".to_string(),
                tx: b_tx,
                rx: a_rx,
                filters: Mutex::new(None),
                closed,
            },
        )
    }

    fn passes_filters(&self, frame: &CanFrame) -> bool {
        match &*self.filters.lock() {
            None => true,
            Some(filters) => filters.iter().any(|f| f.matches(frame)),
        }
    }
}

impl CanBus for VirtualBus {
    fn send(&self, frame: &CanFrame) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EndpointError::BusClosed);
        }
        self.tx
            .send(frame.clone())
            .map_err(|_| EndpointError::BusClosed)
    }

    fn recv(&self, timeout: Duration) -> Result<Option<CanFrame>> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(EndpointError::BusClosed);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining.min(POLL_SLICE)) {
                Ok(frame) => {
                    if self.passes_filters(&frame) {
                        return Ok(Some(frame));
                    }
                    // Filtered out; keep consuming within the window
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(EndpointError::BusClosed);
                }
            }
        }
    }

    fn send_periodic(&self, frame: CanFrame, period: Duration) -> Result<Box<dyn CyclicTask>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EndpointError::BusClosed);
        }

        let tx = self.tx.clone();
        let closed = Arc::clone(&self.closed);
        let task = ThreadCyclicTask::spawn(
            move |frame: &CanFrame| {
                if closed.load(Ordering::SeqCst) {
                    return Err(EndpointError::BusClosed);
                }
                tx.send(frame.clone()).map_err(|_| EndpointError::BusClosed)
            },
            frame,
            period,
        );

        Ok(Box::new(task))
    }

    fn set_filters(&self, filters: &[CanIdFilter]) -> Result<()> {
        *self.filters.lock() = Some(filters.to_vec());
        log::debug!("{}: installed {} receive filters", self.name, filters.len());
        Ok(())
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        log::debug!("{}: closed", self.name);
    }

    fn channel(&self) -> &str {
        &self.name
    }
}
