//! Thread-backed periodic transmission
//!
//! One timer thread per periodic frame, paced by a condvar so that stop,
//! restart and shutdown take effect without waiting out the period. Used
//! by transports that have no native cyclic send support; raw SocketCAN
//! sockets and the loopback bus both fall in that category.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::bus::CyclicTask;
use crate::types::{CanFrame, Result};

struct TaskState {
    frame: CanFrame,
    running: bool,
    shutdown: bool,
}

struct TaskShared {
    state: Mutex<TaskState>,
    wakeup: Condvar,
    period: Duration,
}

/// Periodic sender running on its own OS thread.
///
/// The thread persists across stop/start cycles; it parks on the condvar
/// while stopped and is only torn down when the handle is dropped.
pub struct ThreadCyclicTask {
    shared: Arc<TaskShared>,
    handle: Option<JoinHandle<()>>,
}

impl ThreadCyclicTask {
    /// Spawn the timer thread and begin transmitting immediately.
    ///
    /// `send` is called from the timer thread once per period; an error
    /// marking the bus as closed ends the task for good.
    pub fn spawn<F>(send: F, frame: CanFrame, period: Duration) -> Self
    where
        F: Fn(&CanFrame) -> Result<()> + Send + 'static,
    {
        let shared = Arc::new(TaskShared {
            state: Mutex::new(TaskState {
                frame,
                running: true,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
            period,
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::spawn(move || run_task(send, thread_shared));

        Self {
            shared,
            handle: Some(handle),
        }
    }
}

impl CyclicTask for ThreadCyclicTask {
    fn start(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.running = true;
        self.shared.wakeup.notify_all();
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.running = false;
        self.shared.wakeup.notify_all();
        Ok(())
    }

    fn modify_data(&self, frame: CanFrame) -> Result<()> {
        // Takes effect on the next cycle; the cadence is not disturbed
        let mut state = self.shared.state.lock();
        state.frame = frame;
        Ok(())
    }

    fn supports_duration_limit(&self) -> bool {
        false
    }
}

impl Drop for ThreadCyclicTask {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.wakeup.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_task<F>(send: F, shared: Arc<TaskShared>)
where
    F: Fn(&CanFrame) -> Result<()>,
{
    let mut next_due = Instant::now();

    loop {
        let frame = {
            let mut state = shared.state.lock();
            // Park here while stopped; re-anchor the cadence on restart so
            // the first frame goes out immediately
            while !state.running && !state.shutdown {
                shared.wakeup.wait(&mut state);
                next_due = Instant::now();
            }
            if state.shutdown {
                return;
            }
            state.frame.clone()
        };

        if let Err(err) = send(&frame) {
            if err.is_closed() {
                log::debug!("Cyclic task for 0x{:X} ending: bus closed", frame.id);
                return;
            }
            log::warn!("Cyclic send of 0x{:X} failed: {}", frame.id, err);
        }

        next_due += shared.period;
        let now = Instant::now();
        if next_due < now {
            // Fell behind; rather than burst the missed slots, resume the
            // cadence from the current time
            next_due = now + shared.period;
        }

        let mut state = shared.state.lock();
        while state.running && !state.shutdown && Instant::now() < next_due {
            shared.wakeup.wait_until(&mut state, next_due);
        }
        if state.shutdown {
            return;
        }
    }
}
