//! Bus transport abstraction
//!
//! The engine drives hardware through the [`CanBus`] trait so the same
//! scheduling and dispatch logic runs over Linux SocketCAN and over the
//! in-memory loopback bus the tests use. Periodic transmissions are handed
//! out as [`CyclicTask`] handles that can be stopped, restarted and
//! re-payloaded independently of the bus itself.

pub mod cyclic;
pub mod socket;
pub mod virtual_bus;

pub use cyclic::ThreadCyclicTask;
pub use socket::SocketCanBus;
pub use virtual_bus::VirtualBus;

use std::time::Duration;

use crate::types::{CanFrame, Result, MAX_EXTENDED_ID, MAX_STANDARD_ID};

/// Acceptance filter entry for the receive path.
///
/// A frame passes when `frame.id & mask == id & mask` and the extended
/// flags agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanIdFilter {
    pub id: u32,
    pub mask: u32,
    pub extended: bool,
}

impl CanIdFilter {
    /// Exact-match filter for a single frame id
    pub fn exact(id: u32, extended: bool) -> Self {
        let mask = if extended {
            MAX_EXTENDED_ID
        } else {
            MAX_STANDARD_ID
        };
        Self {
            id: id & mask,
            mask,
            extended,
        }
    }

    /// True if the frame passes this filter
    pub fn matches(&self, frame: &CanFrame) -> bool {
        frame.extended == self.extended && (frame.id & self.mask) == (self.id & self.mask)
    }
}

/// Handle to one periodic transmission running on the bus.
///
/// Dropping the handle ends the transmission and reclaims its resources.
pub trait CyclicTask: Send {
    /// Begin or resume transmission
    fn start(&self) -> Result<()>;

    /// Halt transmission; the task can be started again later
    fn stop(&self) -> Result<()>;

    /// Replace the transmitted payload without disturbing the cadence
    fn modify_data(&self, frame: CanFrame) -> Result<()>;

    /// Whether the transport can bound the transmission duration natively
    fn supports_duration_limit(&self) -> bool;
}

/// Transport interface the engine drives
pub trait CanBus: Send + Sync {
    /// Queue a single frame for transmission
    fn send(&self, frame: &CanFrame) -> Result<()>;

    /// Receive the next frame, waiting up to `timeout`.
    ///
    /// `Ok(None)` means the timeout elapsed with no traffic;
    /// [`BusClosed`](crate::types::EndpointError::BusClosed) means the
    /// transport shut down and no further frames will arrive.
    fn recv(&self, timeout: Duration) -> Result<Option<CanFrame>>;

    /// Begin cyclic transmission of a frame at the given period.
    ///
    /// The returned task is already running.
    fn send_periodic(&self, frame: CanFrame, period: Duration) -> Result<Box<dyn CyclicTask>>;

    /// Restrict reception to frames passing any of the given filters
    fn set_filters(&self, filters: &[CanIdFilter]) -> Result<()>;

    /// Close the transport, releasing any blocked receivers
    fn shutdown(&self);

    /// Channel name for diagnostics
    fn channel(&self) -> &str;
}
