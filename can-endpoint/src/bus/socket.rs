//! Linux SocketCAN transport
//!
//! Raw CAN socket bound to a network interface (`can0`, `vcan0`, ...).
//! The socket runs in non-blocking mode; receive timeouts and shutdown are
//! handled by polling against a closed flag, and periodic transmission is
//! carried by [`ThreadCyclicTask`] since raw sockets have no broadcast
//! manager.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use socketcan::{CanSocket, EmbeddedFrame, ExtendedId, Frame, Id, Socket, SocketOptions, StandardId};

use crate::bus::{CanBus, CanIdFilter, CyclicTask, ThreadCyclicTask};
use crate::types::{CanFrame, EndpointError, Result};

/// Extended-frame flag bit from linux/can.h
const CAN_EFF_FLAG: u32 = 0x8000_0000;

/// Poll interval while a receive waits for traffic
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Bounded retries when the kernel transmit queue is momentarily full
const SEND_RETRIES: u32 = 10;
const SEND_RETRY_DELAY: Duration = Duration::from_millis(1);

struct SocketShared {
    socket: CanSocket,
    closed: AtomicBool,
}

/// CAN bus backed by a Linux SocketCAN interface
pub struct SocketCanBus {
    shared: Arc<SocketShared>,
    channel: String,
}

impl SocketCanBus {
    /// Open and configure the named CAN interface
    pub fn open(channel: &str) -> Result<Self> {
        let socket = CanSocket::open(channel).map_err(|e| {
            EndpointError::Bus(format!("failed to open CAN interface {}: {}", channel, e))
        })?;

        socket.set_nonblocking(true).map_err(|e| {
            EndpointError::Bus(format!(
                "failed to set non-blocking mode on {}: {}",
                channel, e
            ))
        })?;

        log::info!("Opened SocketCAN interface {}", channel);

        Ok(Self {
            shared: Arc::new(SocketShared {
                socket,
                closed: AtomicBool::new(false),
            }),
            channel: channel.to_string(),
        })
    }
}

impl CanBus for SocketCanBus {
    fn send(&self, frame: &CanFrame) -> Result<()> {
        send_on(&self.shared, &self.channel, frame)
    }

    fn recv(&self, timeout: Duration) -> Result<Option<CanFrame>> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(EndpointError::BusClosed);
            }

            match self.shared.socket.read_frame() {
                Ok(socket_frame) => {
                    if let Some(frame) = from_socket_frame(&socket_frame) {
                        return Ok(Some(frame));
                    }
                    // Remote or error frame; keep reading within the window
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    thread::sleep(RECV_POLL_INTERVAL);
                }
                Err(e) => {
                    return Err(EndpointError::Bus(format!(
                        "receive on {} failed: {}",
                        self.channel, e
                    )));
                }
            }
        }
    }

    fn send_periodic(&self, frame: CanFrame, period: Duration) -> Result<Box<dyn CyclicTask>> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(EndpointError::BusClosed);
        }

        let shared = Arc::clone(&self.shared);
        let channel = self.channel.clone();
        let task = ThreadCyclicTask::spawn(
            move |frame: &CanFrame| send_on(&shared, &channel, frame),
            frame,
            period,
        );

        Ok(Box::new(task))
    }

    fn set_filters(&self, filters: &[CanIdFilter]) -> Result<()> {
        let kernel_filters: Vec<socketcan::CanFilter> =
            filters.iter().map(to_kernel_filter).collect();

        self.shared
            .socket
            .set_filters(&kernel_filters)
            .map_err(|e| {
                EndpointError::Bus(format!(
                    "failed to apply {} filters on {}: {}",
                    filters.len(),
                    self.channel,
                    e
                ))
            })?;

        log::debug!(
            "{}: installed {} receive filters",
            self.channel,
            filters.len()
        );
        Ok(())
    }

    fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        log::debug!("{}: closed", self.channel);
    }

    fn channel(&self) -> &str {
        &self.channel
    }
}

fn send_on(shared: &SocketShared, channel: &str, frame: &CanFrame) -> Result<()> {
    if shared.closed.load(Ordering::SeqCst) {
        return Err(EndpointError::BusClosed);
    }

    let socket_frame = to_socket_frame(frame)?;
    let mut attempts = 0;

    loop {
        match shared.socket.write_frame(&socket_frame) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock && attempts < SEND_RETRIES => {
                attempts += 1;
                thread::sleep(SEND_RETRY_DELAY);
            }
            Err(e) => {
                return Err(EndpointError::Bus(format!(
                    "send of 0x{:X} on {} failed: {}",
                    frame.id, channel, e
                )));
            }
        }
    }
}

fn to_socket_frame(frame: &CanFrame) -> Result<socketcan::CanFrame> {
    let id = if frame.extended {
        ExtendedId::new(frame.id).map(Id::Extended)
    } else {
        StandardId::new(frame.id as u16).map(Id::Standard)
    }
    .ok_or_else(|| EndpointError::InvalidFrameId(format!("0x{:X}", frame.id)))?;

    socketcan::CanFrame::new(id, &frame.data).ok_or_else(|| {
        EndpointError::Bus(format!(
            "frame 0x{:X} payload of {} bytes rejected",
            frame.id,
            frame.data.len()
        ))
    })
}

/// Convert an incoming socket frame; remote and error frames yield `None`
fn from_socket_frame(socket_frame: &socketcan::CanFrame) -> Option<CanFrame> {
    match socket_frame {
        socketcan::CanFrame::Data(data_frame) => Some(CanFrame::with_id_flag(
            data_frame.raw_id(),
            data_frame.is_extended(),
            data_frame.data().to_vec(),
        )),
        socketcan::CanFrame::Remote(_) | socketcan::CanFrame::Error(_) => None,
    }
}

/// Map a filter onto kernel can_filter semantics.
///
/// The EFF flag participates in matching, so exact standard filters must
/// mask it to keep same-numbered extended frames out, and extended filters
/// must require it.
fn to_kernel_filter(filter: &CanIdFilter) -> socketcan::CanFilter {
    if filter.extended {
        socketcan::CanFilter::new(filter.id | CAN_EFF_FLAG, filter.mask | CAN_EFF_FLAG)
    } else {
        socketcan::CanFilter::new(filter.id, filter.mask | CAN_EFF_FLAG)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_frame_conversion_round_trip() {
        let frame = CanFrame::new(0x123, vec![1, 2, 3]);
        let socket_frame = to_socket_frame(&frame).unwrap();
        let back = from_socket_frame(&socket_frame).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_extended_frame_conversion_round_trip() {
        let frame = CanFrame::new_extended(0x1234_5678, vec![0xDE, 0xAD]);
        let socket_frame = to_socket_frame(&frame).unwrap();
        let back = from_socket_frame(&socket_frame).unwrap();
        assert_eq!(back, frame);
        assert!(back.extended);
    }

    #[test]
    fn test_remote_frames_are_dropped() {
        let id = Id::Standard(StandardId::new(0x123).unwrap());
        let remote = socketcan::CanFrame::new_remote(id, 4).unwrap();
        assert!(from_socket_frame(&remote).is_none());
    }
}
