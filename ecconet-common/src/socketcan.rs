//! Linux socketcan adapter for running a node against a real or virtual bus

use std::sync::Arc;

use crate::frame::CanFrame;
use socketcan::{CanSocket, EmbeddedFrame, ExtendedId, Frame, ShouldRetry, Socket};
use tokio::io::{unix::AsyncFd, Interest};

fn socketcan_frame_to_ecconet(frame: socketcan::CanFrame) -> Option<CanFrame> {
    // ECCONet traffic rides exclusively in 29-bit extended data frames
    match (frame.can_id(), frame) {
        (socketcan::CanId::Extended(id), socketcan::CanFrame::Data(data)) => {
            Some(CanFrame::new(id.as_raw(), data.data()))
        }
        _ => None,
    }
}

fn ecconet_frame_to_socketcan(frame: CanFrame) -> socketcan::CanFrame {
    let id = ExtendedId::new(frame.id() & ExtendedId::MAX.as_raw()).unwrap();
    socketcan::CanFrame::new(id, frame.data()).unwrap()
}

/// An async socket around a socketcan `CanSocket`, with non-blocking
/// `try_read_frame` support on top of the async accessors.
#[derive(Debug)]
struct AsyncCanSocket(AsyncFd<CanSocket>);

impl AsyncCanSocket {
    fn open(ifname: &str) -> Result<Self, std::io::Error> {
        let socket = CanSocket::open(ifname)?;
        socket.set_nonblocking(true)?;
        Ok(Self(AsyncFd::new(socket)?))
    }

    fn try_read_frame(&self) -> Result<socketcan::CanFrame, std::io::Error> {
        self.0.get_ref().read_frame()
    }

    async fn read_frame(&self) -> Result<socketcan::CanFrame, std::io::Error> {
        self.0
            .async_io(Interest::READABLE, |inner| inner.read_frame())
            .await
    }

    async fn write_frame(&self, frame: &socketcan::CanFrame) -> Result<(), std::io::Error> {
        self.0
            .async_io(Interest::WRITABLE, |inner| inner.write_frame(frame))
            .await
    }
}

/// Receives ECCONet frames from a socketcan interface.
#[derive(Debug, Clone)]
pub struct SocketCanReceiver {
    socket: Arc<AsyncCanSocket>,
}

impl SocketCanReceiver {
    /// Read an available frame without blocking
    ///
    /// Non-ECCONet traffic (standard-ID or remote frames) is discarded.
    pub fn try_recv(&mut self) -> Option<CanFrame> {
        match self.socket.try_read_frame() {
            Ok(frame) => socketcan_frame_to_ecconet(frame),
            Err(_) => None,
        }
    }

    /// Receive the next ECCONet frame
    pub async fn recv(&mut self) -> Result<CanFrame, std::io::Error> {
        loop {
            match self.socket.read_frame().await {
                Ok(frame) => {
                    if let Some(frame) = socketcan_frame_to_ecconet(frame) {
                        return Ok(frame);
                    }
                }
                Err(e) => {
                    if !e.should_retry() {
                        return Err(e);
                    }
                }
            }
        }
    }
}

/// Sends ECCONet frames on a socketcan interface.
#[derive(Debug, Clone)]
pub struct SocketCanSender {
    socket: Arc<AsyncCanSocket>,
}

impl SocketCanSender {
    /// Send a frame, returning it on failure
    pub async fn send(&mut self, frame: CanFrame) -> Result<(), CanFrame> {
        let socketcan_frame = ecconet_frame_to_socketcan(frame);
        match self.socket.write_frame(&socketcan_frame).await {
            Ok(()) => Ok(()),
            Err(_) => Err(frame),
        }
    }
}

/// Open a socketcan device and split it into a sender and a receiver.
///
/// Creating both ends from one shared socket keeps the receiver from
/// seeing frames the sender put on the bus.
///
/// # Arguments
/// * `device` - The socketcan device name, e.g. "vcan0" or "can0"
pub fn open_socketcan<S: AsRef<str>>(
    device: S,
) -> Result<(SocketCanSender, SocketCanReceiver), std::io::Error> {
    let socket = Arc::new(AsyncCanSocket::open(device.as_ref())?);
    let receiver = SocketCanReceiver {
        socket: socket.clone(),
    };
    let sender = SocketCanSender { socket };
    Ok((sender, receiver))
}
