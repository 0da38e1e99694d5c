//! UDP socket layer: the send/receive boundary of the DHT.

use std::io::ErrorKind;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use tracing::{debug, trace};

use crate::common::Message;

/// Receive buffer size, larger datagrams are truncated and will fail to decode.
pub const MTU: usize = 8192;
/// How long a blocking read waits before letting the reader check for shutdown.
pub const READ_TIMEOUT: Duration = Duration::from_millis(50);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(15);

/// A UdpSocket wrapper that sends encoded DHT messages and receives raw datagrams.
#[derive(Debug)]
pub struct KrpcSocket {
    socket: UdpSocket,
    local_addr: SocketAddrV4,
}

impl KrpcSocket {
    /// Bind to the given address.
    ///
    /// Failing to bind is fatal to the node, there is no DHT without a socket.
    pub(crate) fn bind(address: SocketAddrV4) -> Result<Self, std::io::Error> {
        let socket = UdpSocket::bind(address)?;

        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => {
                return Err(std::io::Error::new(
                    ErrorKind::Unsupported,
                    "KrpcSocket does not support Ipv6",
                ))
            }
        };

        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        socket.set_write_timeout(Some(WRITE_TIMEOUT))?;

        Ok(Self { socket, local_addr })
    }

    #[cfg(test)]
    pub(crate) fn localhost() -> Result<Self, std::io::Error> {
        Self::bind(SocketAddrV4::new([127, 0, 0, 1].into(), 0))
    }

    // === Getters ===

    /// Returns the address the socket is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    // === Public Methods ===

    /// Encode and send a message, fire and forget.
    pub fn send(&self, address: SocketAddrV4, message: &Message) -> Result<(), SendMessageError> {
        let bytes = message.to_bytes()?;
        self.send_bytes(address, &bytes)?;
        trace!(context = "socket_message_sending", ?address, ?message);
        Ok(())
    }

    /// Send already encoded bytes, used to retry a request verbatim.
    pub fn send_bytes(&self, address: SocketAddrV4, bytes: &[u8]) -> Result<(), std::io::Error> {
        self.socket.send_to(bytes, address)?;
        Ok(())
    }

    /// Receives a single datagram on the socket.
    ///
    /// Returns `None` when the read timed out, or the datagram is unusable;
    /// errors are logged and never fatal.
    pub fn recv_from(&self) -> Option<(Vec<u8>, SocketAddrV4)> {
        let mut buf = [0u8; MTU];

        match self.socket.recv_from(&mut buf) {
            Ok((amt, SocketAddr::V4(from))) => {
                if from.port() == 0 {
                    trace!(
                        context = "socket_validation",
                        message = "Response from port 0"
                    );
                    return None;
                }

                Some((buf[..amt].to_vec(), from))
            }
            Ok((_, SocketAddr::V6(_))) => {
                trace!(
                    context = "socket_validation",
                    message = "Received IPv6 packet"
                );
                None
            }
            Err(ref e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => None,
            Err(e) => {
                debug!(context = "socket_error", ?e, "recv_from failed");
                None
            }
        }
    }
}

#[derive(thiserror::Error, Debug)]
/// Failure to hand a message to the transport.
pub enum SendMessageError {
    /// Errors related to encoding DHT messages.
    #[error("Failed to encode message: {0}")]
    Encode(#[from] crate::Error),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),
}
