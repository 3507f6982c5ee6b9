use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use crate::error::Result;

use super::DatagramSource;

/// UDP socket carrying the datagram stream.
///
/// On the receive side the socket is bound to the listening address with a
/// read timeout; on the send side it is bound to an ephemeral port and used
/// with [`send_to`](Self::send_to). One stream per socket.
pub struct UdpTransport {
    socket: UdpSocket,
    peer: Option<SocketAddr>,
}

impl UdpTransport {
    /// Bind to `addr` with the given receive timeout.
    pub fn bind(addr: &str, recv_timeout: Duration) -> Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(recv_timeout))?;
        Ok(Self { socket, peer: None })
    }

    /// Bind an ephemeral socket for sending.
    pub fn ephemeral() -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        Ok(Self { socket, peer: None })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Send raw bytes to a specific socket address.
    pub fn send_to(&self, payload: &[u8], addr: SocketAddr) -> Result<usize> {
        Ok(self.socket.send_to(payload, addr)?)
    }
}

impl DatagramSource for UdpTransport {
    fn receive(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        match self.socket.recv_from(buf) {
            Ok((len, from)) => {
                if self.peer != Some(from) {
                    tracing::debug!(peer = %from, "receiving from new sender");
                    self.peer = Some(from);
                }
                Ok(Some(len))
            }
            // Unix reports an elapsed read timeout as WouldBlock, Windows as TimedOut.
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn close(&mut self) {
        tracing::debug!(peer = ?self.peer, "UDP transport closed");
    }
}
