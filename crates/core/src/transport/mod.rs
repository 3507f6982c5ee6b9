//! Datagram transport.
//!
//! The receive loop reads from a [`DatagramSource`]: a blocking receive
//! bounded by a short timeout, so the loop can notice a stop request even
//! when the stream is idle. [`UdpTransport`] is the production source; tests
//! plug in in-memory sources.

pub mod udp;

pub use udp::UdpTransport;

use crate::error::Result;

/// Blocking-with-timeout datagram source owned by the receive worker.
pub trait DatagramSource: Send {
    /// Receive one datagram into `buf`.
    ///
    /// Returns `Ok(Some(len))` for a datagram, `Ok(None)` when the timeout
    /// elapsed without one, and `Err` for a transport failure that should
    /// end the receive loop.
    fn receive(&mut self, buf: &mut [u8]) -> Result<Option<usize>>;

    /// Release the underlying resource. Called once when the loop exits.
    fn close(&mut self) {}
}
