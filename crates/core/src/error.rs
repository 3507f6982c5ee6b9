//! Error types for the stream receiver library.

/// Errors that can occur in the stream receiver library.
///
/// Per-packet faults (short datagrams, orphan fragments, unrecoverable FEC
/// groups) are handled locally by the pipeline and only surface here when a
/// caller parses or builds packets directly:
///
/// - **Codec**: [`MalformedPacket`](Self::MalformedPacket),
///   [`PayloadTooLarge`](Self::PayloadTooLarge).
/// - **Transport**: [`Io`](Self::Io): socket failures. A receive timeout is
///   not an error; [`DatagramSource::receive`](crate::transport::DatagramSource::receive)
///   reports it as `Ok(None)`.
/// - **Configuration**: [`InvalidConfig`](Self::InvalidConfig).
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Datagram shorter than the 4-byte header.
    #[error("malformed packet: {len} bytes, header needs {}", crate::packet::HEADER_LEN)]
    MalformedPacket { len: usize },

    /// Payload exceeds what the writer is allowed to put in one datagram.
    #[error("payload of {len} bytes exceeds maximum of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    /// A configuration value is out of range (e.g. a zero group size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Convenience alias for `Result<T, StreamError>`.
pub type Result<T> = std::result::Result<T, StreamError>;
