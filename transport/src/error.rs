use std::io;
use thiserror::Error;

/// Errors surfaced to the application. Anomalies on the wire (malformed datagrams, identifier
///  mismatches, corrupt subpacket lengths) never show up here: they are logged and dropped, and
///  the protocol's redundancy / NAK handling recovers from them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("operation is not valid in the connection's current state")]
    BadState,
    #[error("endpoint string could not be parsed")]
    BadAddress,
    #[error("socket could not be created")]
    NoResources,
    #[error("bind failed, even on an ephemeral port")]
    Unexpected,
    #[error("message of {len} bytes exceeds the maximum of {max}")]
    OversizedMessage { len: usize, max: usize },
    #[error("send queue is full")]
    WouldBlock,
    #[error("no data available")]
    NoData,
    #[error("buffer too small, {needed} bytes needed")]
    BufferTooSmall { needed: usize },
    #[error("invalid connection option")]
    InvalidOption,
    #[error("unknown connection handle")]
    UnknownConnection,
    #[error("connection closed after socket failure: {0:?}")]
    SocketFailure(io::ErrorKind),
}

pub type TransportResult<T> = Result<T, TransportError>;
