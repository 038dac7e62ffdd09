//! Error types shared by channels, the connection registry and the acceptor.

use bitcoin::consensus::encode;
use std::error::Error;
use std::fmt;
use std::io;
use std::sync::Arc;

/// Errors surfaced by the networking core.
///
/// A channel's terminal code fans out to every one of its subscribers, so
/// the I/O and codec sources are reference counted to keep the type cheaply
/// cloneable.
#[derive(Debug, Clone)]
pub enum NetworkError {
    /// Start was requested on a channel or listener that already ran.
    OperationFailed,
    /// The operation raced with, or arrived after, a channel stop.
    ChannelStopped,
    /// Framing violation: malformed heading, wrong magic, oversized
    /// payload, checksum mismatch or trailing bytes.
    BadStream,
    /// The registry or acceptor has been stopped.
    ServiceStopped,
    /// A registry member already uses the candidate's authority or nonce.
    AddressInUse,
    /// The channel is not a member of the registry.
    NotFound,
    /// An I/O error occurred during network operations.
    Io(Arc<io::Error>),
    /// The codec rejected a payload.
    Parse(Arc<encode::Error>),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::OperationFailed => write!(f, "Operation failed, already started"),
            NetworkError::ChannelStopped => write!(f, "Channel stopped"),
            NetworkError::BadStream => write!(f, "Invalid frame received on stream"),
            NetworkError::ServiceStopped => write!(f, "Service stopped"),
            NetworkError::AddressInUse => write!(f, "Address or nonce already registered"),
            NetworkError::NotFound => write!(f, "Channel not found"),
            NetworkError::Io(err) => write!(f, "Network error: {err}"),
            NetworkError::Parse(err) => write!(f, "Invalid payload: {err}"),
        }
    }
}

impl Error for NetworkError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            NetworkError::Io(err) => Some(err.as_ref()),
            NetworkError::Parse(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for NetworkError {
    fn from(err: io::Error) -> Self {
        NetworkError::Io(Arc::new(err))
    }
}

impl From<encode::Error> for NetworkError {
    fn from(err: encode::Error) -> Self {
        NetworkError::Parse(Arc::new(err))
    }
}
