//! Error taxonomy of the session core.
//!
//! Authentication and replay failures are reported to the local caller only. The
//! session manager drops such datagrams and never answers them on the wire.

use std::fmt;

use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed caller input, detected synchronously.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// MIC verification failed on decrypt.
    #[error("message authentication failed")]
    AuthenticationFailure,

    /// Message counter already seen or below the receive window.
    #[error("message counter {0} replayed or outside receive window")]
    ReplayOrOutOfWindow(u32),

    /// No free slot in the peer connection table and nothing idle to evict.
    #[error("peer connection table full")]
    ResourceExhausted,

    /// Underlying primitive failed (RNG, cipher setup). Fatal for the message only.
    #[error("crypto primitive failure: {0}")]
    CryptoFailure(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(HandshakeFailure),

    /// Send counter reached its maximum. The session has to be torn down.
    #[error("message counter exhausted, session must be re-established")]
    CounterExhausted,

    #[error("session not established")]
    SessionNotEstablished,

    #[error("no session with local id {0}")]
    UnknownSession(u16),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl Error {
    pub(crate) fn malformed(e: impl fmt::Display) -> Self {
        Error::MalformedMessage(e.to_string())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// True for failures that are dropped silently on the receive path.
    pub fn is_silent_drop(&self) -> bool {
        matches!(
            self,
            Error::AuthenticationFailure
                | Error::ReplayOrOutOfWindow(_)
                | Error::UnknownSession(_)
                | Error::MalformedMessage(_)
        )
    }
}

/// Local detail of a handshake failure. Only ever logged or handed to the local
/// delegate; the peer always sees the same generic status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeFailure {
    ConfirmationMismatch,
    MalformedMessage,
    PeerRejected,
    Timeout,
    Cancelled,
    CryptoFailure,
    ResourceExhausted,
}

impl fmt::Display for HandshakeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeFailure::ConfirmationMismatch => write!(f, "key confirmation mismatch"),
            HandshakeFailure::MalformedMessage => write!(f, "malformed handshake message"),
            HandshakeFailure::PeerRejected => write!(f, "peer reported failure"),
            HandshakeFailure::Timeout => write!(f, "no progress before timeout"),
            HandshakeFailure::Cancelled => write!(f, "cancelled"),
            HandshakeFailure::CryptoFailure => write!(f, "crypto failure"),
            HandshakeFailure::ResourceExhausted => write!(f, "no session slot available"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receive_path_failures_are_silent() {
        assert!(Error::AuthenticationFailure.is_silent_drop());
        assert!(Error::ReplayOrOutOfWindow(7).is_silent_drop());
        assert!(Error::UnknownSession(3).is_silent_drop());
        assert!(Error::malformed("short").is_silent_drop());
        assert!(!Error::CryptoFailure("rng".into()).is_silent_drop());
        assert!(!Error::CounterExhausted.is_silent_drop());
        assert!(!Error::invalid("x").is_silent_drop());
    }

    #[test]
    fn handshake_failures_render() {
        let e = Error::HandshakeFailed(HandshakeFailure::ResourceExhausted);
        assert_eq!(e.to_string(), "handshake failed: no session slot available");
    }
}
