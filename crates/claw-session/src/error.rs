//! Error types for claw-session.

use thiserror::Error;

/// Errors returned by the session library.
///
/// The connection manager itself never surfaces these to callers of
/// `connect`/`disconnect`/`send_message`; they appear at the configuration
/// and identity boundaries.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Identity was empty or whitespace only.
    #[error("identity must not be empty")]
    EmptyIdentity,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A session URL could not be built.
    #[error("invalid session url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by a transport.
///
/// Cloneable so a failure can be fanned out to every handler as part of an
/// [`crate::ConnectionEvent::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The transport could not be constructed at all.
    #[error("transport construction failed: {0}")]
    Construction(String),

    /// The connection handshake failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The peer violated the framing protocol or the socket failed mid-stream.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The transport is already closed.
    #[error("transport closed")]
    Closed,

    /// Writing an outbound frame failed.
    #[error("send failed: {0}")]
    Send(String),
}
