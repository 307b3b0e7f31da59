//! Transport trait abstraction for the messaging network connection.
//!
//! The wire protocol (handshake, encryption, message encoding) lives behind
//! the [`Transport`] trait. The session layer only sees three things: a way
//! to connect, a way to push opaque frames at an address, and a stream of
//! [`ConnectionUpdate`] events describing the connection lifecycle.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::credentials::Credentials;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The network refused to issue a pairing code
    #[error("Pairing code request rejected: {0}")]
    PairingRejected(String),

    /// A frame could not be delivered
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Transport-specific error
    #[error("Transport error: {0}")]
    Other(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// How the session layer should react to a connection close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseClass {
    /// Network drop, timeout or server-requested restart; reconnect
    Retryable,
    /// Logged out, forbidden or replaced elsewhere; credentials are void
    Fatal,
}

/// Reason attached to a connection close, numbered like the network's status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DisconnectReason {
    /// 401: the linked device was logged out from the phone
    LoggedOut,
    /// 403: the account is not allowed to connect
    Forbidden,
    /// 408: the connection timed out
    TimedOut,
    /// 411: the multi-device state no longer matches
    MultideviceMismatch,
    /// 428: the connection was closed by the server
    ConnectionClosed,
    /// 440: another client took over this identity
    ConnectionReplaced,
    /// 500: the session state could not be decoded
    BadSession,
    /// 503: the service is temporarily unavailable
    Unavailable,
    /// 515: the server asked the client to restart the stream
    RestartRequired,
    /// The event stream ended without an explicit close
    ConnectionLost,
    /// Any other status code
    Unknown(u16),
}

impl DisconnectReason {
    /// Map a raw status code to a reason
    #[must_use]
    pub fn from_status_code(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            403 => Self::Forbidden,
            408 => Self::TimedOut,
            411 => Self::MultideviceMismatch,
            428 => Self::ConnectionClosed,
            440 => Self::ConnectionReplaced,
            500 => Self::BadSession,
            503 => Self::Unavailable,
            515 => Self::RestartRequired,
            other => Self::Unknown(other),
        }
    }

    /// Raw status code for this reason
    #[must_use]
    pub fn status_code(self) -> u16 {
        match self {
            Self::LoggedOut => 401,
            Self::Forbidden => 403,
            Self::TimedOut | Self::ConnectionLost => 408,
            Self::MultideviceMismatch => 411,
            Self::ConnectionClosed => 428,
            Self::ConnectionReplaced => 440,
            Self::BadSession => 500,
            Self::Unavailable => 503,
            Self::RestartRequired => 515,
            Self::Unknown(code) => code,
        }
    }

    /// Classify the close.
    ///
    /// Only reasons that invalidate the stored credentials are fatal. Unknown
    /// codes are retried; the bounded retry budget catches anything that
    /// keeps failing.
    #[must_use]
    pub fn classify(self) -> CloseClass {
        match self {
            Self::LoggedOut
            | Self::Forbidden
            | Self::MultideviceMismatch
            | Self::ConnectionReplaced => CloseClass::Fatal,
            _ => CloseClass::Retryable,
        }
    }

    /// Shorthand for `classify() == CloseClass::Fatal`
    #[must_use]
    pub fn is_fatal(self) -> bool {
        self.classify() == CloseClass::Fatal
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::LoggedOut => "logged out",
            Self::Forbidden => "forbidden",
            Self::TimedOut => "timed out",
            Self::MultideviceMismatch => "multi-device mismatch",
            Self::ConnectionClosed => "connection closed",
            Self::ConnectionReplaced => "connection replaced",
            Self::BadSession => "bad session",
            Self::Unavailable => "service unavailable",
            Self::RestartRequired => "restart required",
            Self::ConnectionLost => "connection lost",
            Self::Unknown(_) => "unknown",
        };
        write!(f, "{label} ({})", self.status_code())
    }
}

/// Lifecycle event emitted by a transport (`connection.update` / `creds.update`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionUpdate {
    /// Handshake in progress
    Connecting,
    /// Connection authenticated and usable
    Open,
    /// Connection closed
    Close(DisconnectReason),
    /// Credentials rotated; must be persisted
    CredsUpdated(Credentials),
}

/// A live connection to the messaging network.
///
/// One value per physical connection. The session layer never reuses a
/// transport after calling [`Transport::shutdown`]; it asks the
/// [`TransportFactory`] for a fresh one instead.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start the handshake. Progress is reported on the event stream.
    ///
    /// # Errors
    /// Returns `TransportError` if the connection cannot be started
    async fn connect(&self) -> TransportResult<()>;

    /// Ask the network for a short-lived numeric code that links this client
    /// to the account behind `phone_number` (canonical digits).
    ///
    /// # Errors
    /// Returns `TransportError::PairingRejected` if no code is issued
    async fn request_pairing_code(&self, phone_number: &str) -> TransportResult<String>;

    /// Send one opaque protocol frame to `address`.
    ///
    /// # Errors
    /// Returns `TransportError` if the frame is not accepted
    async fn send_raw(&self, address: &str, frame: &[u8]) -> TransportResult<()>;

    /// Close the connection and release resources.
    ///
    /// # Errors
    /// Returns `TransportError` if closing fails
    async fn shutdown(&self) -> TransportResult<()>;

    /// Check if the transport is closed.
    fn is_closed(&self) -> bool;
}

/// A freshly constructed transport together with its event stream.
pub struct TransportChannel {
    /// The connection handle
    pub transport: Arc<dyn Transport>,
    /// `connection.update` / `creds.update` events, in order
    pub events: mpsc::Receiver<ConnectionUpdate>,
}

impl fmt::Debug for TransportChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportChannel")
            .field("closed", &self.transport.is_closed())
            .finish_non_exhaustive()
    }
}

/// Builds transports. Every (re)initialization of a session asks for a new one.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Create a transport authenticated with `credentials`, if any.
    ///
    /// # Errors
    /// Returns `TransportError` if the transport cannot be constructed
    async fn create(&self, credentials: Option<Credentials>) -> TransportResult<TransportChannel>;
}
