//! Error types for the Tether core
//!
//! Errors are kinded so the request boundary can tell a user-facing
//! validation failure from a condition worth retrying.
//!
//! # Error Categories
//!
//! - **Validation**: bad phone number / recipient, bad job parameters. Never
//!   reach the transport and never change state.
//! - **State**: the session is not in a state that allows the operation.
//! - **Transient**: transport trouble that the session manager retries on its own.
//! - **Fatal**: the session failed and needs a fresh pairing.

use std::borrow::Cow;
use tether_transport::{CredentialError, TransportError};
use thiserror::Error;

use crate::identity::PhoneNumberError;
use crate::session::SessionState;

/// Errors raised by the session manager, dispatch pipeline and configuration
#[derive(Debug, Error)]
pub enum LinkError {
    // ============ Validation Errors ============
    /// Device identity is not a valid phone number
    #[error("Invalid phone number: {0}")]
    InvalidIdentity(PhoneNumberError),

    /// Dispatch recipient is not a valid phone number
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(PhoneNumberError),

    /// Dispatch job parameters out of range
    #[error("Invalid dispatch job: {0}")]
    InvalidJob(Cow<'static, str>),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    // ============ State Errors ============
    /// Session is already connected
    #[error("Session is already connected")]
    AlreadyConnected,

    /// A connection attempt is already in flight
    #[error("A connection attempt is already in progress")]
    AlreadyInitializing,

    /// Operation needs a connected session
    #[error("Session is not connected")]
    NotConnected,

    /// State machine rejected an event
    #[error("Invalid transition from {from:?}: {event}")]
    InvalidTransition {
        /// State the session was in
        from: SessionState,
        /// Event that was rejected
        event: &'static str,
    },

    // ============ Pairing Errors ============
    /// No pairing code became available within the wait window
    #[error("Timed out waiting for a pairing code")]
    PairingTimeout,

    /// The pairing code expired before the device was linked
    #[error("Pairing code expired; request a new one")]
    PairingExpired,

    /// The wait was cancelled by a session clear
    #[error("Session was cleared")]
    Cancelled,

    /// The session failed and must be paired again
    #[error("Session failed: {0}")]
    SessionFailed(String),

    // ============ Collaborator Errors ============
    /// Transport operation failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Credential store operation failed
    #[error("Credential store error: {0}")]
    Credentials(#[from] CredentialError),
}

impl LinkError {
    /// Returns true for errors caused by caller input rather than system state
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidIdentity(_)
                | Self::InvalidRecipient(_)
                | Self::InvalidJob(_)
                | Self::InvalidConfig(_)
        )
    }

    /// Returns true if this error is transient and the same call may succeed later
    ///
    /// Transient errors include:
    /// - A connection attempt still in flight
    /// - Pairing wait timeouts
    /// - Transport failures
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::AlreadyInitializing
                | Self::NotConnected
                | Self::PairingTimeout
                | Self::PairingExpired
                | Self::Transport(_)
        )
    }

    /// Returns true if the caller must pair the device again
    #[must_use]
    pub fn requires_repairing(&self) -> bool {
        matches!(self, Self::SessionFailed(_))
    }
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, LinkError>;
