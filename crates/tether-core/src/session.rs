//! Session state machine.
//!
//! A [`Session`] is this process's single logical connection to the
//! network: the identity being linked, the lifecycle state, the pairing code
//! while one is outstanding and the reconnect counter. It holds no I/O; the
//! [`SessionManager`](crate::session_manager::SessionManager) feeds it
//! [`SessionEvent`]s and performs the side effects each [`Transition`] calls for.
//!
//! ```text
//!            connect                code issued
//!   Idle ────────────► Initializing ───────────► AwaitingPairing
//!    ▲                  │   ▲    │ open                │ open
//!    │ expired/timeout  │   │    ▼                     ▼
//!    ├──────────────────┘   │  Connected ◄─────────────┘
//!    │              backoff │    │ retryable close
//!    │                      │    ▼
//!    │                   Reconnecting ──(retries exhausted / fatal)──► Failed
//!    └─────────────── clear (from any state) ─────────────────────────────┘
//! ```

use serde::Serialize;
use tether_transport::{CloseClass, DisconnectReason};

use crate::error::{LinkError, Result};
use crate::identity::PhoneNumber;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    /// No connection, no attempt in flight
    Idle,
    /// Transport being created and connected
    Initializing,
    /// Pairing code issued, waiting for the user to enter it on the device
    AwaitingPairing,
    /// Connection open and usable
    Connected,
    /// Waiting out the backoff before the next initialization
    Reconnecting,
    /// Fatal close or retries exhausted; needs an explicit new connect
    Failed,
}

/// Input to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Caller asked to link `PhoneNumber`
    Connect(PhoneNumber),
    /// Transport issued a pairing code
    PairingCodeIssued(String),
    /// Transport reported `open`
    Open,
    /// Transport reported `close`
    Close(DisconnectReason),
    /// Transport could not be created or connected
    InitFailed(String),
    /// Reconnect backoff elapsed
    BackoffElapsed,
    /// Pairing code validity window passed without `open`
    PairingExpired,
    /// Caller gave up waiting for a pairing code
    PairingTimedOut,
    /// Session forcibly cleared
    Cleared,
}

impl SessionEvent {
    /// Short event name for logs and errors
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::PairingCodeIssued(_) => "pairing_code_issued",
            Self::Open => "open",
            Self::Close(_) => "close",
            Self::InitFailed(_) => "init_failed",
            Self::BackoffElapsed => "backoff_elapsed",
            Self::PairingExpired => "pairing_expired",
            Self::PairingTimedOut => "pairing_timed_out",
            Self::Cleared => "cleared",
        }
    }
}

/// Result of applying one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State before the event
    pub from: SessionState,
    /// State after the event
    pub to: SessionState,
    /// Event name
    pub event: &'static str,
}

impl Transition {
    /// Whether the state changed
    #[must_use]
    pub fn is_change(&self) -> bool {
        self.from != self.to
    }

    /// Whether the transition entered `state`
    #[must_use]
    pub fn entered(&self, state: SessionState) -> bool {
        self.is_change() && self.to == state
    }
}

/// Read-only view of the session, as served to status pollers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    /// Lifecycle state
    pub state: SessionState,
    /// `state == Connected`
    pub connected: bool,
    /// `state == Initializing`
    pub is_initializing: bool,
    /// A pairing code is outstanding
    pub pairing_present: bool,
    /// The outstanding pairing code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing_code: Option<String>,
    /// Identity being linked
    pub phone_number: Option<String>,
    /// Reconnect attempts since the last `open`
    pub retries: u32,
    /// Why the session failed, when `state == Failed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    /// The last pairing code expired unused; a new one must be requested
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub pairing_expired: bool,
}

/// The session state machine
#[derive(Debug, Clone)]
pub struct Session {
    state: SessionState,
    identity: Option<PhoneNumber>,
    pairing_code: Option<String>,
    retry_count: u32,
    max_retries: u32,
    failure: Option<String>,
    pairing_expired: bool,
}

impl Session {
    /// Idle session allowing `max_retries` retryable closes between opens
    #[must_use]
    pub fn new(max_retries: u32) -> Self {
        Self {
            state: SessionState::Idle,
            identity: None,
            pairing_code: None,
            retry_count: 0,
            max_retries,
            failure: None,
            pairing_expired: false,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Identity being linked
    #[must_use]
    pub fn identity(&self) -> Option<&PhoneNumber> {
        self.identity.as_ref()
    }

    /// Outstanding pairing code
    #[must_use]
    pub fn pairing_code(&self) -> Option<&str> {
        self.pairing_code.as_deref()
    }

    /// Retryable closes since the last `open`
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Failure reason while `Failed`
    #[must_use]
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Snapshot for status reporting
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            connected: self.state == SessionState::Connected,
            is_initializing: self.state == SessionState::Initializing,
            pairing_present: self.pairing_code.is_some(),
            pairing_code: self.pairing_code.clone(),
            phone_number: self.identity.as_ref().map(|id| id.as_str().to_string()),
            retries: self.retry_count,
            failure: self.failure.clone(),
            pairing_expired: self.pairing_expired,
        }
    }

    /// Apply an event.
    ///
    /// # Errors
    ///
    /// - `LinkError::AlreadyConnected` for `Connect` while connected
    /// - `LinkError::AlreadyInitializing` for `Connect` while an attempt is in flight
    /// - `LinkError::InvalidTransition` for events that make no sense in the
    ///   current state; the session is left unchanged
    pub fn apply(&mut self, event: SessionEvent) -> Result<Transition> {
        use SessionState::{AwaitingPairing, Connected, Failed, Idle, Initializing, Reconnecting};

        let from = self.state;
        let name = event.name();
        let invalid = || LinkError::InvalidTransition { from, event: name };

        match event {
            SessionEvent::Cleared => self.reset(),

            SessionEvent::Connect(identity) => match from {
                Idle | Failed => {
                    self.identity = Some(identity);
                    self.retry_count = 0;
                    self.failure = None;
                    self.pairing_expired = false;
                    self.state = Initializing;
                }
                Connected => return Err(LinkError::AlreadyConnected),
                Initializing | AwaitingPairing | Reconnecting => {
                    return Err(LinkError::AlreadyInitializing);
                }
            },

            SessionEvent::PairingCodeIssued(code) => match from {
                Initializing => {
                    self.pairing_code = Some(code);
                    self.state = AwaitingPairing;
                }
                _ => return Err(invalid()),
            },

            SessionEvent::Open => match from {
                Initializing | AwaitingPairing | Reconnecting => {
                    self.pairing_code = None;
                    self.retry_count = 0;
                    self.failure = None;
                    self.state = Connected;
                }
                Connected => {}
                Idle | Failed => return Err(invalid()),
            },

            SessionEvent::Close(reason) => match from {
                Initializing | AwaitingPairing | Connected | Reconnecting => {
                    match reason.classify() {
                        CloseClass::Fatal => self.fail(reason.to_string()),
                        CloseClass::Retryable => self.retry_or_fail(reason.to_string()),
                    }
                }
                Idle | Failed => {}
            },

            SessionEvent::InitFailed(detail) => match from {
                Initializing => self.retry_or_fail(detail),
                _ => return Err(invalid()),
            },

            SessionEvent::BackoffElapsed => match from {
                Reconnecting => self.state = Initializing,
                _ => return Err(invalid()),
            },

            SessionEvent::PairingExpired => match from {
                AwaitingPairing => {
                    self.reset();
                    self.pairing_expired = true;
                }
                _ => return Err(invalid()),
            },

            SessionEvent::PairingTimedOut => match from {
                Initializing | AwaitingPairing | Reconnecting => self.reset(),
                _ => return Err(invalid()),
            },
        }

        debug_assert_eq!(
            self.pairing_code.is_some(),
            self.state == AwaitingPairing,
            "pairing code must be present exactly while awaiting pairing"
        );

        let transition = Transition {
            from,
            to: self.state,
            event: name,
        };
        if transition.is_change() {
            tracing::info!(
                from = ?transition.from,
                to = ?transition.to,
                event = transition.event,
                retries = self.retry_count,
                "Session state transition"
            );
        }
        Ok(transition)
    }

    fn reset(&mut self) {
        self.state = SessionState::Idle;
        self.identity = None;
        self.pairing_code = None;
        self.retry_count = 0;
        self.failure = None;
        self.pairing_expired = false;
    }

    fn fail(&mut self, reason: String) {
        self.pairing_code = None;
        self.failure = Some(reason);
        self.state = SessionState::Failed;
    }

    fn retry_or_fail(&mut self, reason: String) {
        self.pairing_code = None;
        if self.retry_count < self.max_retries {
            self.retry_count += 1;
            self.state = SessionState::Reconnecting;
        } else {
            self.fail(format!(
                "gave up after {} retries: {reason}",
                self.retry_count
            ));
        }
    }
}
