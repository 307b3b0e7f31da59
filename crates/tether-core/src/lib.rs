//! # Tether Core
//!
//! Device-linking session manager and rate-limited dispatch for a
//! multi-device messaging network.
//!
//! This crate provides:
//! - Phone number normalization and addressing
//! - The session state machine and its owner, with pairing-code issuance,
//!   bounded reconnection and credential purge on fatal closes
//! - A sequential, per-attempt-isolated dispatch pipeline
//! - A per-operator cooldown limiter with a periodic sweep
//! - Error types and configuration
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         LinkService                             │
//! │   (request facade: pair, send, clear, status)                   │
//! ├────────────────────┬────────────────────┬───────────────────────┤
//! │  CooldownLimiter   │  DispatchPipeline  │    SessionManager     │
//! │  (per operator)    │  (per job)         │  (one per process)    │
//! ├────────────────────┴────────────────────┴───────────────────────┤
//! │                tether-transport: Transport, CredentialStore     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod rate_limiter;
pub mod service;
pub mod session;
pub mod session_manager;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::LinkConfig;
pub use dispatch::{
    AttemptOutcome, DispatchJob, DispatchPipeline, DispatchReport, MessageBuilder,
    MessageTemplate, StrategyTable, SuccessPolicy, Variant,
};
pub use error::{LinkError, Result};
pub use identity::{PhoneNumber, PhoneNumberError};
pub use rate_limiter::{CooldownConfig, CooldownLimiter, RateDecision, Reservation, SweeperHandle};
pub use service::{LinkService, Response, SendOutcome, SendRequest};
pub use session::{Session, SessionEvent, SessionState, SessionStatus, Transition};
pub use session_manager::{PairingOutcome, SessionManager};
