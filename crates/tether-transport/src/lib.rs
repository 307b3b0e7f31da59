//! # Tether Transport
//!
//! Seams between the Tether session layer and the outside world.
//!
//! This crate provides:
//! - The `Transport` trait: connect, pairing-code request, raw frame send
//! - `ConnectionUpdate` lifecycle events and `DisconnectReason` classification
//! - The `TransportFactory` used to build a fresh transport per initialization
//! - The `CredentialStore` trait with directory-backed and in-memory stores

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod credentials;
pub mod transport;

pub use credentials::{
    CredentialError, CredentialResult, CredentialStore, Credentials, FileCredentialStore,
    MemoryCredentialStore,
};
pub use transport::{
    CloseClass, ConnectionUpdate, DisconnectReason, Transport, TransportChannel, TransportError,
    TransportFactory, TransportResult,
};
