//! Session management
//!
//! This module owns the one logical session of the process and everything
//! with a lifetime attached to it:
//! - The live transport handle and the task pumping its events
//! - The reconnect timer (fixed backoff, bounded retries)
//! - The pairing-code expiry timer
//! - Credential persistence on rotation, purge on fatal close
//!
//! # Concurrency
//!
//! All mutation happens under one `tokio::sync::Mutex`, so a second
//! `connect` racing the first observes `Initializing` and is rejected. The
//! lock is never held across transport I/O: initialization releases it while
//! connecting and re-checks an attempt token before installing the result,
//! so a `clear_session` in the meantime wins and the late transport is shut
//! down. Status readers never take the lock; every mutation publishes a
//! snapshot on a `watch` channel.
//!
//! # Tokens
//!
//! ```text
//! epoch       one logical pairing attempt (connect .. idle)
//! attempt     one initialization within it (bumped per reconnect)
//! generation  one transport; events from older transports are dropped
//! ```

use std::sync::{Arc, Weak};

use tether_transport::{
    ConnectionUpdate, CredentialStore, DisconnectReason, Transport, TransportFactory,
};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::LinkConfig;
use crate::error::{LinkError, Result};
use crate::identity::PhoneNumber;
use crate::session::{Session, SessionEvent, SessionState, SessionStatus, Transition};

/// Result of a successful pairing-code request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingOutcome {
    /// Enter this code on the target device
    Code(String),
    /// Stored credentials were accepted; no code needed
    Connected,
}

impl PairingOutcome {
    /// The code, if one was issued
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Code(code) => Some(code),
            Self::Connected => None,
        }
    }
}

/// Owner of the process-wide session
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

struct Shared {
    config: LinkConfig,
    factory: Arc<dyn TransportFactory>,
    store: Arc<dyn CredentialStore>,
    inner: Mutex<Inner>,
    status: watch::Sender<SessionStatus>,
}

struct Inner {
    session: Session,
    epoch: u64,
    attempt: u64,
    generation: u64,
    link: Option<Link>,
    reconnect_task: Option<JoinHandle<()>>,
    expiry_task: Option<JoinHandle<()>>,
}

struct Link {
    generation: u64,
    transport: Arc<dyn Transport>,
}

enum Begin {
    Started { epoch: u64 },
    Pending(String),
}

impl SessionManager {
    /// Create a session manager in the `Idle` state
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidConfig` if `config` does not validate.
    pub fn new(
        config: LinkConfig,
        factory: Arc<dyn TransportFactory>,
        store: Arc<dyn CredentialStore>,
    ) -> Result<Self> {
        config.validate()?;

        let session = Session::new(config.max_retries);
        let (status, _) = watch::channel(session.status());

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                factory,
                store,
                inner: Mutex::new(Inner {
                    session,
                    epoch: 0,
                    attempt: 0,
                    generation: 0,
                    link: None,
                    reconnect_task: None,
                    expiry_task: None,
                }),
                status,
            }),
        })
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &LinkConfig {
        &self.shared.config
    }

    /// Current status. Never blocks, never fails.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.shared.status.borrow().clone()
    }

    /// Watch status changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status.subscribe()
    }

    /// Start linking `identity` without waiting for the outcome.
    ///
    /// A repeated call for the identity that is already awaiting pairing is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// - `LinkError::InvalidIdentity` if `identity` is not a phone number
    /// - `LinkError::AlreadyConnected` if the session is connected
    /// - `LinkError::AlreadyInitializing` if another attempt is in flight
    pub async fn connect(&self, identity: &str) -> Result<()> {
        let identity = PhoneNumber::parse(identity).map_err(LinkError::InvalidIdentity)?;
        self.begin(identity).await.map(|_| ())
    }

    /// Link `identity` and wait for a pairing code.
    ///
    /// Waits at most `pairing_timeout`. On timeout the attempt is abandoned
    /// and the session returns to `Idle`, so a fresh request can follow
    /// without a clear.
    ///
    /// # Errors
    ///
    /// - `LinkError::AlreadyConnected` if the session is connected, whatever `identity` is
    /// - `LinkError::InvalidIdentity` if `identity` is not a phone number
    /// - `LinkError::AlreadyInitializing` if another attempt is in flight
    /// - `LinkError::PairingTimeout` if no code arrived in time
    /// - `LinkError::SessionFailed` if the attempt failed for good
    /// - `LinkError::Cancelled` if the session was cleared meanwhile
    pub async fn request_pairing_code(&self, identity: &str) -> Result<PairingOutcome> {
        if self.status().connected {
            return Err(LinkError::AlreadyConnected);
        }
        let identity = PhoneNumber::parse(identity).map_err(LinkError::InvalidIdentity)?;

        let epoch = match self.begin(identity).await? {
            Begin::Pending(code) => return Ok(PairingOutcome::Code(code)),
            Begin::Started { epoch } => epoch,
        };

        let mut rx = self.shared.status.subscribe();
        match tokio::time::timeout(self.shared.config.pairing_timeout, wait_for(&mut rx, true))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                self.shared.abandon_pairing(epoch).await;
                Err(LinkError::PairingTimeout)
            }
        }
    }

    /// Wait until the device is linked and the session connected.
    ///
    /// Unbounded; wrap it in a timeout where needed. Reconnects in between
    /// are waited out.
    ///
    /// # Errors
    ///
    /// - `LinkError::PairingExpired` if the outstanding code expired unused
    /// - `LinkError::SessionFailed` if the session failed for good
    /// - `LinkError::Cancelled` if the session is idle or was cleared
    pub async fn wait_until_linked(&self) -> Result<()> {
        let mut rx = self.shared.status.subscribe();
        wait_for(&mut rx, false).await.map(|_| ())
    }

    /// Tear down the transport, cancel pending timers and waits, purge
    /// stored credentials and return to `Idle`. Safe from any state and
    /// idempotent.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::Credentials` if the store cannot be purged; the
    /// session is `Idle` regardless.
    pub async fn clear_session(&self) -> Result<()> {
        {
            let mut inner = self.shared.inner.lock().await;
            inner.cancel_timers();
            inner.retire_link();
            inner.epoch += 1;
            inner.attempt += 1;
            inner.session.apply(SessionEvent::Cleared)?;
            self.shared.publish(&inner);
        }

        self.shared.store.purge().await?;
        tracing::info!("Session cleared");
        Ok(())
    }

    /// The live transport, if the session is connected.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::NotConnected` otherwise.
    pub async fn connected_transport(&self) -> Result<Arc<dyn Transport>> {
        let inner = self.shared.inner.lock().await;
        match (&inner.link, inner.session.state()) {
            (Some(link), SessionState::Connected) => Ok(Arc::clone(&link.transport)),
            _ => Err(LinkError::NotConnected),
        }
    }

    async fn begin(&self, identity: PhoneNumber) -> Result<Begin> {
        let mut inner = self.shared.inner.lock().await;

        if inner.session.state() == SessionState::AwaitingPairing
            && inner.session.identity() == Some(&identity)
        {
            if let Some(code) = inner.session.pairing_code() {
                return Ok(Begin::Pending(code.to_string()));
            }
        }

        inner.session.apply(SessionEvent::Connect(identity))?;
        inner.epoch += 1;
        inner.attempt += 1;
        let (epoch, attempt) = (inner.epoch, inner.attempt);
        self.shared.publish(&inner);
        drop(inner);

        tokio::spawn(Arc::clone(&self.shared).initialize(attempt));
        Ok(Begin::Started { epoch })
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Wait until the session settles. A pairing code counts as settled only
/// when `accept_code` is set.
async fn wait_for(
    rx: &mut watch::Receiver<SessionStatus>,
    accept_code: bool,
) -> Result<PairingOutcome> {
    loop {
        {
            let status = rx.borrow_and_update();
            match status.state {
                SessionState::AwaitingPairing if accept_code => {
                    if let Some(code) = &status.pairing_code {
                        return Ok(PairingOutcome::Code(code.clone()));
                    }
                }
                SessionState::Connected => return Ok(PairingOutcome::Connected),
                SessionState::Failed => {
                    return Err(LinkError::SessionFailed(
                        status.failure.clone().unwrap_or_default(),
                    ));
                }
                SessionState::Idle if status.pairing_expired => {
                    return Err(LinkError::PairingExpired);
                }
                SessionState::Idle => return Err(LinkError::Cancelled),
                SessionState::AwaitingPairing
                | SessionState::Initializing
                | SessionState::Reconnecting => {}
            }
        }
        if rx.changed().await.is_err() {
            return Err(LinkError::Cancelled);
        }
    }
}

impl Shared {
    fn publish(&self, inner: &Inner) {
        self.status.send_replace(inner.session.status());
    }

    /// Create, connect and install a transport for `attempt`.
    async fn initialize(self: Arc<Self>, attempt: u64) {
        let identity = {
            let mut inner = self.inner.lock().await;
            if !inner.is_initializing(attempt) {
                return;
            }
            // At most one transport is ever live
            inner.retire_link();
            match inner.session.identity() {
                Some(identity) => identity.clone(),
                None => return,
            }
        };

        let credentials = match self.store.load().await {
            Ok(credentials) => credentials,
            Err(e) => return self.init_failed(attempt, e.to_string()).await,
        };
        let registered = credentials.as_ref().is_some_and(|c| c.registered);

        let channel = match self.factory.create(credentials).await {
            Ok(channel) => channel,
            Err(e) => return self.init_failed(attempt, e.to_string()).await,
        };
        let transport = channel.transport;

        if let Err(e) = transport.connect().await {
            shutdown_detached(transport);
            return self.init_failed(attempt, e.to_string()).await;
        }

        let code = if registered {
            None
        } else {
            match transport.request_pairing_code(identity.as_str()).await {
                Ok(code) => Some(code),
                Err(e) => {
                    shutdown_detached(transport);
                    return self.init_failed(attempt, e.to_string()).await;
                }
            }
        };

        let mut inner = self.inner.lock().await;
        if !inner.is_initializing(attempt) {
            tracing::debug!(attempt, "Initialization superseded, dropping transport");
            shutdown_detached(transport);
            return;
        }

        inner.generation += 1;
        let generation = inner.generation;
        inner.link = Some(Link {
            generation,
            transport,
        });
        tokio::spawn(pump(Arc::downgrade(&self), generation, channel.events));

        if let Some(code) = code {
            tracing::info!(phone = %identity, "Pairing code issued");
            match inner.session.apply(SessionEvent::PairingCodeIssued(code)) {
                Ok(transition) => self.settle(&mut inner, transition, false).await,
                Err(e) => tracing::warn!(error = %e, "Pairing code not applied"),
            }
        }
        self.publish(&inner);
    }

    async fn init_failed(self: &Arc<Self>, attempt: u64, detail: String) {
        let mut inner = self.inner.lock().await;
        if !inner.is_initializing(attempt) {
            return;
        }
        tracing::warn!(attempt, error = %detail, "Session initialization failed");
        if let Ok(transition) = inner.session.apply(SessionEvent::InitFailed(detail)) {
            self.settle(&mut inner, transition, false).await;
        }
        self.publish(&inner);
    }

    /// Handle one transport event. Returns false once the pump should stop.
    async fn on_update(self: &Arc<Self>, generation: u64, update: ConnectionUpdate) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.link.as_ref().map(|link| link.generation) != Some(generation) {
            return false;
        }

        let keep_going = match update {
            ConnectionUpdate::Connecting => {
                tracing::debug!(generation, "Transport connecting");
                true
            }
            ConnectionUpdate::CredsUpdated(credentials) => {
                if let Err(e) = self.store.save(&credentials).await {
                    tracing::error!(error = %e, "Failed to persist rotated credentials");
                }
                true
            }
            ConnectionUpdate::Open => {
                if let Ok(transition) = inner.session.apply(SessionEvent::Open) {
                    self.settle(&mut inner, transition, false).await;
                }
                true
            }
            ConnectionUpdate::Close(reason) => {
                tracing::info!(generation, %reason, "Transport closed");
                if let Ok(transition) = inner.session.apply(SessionEvent::Close(reason)) {
                    self.settle(&mut inner, transition, reason.is_fatal()).await;
                }
                inner.retire_link();
                false
            }
        };

        self.publish(&inner);
        keep_going
    }

    /// Side effects of a transition
    async fn settle(self: &Arc<Self>, inner: &mut Inner, transition: Transition, fatal: bool) {
        if !transition.is_change() {
            return;
        }
        if transition.from == SessionState::AwaitingPairing {
            if let Some(task) = inner.expiry_task.take() {
                task.abort();
            }
        }

        match transition.to {
            SessionState::Connected => {
                if let Err(e) = self.mark_registered().await {
                    tracing::error!(error = %e, "Failed to mark credentials registered");
                }
            }
            SessionState::AwaitingPairing => self.schedule_expiry(inner),
            SessionState::Reconnecting => {
                inner.retire_link();
                inner.attempt += 1;
                self.schedule_reconnect(inner);
            }
            SessionState::Failed => {
                inner.retire_link();
                inner.cancel_timers();
                if fatal {
                    match self.store.purge().await {
                        Ok(()) => tracing::warn!("Fatal close, credentials purged"),
                        Err(e) => tracing::error!(error = %e, "Failed to purge credentials"),
                    }
                }
            }
            SessionState::Idle => {
                inner.retire_link();
                inner.cancel_timers();
                inner.epoch += 1;
                inner.attempt += 1;
            }
            SessionState::Initializing => {}
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, inner: &mut Inner) {
        let shared = Arc::downgrade(self);
        let backoff = self.config.reconnect_backoff;
        let attempt = inner.attempt;

        tracing::info!(
            retries = inner.session.retry_count(),
            backoff_ms = backoff.as_millis() as u64,
            "Reconnect scheduled"
        );

        if let Some(previous) = inner.reconnect_task.replace(tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            if let Some(shared) = shared.upgrade() {
                shared.resume(attempt).await;
            }
        })) {
            previous.abort();
        }
    }

    async fn resume(self: Arc<Self>, attempt: u64) {
        let next = {
            let mut inner = self.inner.lock().await;
            if inner.attempt != attempt || inner.session.state() != SessionState::Reconnecting {
                return;
            }
            // Detach our own handle so later cancellation cannot abort this task mid-init
            inner.reconnect_task = None;
            if inner.session.apply(SessionEvent::BackoffElapsed).is_err() {
                return;
            }
            inner.attempt += 1;
            self.publish(&inner);
            inner.attempt
        };
        self.initialize(next).await;
    }

    fn schedule_expiry(self: &Arc<Self>, inner: &mut Inner) {
        let shared = Arc::downgrade(self);
        let validity = self.config.pairing_code_validity;
        let epoch = inner.epoch;

        if let Some(previous) = inner.expiry_task.replace(tokio::spawn(async move {
            tokio::time::sleep(validity).await;
            if let Some(shared) = shared.upgrade() {
                shared.expire_pairing(epoch).await;
            }
        })) {
            previous.abort();
        }
    }

    async fn expire_pairing(self: Arc<Self>, epoch: u64) {
        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch || inner.session.state() != SessionState::AwaitingPairing {
            return;
        }
        inner.expiry_task = None;
        tracing::info!("Pairing code expired");
        if let Ok(transition) = inner.session.apply(SessionEvent::PairingExpired) {
            self.settle(&mut inner, transition, false).await;
        }
        self.publish(&inner);
    }

    async fn abandon_pairing(self: &Arc<Self>, epoch: u64) {
        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            return;
        }
        if let Ok(transition) = inner.session.apply(SessionEvent::PairingTimedOut) {
            self.settle(&mut inner, transition, false).await;
            self.publish(&inner);
        }
    }

    async fn mark_registered(&self) -> Result<()> {
        let mut credentials = self.store.load().await?.unwrap_or_default();
        if !credentials.registered {
            credentials.registered = true;
            self.store.save(&credentials).await?;
        }
        Ok(())
    }
}

impl Inner {
    fn is_initializing(&self, attempt: u64) -> bool {
        self.attempt == attempt && self.session.state() == SessionState::Initializing
    }

    fn cancel_timers(&mut self) {
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
        if let Some(task) = self.expiry_task.take() {
            task.abort();
        }
    }

    fn retire_link(&mut self) {
        if let Some(link) = self.link.take() {
            tracing::debug!(generation = link.generation, "Retiring transport");
            shutdown_detached(link.transport);
        }
    }
}

fn shutdown_detached(transport: Arc<dyn Transport>) {
    tokio::spawn(async move {
        if let Err(e) = transport.shutdown().await {
            tracing::debug!(error = %e, "Transport shutdown failed");
        }
    });
}

async fn pump(
    shared: Weak<Shared>,
    generation: u64,
    mut events: mpsc::Receiver<ConnectionUpdate>,
) {
    while let Some(update) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if !shared.on_update(generation, update).await {
            return;
        }
    }

    // Stream ended without an explicit close
    if let Some(shared) = shared.upgrade() {
        shared
            .on_update(
                generation,
                ConnectionUpdate::Close(DisconnectReason::ConnectionLost),
            )
            .await;
    }
}
