//! Shared fixtures for the Tether integration tests.
//!
//! [`MockNetwork`] is a scriptable [`TransportFactory`]: every transport it
//! builds is recorded so tests can push connection events into it, inspect
//! what was sent and check that it was shut down.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_core::{LinkConfig, SessionManager, SessionState, SessionStatus};
use tether_transport::{
    ConnectionUpdate, CredentialStore, Credentials, MemoryCredentialStore, Transport,
    TransportChannel, TransportError, TransportFactory, TransportResult,
};
use tokio::sync::mpsc;

/// Code handed out by mock transports
pub const PAIRING_CODE: &str = "ABCD1234";

/// Canonical form of [`PHONE`]
pub const CANONICAL: &str = "628123456789";

/// A local-form phone number used across tests
pub const PHONE: &str = "08123456789";

#[derive(Default)]
struct Behaviour {
    fail_connect: bool,
    withhold_code: bool,
    fail_sends: HashSet<u32>,
}

/// Factory that records every transport it builds
#[derive(Default)]
pub struct MockNetwork {
    behaviour: Mutex<Behaviour>,
    transports: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockNetwork {
    /// Fresh network with default behaviour
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `connect` fail on transports built from now on
    pub fn fail_connects(&self, fail: bool) {
        self.behaviour.lock().unwrap().fail_connect = fail;
    }

    /// Never answer pairing-code requests on transports built from now on
    pub fn withhold_codes(&self, withhold: bool) {
        self.behaviour.lock().unwrap().withhold_code = withhold;
    }

    /// Fail these 1-based send calls on transports built from now on
    pub fn fail_sends(&self, calls: impl IntoIterator<Item = u32>) {
        self.behaviour.lock().unwrap().fail_sends = calls.into_iter().collect();
    }

    /// Number of transports built
    #[must_use]
    pub fn created(&self) -> usize {
        self.transports.lock().unwrap().len()
    }

    /// Transport `index` in creation order
    #[must_use]
    pub fn transport(&self, index: usize) -> Arc<MockTransport> {
        Arc::clone(&self.transports.lock().unwrap()[index])
    }

    /// Most recently built transport
    #[must_use]
    pub fn latest(&self) -> Arc<MockTransport> {
        let transports = self.transports.lock().unwrap();
        Arc::clone(transports.last().expect("no transport built yet"))
    }
}

#[async_trait]
impl TransportFactory for MockNetwork {
    async fn create(&self, credentials: Option<Credentials>) -> TransportResult<TransportChannel> {
        let (tx, rx) = mpsc::channel(32);
        let behaviour = self.behaviour.lock().unwrap();
        let transport = Arc::new(MockTransport {
            registered: credentials.is_some_and(|c| c.registered),
            fail_connect: behaviour.fail_connect,
            withhold_code: behaviour.withhold_code,
            fail_sends: behaviour.fail_sends.clone(),
            events: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
            code_requests: AtomicU32::new(0),
            send_calls: AtomicU32::new(0),
            sent: Mutex::new(Vec::new()),
        });
        drop(behaviour);

        self.transports.lock().unwrap().push(Arc::clone(&transport));
        Ok(TransportChannel {
            transport: transport as Arc<dyn Transport>,
            events: rx,
        })
    }
}

/// Scriptable transport
pub struct MockTransport {
    registered: bool,
    fail_connect: bool,
    withhold_code: bool,
    fail_sends: HashSet<u32>,
    events: Mutex<Option<mpsc::Sender<ConnectionUpdate>>>,
    closed: AtomicBool,
    code_requests: AtomicU32,
    send_calls: AtomicU32,
    sent: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MockTransport {
    /// Push a connection event. Dropped if the transport was shut down.
    pub fn emit(&self, update: ConnectionUpdate) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.try_send(update);
        }
    }

    /// Pairing-code requests received
    #[must_use]
    pub fn code_requests(&self) -> u32 {
        self.code_requests.load(Ordering::SeqCst)
    }

    /// Frames accepted, in order
    #[must_use]
    pub fn sent(&self) -> Vec<(String, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> TransportResult<()> {
        if self.fail_connect {
            return Err(TransportError::ConnectionFailed("network unreachable".into()));
        }
        self.emit(ConnectionUpdate::Connecting);
        if self.registered {
            self.emit(ConnectionUpdate::Open);
        }
        Ok(())
    }

    async fn request_pairing_code(&self, _phone_number: &str) -> TransportResult<String> {
        self.code_requests.fetch_add(1, Ordering::SeqCst);
        if self.withhold_code {
            std::future::pending::<()>().await;
        }
        Ok(PAIRING_CODE.to_string())
    }

    async fn send_raw(&self, address: &str, frame: &[u8]) -> TransportResult<()> {
        let call = self.send_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_sends.contains(&call) {
            return Err(TransportError::SendFailed(format!("send {call} rejected")));
        }
        self.sent
            .lock()
            .unwrap()
            .push((address.to_string(), frame.to_vec()));
        Ok(())
    }

    async fn shutdown(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.events.lock().unwrap().take();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Manager, network and store wired together
pub struct Harness {
    /// Session manager under test
    pub manager: SessionManager,
    /// Transport factory
    pub network: Arc<MockNetwork>,
    /// Credential store
    pub store: Arc<MemoryCredentialStore>,
}

impl Harness {
    /// Harness with default configuration and an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::with(LinkConfig::default(), MemoryCredentialStore::new())
    }

    /// Harness with explicit configuration and store
    #[must_use]
    pub fn with(config: LinkConfig, store: MemoryCredentialStore) -> Self {
        let network = MockNetwork::new();
        let store = Arc::new(store);
        let manager = SessionManager::new(
            config,
            Arc::clone(&network) as Arc<dyn TransportFactory>,
            Arc::clone(&store) as Arc<dyn CredentialStore>,
        )
        .expect("valid config");
        Self {
            manager,
            network,
            store,
        }
    }

    /// Pair and open, leaving the session connected
    pub async fn connect(&self) {
        let outcome = self.manager.request_pairing_code(PHONE).await.unwrap();
        assert_eq!(outcome.code(), Some(PAIRING_CODE));
        self.network.latest().emit(ConnectionUpdate::Open);
        wait_for_state(&self.manager, SessionState::Connected).await;
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Credentials that have completed pairing
#[must_use]
pub fn registered() -> Credentials {
    Credentials {
        registered: true,
        material: vec![7; 16],
    }
}

/// Wait until the session reaches `state`, panicking after a minute of (virtual) time
pub async fn wait_for_state(manager: &SessionManager, state: SessionState) -> SessionStatus {
    let mut rx = manager.subscribe();
    let result = tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            {
                let status = rx.borrow_and_update();
                if status.state == state {
                    return status.clone();
                }
            }
            rx.changed().await.expect("session dropped");
        }
    })
    .await;

    match result {
        Ok(status) => status,
        Err(_) => panic!(
            "timed out waiting for {state:?}, last status {:?}",
            manager.status()
        ),
    }
}

/// Let detached tasks (shutdowns, pumps) run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
