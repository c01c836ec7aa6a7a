// Common test utilities for integration tests
// In-memory stand-ins for the realtime transport and the REST backend.
#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use log::LevelFilter;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use chatline::api::{AuthGrant, Backend, PaymentReceipt, PaymentRequest, Registration, Token};
use chatline::channel::{
    Channel, ChannelState, ClientEvent, Connector, InboundMessage, Link, ReconnectPolicy, ServerEvent,
};
use chatline::models::{
    Contact, ContactStatus, DeliveryStatus, Message, MessageId, MessageKind, MessageRecord, User,
};
use chatline::{ChatError, ChatResult};

pub const SELF_ID: &str = "1";
pub const PASSWORD: &str = "correct horse";
pub const WAIT: Duration = Duration::from_secs(2);

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

pub fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy::fixed(Duration::from_millis(5))
}

/// Server end of one fake connection.
pub struct ServerSide {
    pub from_client: mpsc::UnboundedReceiver<ClientEvent>,
    pub to_client: mpsc::UnboundedSender<ServerEvent>,
}

impl ServerSide {
    pub async fn next_event(&mut self) -> ClientEvent {
        timeout(WAIT, self.from_client.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client hung up")
    }

    pub fn push(&self, event: ServerEvent) {
        self.to_client.send(event).expect("client link is gone");
    }
}

/// Connector handing the test the server side of every connection it makes.
pub struct FakeConnector {
    links: mpsc::UnboundedSender<ServerSide>,
    failures_left: AtomicU32,
    reject_auth: AtomicBool,
    attempts: AtomicU32,
}

impl FakeConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (links, links_rx) = mpsc::unbounded_channel();
        (
            Arc::new(FakeConnector {
                links,
                failures_left: AtomicU32::new(0),
                reject_auth: AtomicBool::new(false),
                attempts: AtomicU32::new(0),
            }),
            links_rx,
        )
    }

    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn reject_auth(&self) {
        self.reject_auth.store(true, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _token: &Token) -> ChatResult<Link> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.reject_auth.load(Ordering::SeqCst) {
            return Err(ChatError::Auth("token expired".to_string()));
        }
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(ChatError::TransportDrop("connection refused".to_string()));
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let _ = self.links.send(ServerSide {
            from_client: out_rx,
            to_client: in_tx,
        });
        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Scripted backend. Message fetches can be held back per contact with `gate`.
pub struct FakeBackend {
    histories: Mutex<HashMap<String, Vec<Message>>>,
    gates: Mutex<HashMap<String, oneshot::Receiver<()>>>,
    fail_fetch: AtomicBool,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeBackend {
            histories: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            fail_fetch: AtomicBool::new(false),
        })
    }

    pub fn set_history(&self, contact_id: &str, messages: Vec<Message>) {
        self.histories.lock().unwrap().insert(contact_id.to_string(), messages);
    }

    /// Hold the next fetch for `contact_id` until the returned sender fires.
    pub fn gate(&self, contact_id: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().unwrap().insert(contact_id.to_string(), rx);
        tx
    }

    pub fn set_fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    fn grant(username: &str) -> AuthGrant {
        AuthGrant {
            access_token: "token-1".to_string(),
            user_id: SELF_ID.to_string(),
            username: username.to_string(),
        }
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn login(&self, _email: &str, password: &str) -> ChatResult<AuthGrant> {
        if password == PASSWORD {
            Ok(Self::grant("alice"))
        } else {
            Err(ChatError::Auth("Invalid credentials".to_string()))
        }
    }

    // The real backend leaves the username out of its register reply.
    async fn register(&self, _registration: &Registration) -> ChatResult<AuthGrant> {
        Ok(Self::grant(""))
    }

    async fn profile(&self, _token: &Token, user_id: &str) -> ChatResult<User> {
        Ok(User {
            id: user_id.to_string(),
            username: "alice".to_string(),
            email: Some("alice@example.org".to_string()),
            credits: 25,
        })
    }

    async fn contacts(&self, _token: &Token) -> ChatResult<Vec<Contact>> {
        Ok(vec![contact("42", "bob"), contact("7", "carol")])
    }

    async fn messages(&self, _token: &Token, contact_id: &str) -> ChatResult<Vec<Message>> {
        let gate = self.gates.lock().unwrap().remove(contact_id);
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(ChatError::Fetch("backend unavailable".to_string()));
        }
        Ok(self
            .histories
            .lock()
            .unwrap()
            .get(contact_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn process_payment(&self, _token: &Token, request: &PaymentRequest) -> ChatResult<PaymentReceipt> {
        if request.amount <= 0.0 {
            return Err(ChatError::Payment("Invalid amount".to_string()));
        }
        Ok(PaymentReceipt {
            credits_added: request.credits,
            new_balance: 25 + request.credits,
        })
    }
}

pub fn contact(id: &str, name: &str) -> Contact {
    Contact {
        id: id.to_string(),
        name: name.to_string(),
        avatar: None,
        status: ContactStatus::Offline,
        last_message: None,
        unread_count: 0,
    }
}

pub fn server_message(id: &str, from: &str, to: &str, content: &str) -> Message {
    Message {
        id: MessageId::Server(id.to_string()),
        sender_id: from.to_string(),
        receiver_id: to.to_string(),
        content: content.to_string(),
        kind: MessageKind::Text,
        timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
        delivery_status: DeliveryStatus::Sent,
    }
}

pub fn new_message_event(id: &str, from: &str, to: &str, client_id: Option<&str>) -> ServerEvent {
    ServerEvent::NewMessage(InboundMessage {
        record: MessageRecord {
            id: id.to_string(),
            sender_id: from.to_string(),
            receiver_id: to.to_string(),
            content: format!("message {}", id),
            message_type: "text".to_string(),
            timestamp: "2024-03-01T10:15:00".to_string(),
            read: false,
            media_uri: None,
            duration: None,
        },
        client_id: client_id.map(str::to_string),
    })
}

pub async fn wait_for_state(channel: &Channel, state: ChannelState) {
    let mut rx = channel.watch_state();
    timeout(WAIT, rx.wait_for(|current| *current == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for channel state {:?}", state))
        .expect("state sender dropped");
}

pub async fn next_link(links: &mut mpsc::UnboundedReceiver<ServerSide>) -> ServerSide {
    timeout(WAIT, links.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector dropped")
}

/// Poll `condition` until it holds or the wait budget runs out.
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached within {:?}", WAIT);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn within<T>(future: impl Future<Output = T>) -> T {
    timeout(WAIT, future).await.expect("timed out")
}
