// Realtime Channel
// One logical connection per session, multiplexing per-contact rooms. A supervisor task
// owns the transport, dispatches inbound events and reconnects after drops.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::api::Token;
use crate::error::{ChatError, ChatResult};
use crate::models::ContactId;

pub mod backoff;
pub mod protocol;
pub mod ws;

pub use backoff::ReconnectPolicy;
pub use protocol::{ClientEvent, Framing, InboundMessage, OutgoingMessage, ServerEvent};
pub use ws::WsConnector;

/// An established transport: events to write and events read, in order.
/// The inbound side ending means the connection is gone.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<ClientEvent>,
    pub inbound: mpsc::UnboundedReceiver<ServerEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establish a transport authenticated with `token`.
    /// `ChatError::Auth` means the credential is no good and retrying is pointless.
    async fn connect(&self, token: &Token) -> ChatResult<Link>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

pub type HandlerId = u64;
type EventHandler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;
type StateHandler = Arc<dyn Fn(ChannelState) + Send + Sync>;

struct Inner {
    state: ChannelState,
    outbound: Option<mpsc::UnboundedSender<ClientEvent>>,
    rooms: Vec<ContactId>,
    join_log: Vec<ContactId>,
    handlers: Vec<(HandlerId, EventHandler)>,
    state_handlers: Vec<(HandlerId, StateHandler)>,
    next_handler: HandlerId,
    supervisor: Option<JoinHandle<()>>,
}

impl Inner {
    fn write_join(&mut self, contact_id: &str) {
        let Some(outbound) = &self.outbound else {
            return;
        };
        let event = ClientEvent::JoinChat {
            contact_id: contact_id.to_string(),
        };
        if outbound.send(event).is_ok() {
            debug!("Joined room {}", contact_id);
            self.join_log.push(contact_id.to_string());
        } else {
            warn!("Could not write join for room {}, transport is gone", contact_id);
        }
    }
}

struct Shared {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ChannelState>,
    shutdown_tx: watch::Sender<bool>,
}

enum LinkEnd {
    Dropped,
    Shutdown,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Closed is terminal; nothing moves the channel out of it.
    fn transition(&self, inner: &mut Inner, next: ChannelState) {
        if inner.state == ChannelState::Closed || inner.state == next {
            return;
        }
        debug!("Realtime channel {:?} -> {:?}", inner.state, next);
        inner.state = next;
        self.state_tx.send_replace(next);
    }

    /// Install a fresh link, replay room joins, and go `Connected`.
    fn attach(&self, link: Link) -> Option<mpsc::UnboundedReceiver<ServerEvent>> {
        let mut inner = self.lock();
        if inner.state == ChannelState::Closed {
            return None;
        }
        inner.outbound = Some(link.outbound);
        let rooms = inner.rooms.clone();
        for room in &rooms {
            inner.write_join(room);
        }
        self.transition(&mut inner, ChannelState::Connected);
        info!("Realtime channel connected, rejoined {} rooms", rooms.len());
        self.announce(inner, ChannelState::Connected);
        Some(link.inbound)
    }

    fn detach(&self) {
        let mut inner = self.lock();
        inner.outbound = None;
        self.transition(&mut inner, ChannelState::Disconnected);
        self.announce(inner, ChannelState::Disconnected);
    }

    /// Tell state handlers about `state`, after letting go of the channel lock.
    fn announce(&self, inner: MutexGuard<'_, Inner>, state: ChannelState) {
        if inner.state != state {
            return;
        }
        let handlers: Vec<StateHandler> = inner.state_handlers.iter().map(|(_, h)| h.clone()).collect();
        drop(inner);
        for handler in handlers {
            handler(state);
        }
    }

    fn dispatch(&self, event: &ServerEvent) {
        let handlers: Vec<EventHandler> = {
            let inner = self.lock();
            if inner.state == ChannelState::Closed {
                return;
            }
            inner.handlers.iter().map(|(_, h)| h.clone()).collect()
        };
        debug!("Dispatching {} to {} handlers", event.name(), handlers.len());
        // Handlers run without the channel lock so they may call back into the channel.
        for handler in handlers {
            handler(event);
        }
    }

    async fn run_link(
        &self,
        mut inbound: mpsc::UnboundedReceiver<ServerEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> LinkEnd {
        loop {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(event) => self.dispatch(&event),
                    None => return LinkEnd::Dropped,
                },
                _ = shutdown.changed() => return LinkEnd::Shutdown,
            }
        }
    }
}

async fn supervise(shared: Arc<Shared>, token: Token) {
    let mut shutdown = shared.shutdown_tx.subscribe();
    let mut attempt: u32 = 0;
    loop {
        if *shutdown.borrow() {
            break;
        }
        {
            let mut inner = shared.lock();
            shared.transition(&mut inner, ChannelState::Connecting);
        }
        let connected = tokio::select! {
            result = shared.connector.connect(&token) => result,
            _ = shutdown.changed() => break,
        };
        match connected {
            Ok(link) => {
                attempt = 0;
                let Some(inbound) = shared.attach(link) else {
                    break;
                };
                match shared.run_link(inbound, &mut shutdown).await {
                    LinkEnd::Shutdown => break,
                    LinkEnd::Dropped => {
                        shared.detach();
                        warn!("{}", ChatError::TransportDrop("realtime link ended".to_string()));
                    }
                }
            }
            Err(ChatError::Auth(reason)) => {
                error!("Realtime channel rejected the credential, giving up: {}", reason);
                let mut inner = shared.lock();
                shared.transition(&mut inner, ChannelState::Disconnected);
                inner.supervisor = None;
                shared.announce(inner, ChannelState::Disconnected);
                return;
            }
            Err(e) => {
                warn!("Realtime connect failed: {}", e);
                shared.detach();
            }
        }
        let delay = shared.policy.delay(attempt);
        attempt = attempt.saturating_add(1);
        info!("Reconnecting realtime channel in {:?} (attempt {})", delay, attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }
    debug!("Realtime supervisor stopped");
}

/// Handle to the session's realtime channel. Clones share the same connection.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
}

impl Channel {
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        Channel {
            shared: Arc::new(Shared {
                connector,
                policy,
                inner: Mutex::new(Inner {
                    state: ChannelState::Disconnected,
                    outbound: None,
                    rooms: Vec::new(),
                    join_log: Vec::new(),
                    handlers: Vec::new(),
                    state_handlers: Vec::new(),
                    next_handler: 0,
                    supervisor: None,
                }),
                state_tx,
                shutdown_tx,
            }),
        }
    }

    /// Start connecting with `token`. Returns immediately; progress is visible
    /// through `state()` / `watch_state()`. Must be called inside a tokio runtime.
    pub fn open(&self, token: Token) {
        let mut inner = self.shared.lock();
        if inner.state == ChannelState::Closed {
            warn!("Ignoring open on a closed realtime channel");
            return;
        }
        if inner.supervisor.is_some() {
            debug!("Realtime channel already open");
            return;
        }
        inner.supervisor = Some(tokio::spawn(supervise(self.shared.clone(), token)));
    }

    pub fn state(&self) -> ChannelState {
        self.shared.lock().state
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state_tx.subscribe()
    }

    /// Declare interest in a contact's events. Joining twice is a no-op; joined
    /// rooms are replayed automatically after every reconnect.
    pub fn join_room(&self, contact_id: &str) {
        let mut inner = self.shared.lock();
        if inner.state == ChannelState::Closed {
            return;
        }
        if inner.rooms.iter().any(|room| room == contact_id) {
            return;
        }
        inner.rooms.push(contact_id.to_string());
        if inner.state == ChannelState::Connected {
            inner.write_join(contact_id);
        }
    }

    pub fn rooms(&self) -> Vec<ContactId> {
        self.shared.lock().rooms.clone()
    }

    /// Every join actually written to a transport, oldest first.
    pub fn join_log(&self) -> Vec<ContactId> {
        self.shared.lock().join_log.clone()
    }

    /// Hand an event to the transport. Fails fast instead of queueing when not connected.
    pub fn send(&self, event: ClientEvent) -> ChatResult<()> {
        let inner = self.shared.lock();
        if inner.state != ChannelState::Connected {
            return Err(ChatError::ChannelUnavailable);
        }
        match &inner.outbound {
            Some(outbound) => outbound.send(event).map_err(|_| ChatError::ChannelUnavailable),
            None => Err(ChatError::ChannelUnavailable),
        }
    }

    /// Register a handler for every inbound event, called in arrival order.
    pub fn on_event<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let mut inner = self.shared.lock();
        inner.next_handler += 1;
        let id = inner.next_handler;
        if inner.state == ChannelState::Closed {
            debug!("Handler {} registered on a closed channel will never fire", id);
            return id;
        }
        inner.handlers.push((id, Arc::new(handler)));
        id
    }

    /// Register a handler for connectivity changes. It runs on the supervisor task
    /// once the transport is attached (`Connected`) or gone (`Disconnected`), before
    /// any reconnect attempt.
    pub fn on_state_change<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(ChannelState) + Send + Sync + 'static,
    {
        let mut inner = self.shared.lock();
        inner.next_handler += 1;
        let id = inner.next_handler;
        if inner.state != ChannelState::Closed {
            inner.state_handlers.push((id, Arc::new(handler)));
        }
        id
    }

    /// Unregister an event or state handler.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut inner = self.shared.lock();
        let before = inner.handlers.len() + inner.state_handlers.len();
        inner.handlers.retain(|(handler_id, _)| *handler_id != id);
        inner.state_handlers.retain(|(handler_id, _)| *handler_id != id);
        inner.handlers.len() + inner.state_handlers.len() != before
    }

    /// Terminal shutdown: drop the transport and all handlers, stop reconnecting.
    pub fn close(&self) {
        let supervisor = {
            let mut inner = self.shared.lock();
            if inner.state == ChannelState::Closed {
                return;
            }
            info!("Closing realtime channel");
            inner.state = ChannelState::Closed;
            self.shared.state_tx.send_replace(ChannelState::Closed);
            inner.outbound = None;
            inner.handlers.clear();
            inner.state_handlers.clear();
            inner.rooms.clear();
            inner.supervisor.take()
        };
        self.shared.shutdown_tx.send_replace(true);
        if let Some(handle) = supervisor {
            handle.abort();
        }
    }
}
