// Chat View Controller
// Binds the open conversation's timeline to the realtime channel: loads history,
// sends optimistic messages, and routes inbound events to timelines and contacts.

use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use crate::api::{Backend, Token};
use crate::channel::{Channel, ChannelState, ClientEvent, HandlerId, OutgoingMessage, ServerEvent};
use crate::contacts::ContactDirectory;
use crate::error::{ChatError, ChatResult};
use crate::models::{ContactId, ContactStatus, DeliveryStatus, Draft, Message, MessageId, UserId};
use crate::timeline::{Timeline, Timelines};

/// Refresh notifications for whatever renders the conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewUpdate {
    TimelineChanged(ContactId),
    ContactsChanged,
    SendFailed { contact_id: ContactId, temp_id: String },
    Blocked { contact_id: Option<ContactId>, reason: String },
}

/// Session-scoped conversation state shared by the client and its controller.
#[derive(Debug)]
pub struct ChatState {
    self_id: UserId,
    pub contacts: ContactDirectory,
    pub timelines: Timelines,
    open: Option<ContactId>,
    load_seq: u64,
}

pub type SharedState = Arc<Mutex<ChatState>>;

pub(crate) fn lock_state(state: &SharedState) -> MutexGuard<'_, ChatState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Identifies one `open()` call so a late fetch result can be recognised as stale.
struct LoadTag {
    contact_id: ContactId,
    seq: u64,
}

impl ChatState {
    pub fn new(self_id: impl Into<UserId>) -> Self {
        ChatState {
            self_id: self_id.into(),
            contacts: ContactDirectory::new(),
            timelines: Timelines::new(),
            open: None,
            load_seq: 0,
        }
    }

    pub fn shared(self_id: impl Into<UserId>) -> SharedState {
        Arc::new(Mutex::new(Self::new(self_id)))
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn open_contact(&self) -> Option<&str> {
        self.open.as_deref()
    }

    pub fn clear(&mut self) {
        self.contacts.clear();
        self.timelines.clear();
        self.open = None;
    }

    fn is_current(&self, tag: &LoadTag) -> bool {
        self.load_seq == tag.seq && self.open.as_deref() == Some(tag.contact_id.as_str())
    }

    /// Apply one inbound event and report what needs redrawing.
    fn apply(&mut self, event: &ServerEvent) -> Vec<ViewUpdate> {
        match event {
            ServerEvent::NewMessage(inbound) => {
                let message = match inbound.record.clone().into_message() {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Dropping undecodable message: {}", e);
                        return Vec::new();
                    }
                };
                self.route_message(message, inbound.client_id.as_deref())
            }
            ServerEvent::MessageBlocked {
                message,
                reason,
                client_id,
            } => {
                let reason = reason.clone().unwrap_or_else(|| message.clone());
                let mut updates = Vec::new();
                // Without a client id the server is rejecting our oldest unanswered send.
                let owner = match client_id {
                    Some(temp_id) => self
                        .timelines
                        .owner_of_local(temp_id)
                        .map(|owner| (owner, temp_id.clone())),
                    None => self.timelines.oldest_pending(),
                };
                let contact_id = owner.map(|(owner, temp_id)| {
                    self.timelines.entry(&owner).mark_failed(&temp_id);
                    updates.push(ViewUpdate::TimelineChanged(owner.clone()));
                    owner
                });
                warn!("Message blocked by server: {}", reason);
                updates.push(ViewUpdate::Blocked { contact_id, reason });
                updates
            }
            ServerEvent::Presence { user_id, online } => {
                let status = if *online { ContactStatus::Online } else { ContactStatus::Offline };
                if self.contacts.set_status(user_id, status) {
                    vec![ViewUpdate::ContactsChanged]
                } else {
                    Vec::new()
                }
            }
            ServerEvent::JoinedRoom { room } => {
                debug!("Server confirmed room {}", room);
                Vec::new()
            }
            ServerEvent::Connected {} => Vec::new(),
            ServerEvent::Error { message } => {
                warn!("Realtime server reported an error: {}", message);
                Vec::new()
            }
        }
    }

    /// The transport went away: anything still waiting for an echo will never get one.
    fn fail_in_flight(&mut self) -> Vec<ViewUpdate> {
        let failed = self.timelines.fail_pending();
        let mut updates = Vec::new();
        for (contact_id, temp_id) in failed {
            warn!("Message {} to {} lost with the realtime link", temp_id, contact_id);
            let changed = ViewUpdate::TimelineChanged(contact_id.clone());
            if !updates.contains(&changed) {
                updates.push(changed);
            }
            updates.push(ViewUpdate::SendFailed { contact_id, temp_id });
        }
        updates
    }

    fn route_message(&mut self, message: Message, client_id: Option<&str>) -> Vec<ViewUpdate> {
        let partner = message.partner_of(&self.self_id).to_string();
        let own = message.sender_id == self.self_id;

        // Echo of our own optimistic send
        if let (true, Some(temp_id)) = (own, client_id) {
            self.contacts.record_message(&partner, &message);
            self.timelines.entry(&partner).confirm(temp_id, message);
            return vec![ViewUpdate::TimelineChanged(partner), ViewUpdate::ContactsChanged];
        }

        if self.open.as_deref() == Some(partner.as_str()) {
            let summary = message.clone();
            if !self.timelines.entry(&partner).receive_remote(message) {
                return Vec::new();
            }
            self.contacts.record_message(&partner, &summary);
            return vec![ViewUpdate::TimelineChanged(partner), ViewUpdate::ContactsChanged];
        }

        // Conversation not open: contact list only, history comes with the next load.
        if own {
            self.contacts.record_message(&partner, &message);
        } else {
            self.contacts.record_unread(&partner, &message);
        }
        vec![ViewUpdate::ContactsChanged]
    }
}

struct Subscription {
    handler: HandlerId,
    state_handler: HandlerId,
    active: Arc<AtomicBool>,
}

pub struct ChatController {
    backend: Arc<dyn Backend>,
    token: Token,
    channel: Channel,
    state: SharedState,
    updates: mpsc::UnboundedSender<ViewUpdate>,
    subscription: Mutex<Option<Subscription>>,
}

impl ChatController {
    pub fn new(
        backend: Arc<dyn Backend>,
        token: Token,
        channel: Channel,
        state: SharedState,
    ) -> (Self, mpsc::UnboundedReceiver<ViewUpdate>) {
        let (updates, update_rx) = mpsc::unbounded_channel();
        (
            ChatController {
                backend,
                token,
                channel,
                state,
                updates,
                subscription: Mutex::new(None),
            },
            update_rx,
        )
    }

    pub fn open_contact(&self) -> Option<ContactId> {
        lock_state(&self.state).open.clone()
    }

    /// Snapshot of a contact's timeline.
    pub fn timeline(&self, contact_id: &str) -> Option<Timeline> {
        lock_state(&self.state).timelines.get(contact_id).cloned()
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&ChatState) -> R) -> R {
        f(&lock_state(&self.state))
    }

    /// Make `contact_id` the open conversation and load its history.
    ///
    /// If another contact is opened before the fetch resolves, the late result is
    /// discarded. On fetch failure the existing timeline is left as it was.
    pub async fn open(&self, contact_id: &str) -> ChatResult<()> {
        let tag = {
            let mut state = lock_state(&self.state);
            state.load_seq += 1;
            state.open = Some(contact_id.to_string());
            state.contacts.reset_unread(contact_id);
            state.timelines.entry(contact_id);
            LoadTag {
                contact_id: contact_id.to_string(),
                seq: state.load_seq,
            }
        };
        info!("Opening conversation with {}", contact_id);
        self.subscribe();
        self.channel.join_room(contact_id);
        self.notify(ViewUpdate::ContactsChanged);

        let fetched = self.backend.messages(&self.token, contact_id).await;

        let mut state = lock_state(&self.state);
        if !state.is_current(&tag) {
            debug!("Discarding stale history for {}", contact_id);
            return Ok(());
        }
        match fetched {
            Ok(messages) => {
                state.timelines.entry(contact_id).replace(messages);
                drop(state);
                self.notify(ViewUpdate::TimelineChanged(contact_id.to_string()));
                Ok(())
            }
            Err(e) => {
                warn!("Failed to load history for {}: {}", contact_id, e);
                Err(e)
            }
        }
    }

    /// Send text to the open conversation. Blank input is ignored (`Ok(None)`).
    pub fn submit(&self, text: &str) -> ChatResult<Option<Message>> {
        self.submit_draft(Draft::text(text))
    }

    /// Optimistically append `draft` and hand it to the channel. When the channel
    /// is unavailable the entry is marked failed and the error returned.
    pub fn submit_draft(&self, draft: Draft) -> ChatResult<Option<Message>> {
        if draft.is_blank() {
            return Ok(None);
        }
        let mut state = lock_state(&self.state);
        let contact_id = state.open.clone().ok_or(ChatError::NoOpenConversation)?;
        let self_id = state.self_id.clone();
        let pending = state.timelines.entry(&contact_id).append_local(&self_id, draft);
        let temp_id = pending.id.as_str().to_string();

        let event = ClientEvent::SendMessage(OutgoingMessage::from_message(&pending));
        if let Err(e) = self.channel.send(event) {
            state.timelines.entry(&contact_id).mark_failed(&temp_id);
            drop(state);
            warn!("Send to {} failed: {}", contact_id, e);
            self.notify(ViewUpdate::TimelineChanged(contact_id.clone()));
            self.notify(ViewUpdate::SendFailed { contact_id, temp_id });
            return Err(e);
        }
        state.contacts.record_message(&contact_id, &pending);
        drop(state);
        debug!("Queued message {} for {}", temp_id, contact_id);
        self.notify(ViewUpdate::TimelineChanged(contact_id));
        Ok(Some(pending))
    }

    /// Re-send a failed message in place. Messages in any other state are left alone.
    pub fn retry(&self, temp_id: &str) -> ChatResult<()> {
        let mut state = lock_state(&self.state);
        let contact_id = state
            .timelines
            .owner_of_local(temp_id)
            .ok_or_else(|| ChatError::UnknownMessage(temp_id.to_string()))?;
        let timeline = state.timelines.entry(&contact_id);
        let message = timeline
            .get(&MessageId::Local(temp_id.to_string()))
            .cloned()
            .ok_or_else(|| ChatError::UnknownMessage(temp_id.to_string()))?;
        if message.delivery_status != DeliveryStatus::Failed {
            debug!("Message {} is {:?}, nothing to retry", temp_id, message.delivery_status);
            return Ok(());
        }
        timeline.mark_pending(temp_id);
        info!("Retrying message {} to {}", temp_id, contact_id);

        let result = self
            .channel
            .send(ClientEvent::SendMessage(OutgoingMessage::from_message(&message)));
        if result.is_err() {
            state.timelines.entry(&contact_id).mark_failed(temp_id);
        }
        drop(state);
        self.notify(ViewUpdate::TimelineChanged(contact_id.clone()));
        if result.is_err() {
            self.notify(ViewUpdate::SendFailed {
                contact_id,
                temp_id: temp_id.to_string(),
            });
        }
        result
    }

    /// Stop reacting to inbound events. Room membership on the channel is kept.
    pub fn close(&self) {
        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(subscription) = subscription else {
            return;
        };
        {
            // Flip under the state lock so no handler can be mid-mutation afterwards.
            let mut state = lock_state(&self.state);
            subscription.active.store(false, Ordering::SeqCst);
            state.open = None;
        }
        self.channel.remove_handler(subscription.handler);
        self.channel.remove_handler(subscription.state_handler);
        debug!("Chat controller closed");
    }

    fn subscribe(&self) {
        let mut slot = self.subscription.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }
        let active = Arc::new(AtomicBool::new(true));
        let flag = active.clone();
        let state = self.state.clone();
        let updates = self.updates.clone();
        let handler = self.channel.on_event(move |event| {
            let changes = {
                let mut state = lock_state(&state);
                if !flag.load(Ordering::SeqCst) {
                    return;
                }
                state.apply(event)
            };
            for change in changes {
                // The view may have gone away; that is not our problem.
                let _ = updates.send(change);
            }
        });

        let flag = active.clone();
        let state = self.state.clone();
        let updates = self.updates.clone();
        let state_handler = self.channel.on_state_change(move |channel_state| {
            if channel_state != ChannelState::Disconnected {
                return;
            }
            let changes = {
                let mut state = lock_state(&state);
                if !flag.load(Ordering::SeqCst) {
                    return;
                }
                state.fail_in_flight()
            };
            for change in changes {
                let _ = updates.send(change);
            }
        });
        *slot = Some(Subscription {
            handler,
            state_handler,
            active,
        });
    }

    fn notify(&self, update: ViewUpdate) {
        let _ = self.updates.send(update);
    }
}

impl Drop for ChatController {
    fn drop(&mut self) {
        self.close();
    }
}
