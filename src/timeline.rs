// Message Timeline
// Time-ordered record of one conversation. Entries are only ever appended,
// except for the in-place swap of an optimistic entry for its confirmed copy.

use chrono::Utc;
use log::{debug, warn};
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::{ContactId, DeliveryStatus, Draft, Message, MessageId};

#[derive(Debug, Clone)]
pub struct Timeline {
    contact_id: ContactId,
    messages: Vec<Message>,
}

impl Timeline {
    pub fn new(contact_id: impl Into<ContactId>) -> Self {
        Timeline {
            contact_id: contact_id.into(),
            messages: Vec::new(),
        }
    }

    pub fn contact_id(&self) -> &str {
        &self.contact_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    /// Replace the history with a freshly fetched one.
    ///
    /// Local entries the server has not acknowledged yet (pending or failed)
    /// are kept and re-appended after the fetched history.
    pub fn replace(&mut self, fetched: Vec<Message>) {
        let unconfirmed: Vec<Message> = self
            .messages
            .drain(..)
            .filter(|m| m.id.is_local())
            .collect();
        debug!(
            "Timeline {}: loaded {} messages, keeping {} unconfirmed",
            self.contact_id,
            fetched.len(),
            unconfirmed.len()
        );
        self.messages = fetched;
        self.messages.extend(unconfirmed);
    }

    /// Optimistic send: append a `Pending` entry with a fresh temporary id and return it.
    pub fn append_local(&mut self, sender_id: &str, draft: Draft) -> Message {
        let message = Message {
            id: MessageId::Local(Uuid::new_v4().to_string()),
            sender_id: sender_id.to_string(),
            receiver_id: self.contact_id.clone(),
            content: draft.content,
            kind: draft.kind,
            timestamp: Utc::now(),
            delivery_status: DeliveryStatus::Pending,
        };
        self.messages.push(message.clone());
        message
    }

    /// Swap the pending entry `temp_id` for the server's copy, keeping its position.
    /// Without a matching entry the confirmed message is appended instead.
    pub fn confirm(&mut self, temp_id: &str, mut confirmed: Message) {
        confirmed.delivery_status = DeliveryStatus::Sent;
        let local = MessageId::Local(temp_id.to_string());
        match self.messages.iter().position(|m| m.id == local) {
            Some(index) => {
                // A duplicate delivery may already have added the server copy.
                if let Some(dup) = self.position_of_server(&confirmed.id) {
                    if dup != index {
                        self.messages.remove(dup);
                        let index = if dup < index { index - 1 } else { index };
                        self.messages[index] = confirmed;
                        return;
                    }
                }
                self.messages[index] = confirmed;
            }
            None => {
                if self.position_of_server(&confirmed.id).is_some() {
                    debug!("Timeline {}: confirmation for {} already applied", self.contact_id, temp_id);
                    return;
                }
                warn!(
                    "Timeline {}: no pending entry {}, appending confirmed message",
                    self.contact_id, temp_id
                );
                self.messages.push(confirmed);
            }
        }
    }

    /// Flag a local entry as failed. Returns false when there is no such entry.
    pub fn mark_failed(&mut self, temp_id: &str) -> bool {
        self.set_local_status(temp_id, DeliveryStatus::Failed)
    }

    /// Put a failed entry back into `Pending` ahead of a manual retry.
    pub fn mark_pending(&mut self, temp_id: &str) -> bool {
        self.set_local_status(temp_id, DeliveryStatus::Pending)
    }

    /// Fail every local entry still waiting for its echo. Returns their temporary ids.
    pub fn fail_pending(&mut self) -> Vec<String> {
        self.messages
            .iter_mut()
            .filter(|m| m.id.is_local() && m.delivery_status == DeliveryStatus::Pending)
            .map(|m| {
                m.delivery_status = DeliveryStatus::Failed;
                m.id.as_str().to_string()
            })
            .collect()
    }

    /// Merge a message from the other party. Duplicate deliveries of the same
    /// server id are ignored. Returns whether the timeline changed.
    pub fn receive_remote(&mut self, message: Message) -> bool {
        if self.position_of_server(&message.id).is_some() {
            debug!("Timeline {}: dropping duplicate {}", self.contact_id, message.id);
            return false;
        }
        self.messages.push(message);
        true
    }

    fn position_of_server(&self, id: &MessageId) -> Option<usize> {
        match id {
            MessageId::Server(_) => self.messages.iter().position(|m| &m.id == id),
            MessageId::Local(_) => None,
        }
    }

    fn set_local_status(&mut self, temp_id: &str, status: DeliveryStatus) -> bool {
        let local = MessageId::Local(temp_id.to_string());
        match self.messages.iter_mut().find(|m| m.id == local) {
            Some(message) => {
                message.delivery_status = status;
                true
            }
            None => false,
        }
    }
}

/// All timelines of a session, keyed by contact.
#[derive(Debug, Default)]
pub struct Timelines {
    by_contact: HashMap<ContactId, Timeline>,
}

impl Timelines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, contact_id: &str) -> Option<&Timeline> {
        self.by_contact.get(contact_id)
    }

    pub fn entry(&mut self, contact_id: &str) -> &mut Timeline {
        self.by_contact
            .entry(contact_id.to_string())
            .or_insert_with(|| Timeline::new(contact_id))
    }

    /// Find the timeline holding the local entry `temp_id`.
    pub fn owner_of_local(&self, temp_id: &str) -> Option<ContactId> {
        let local = MessageId::Local(temp_id.to_string());
        self.by_contact
            .values()
            .find(|t| t.get(&local).is_some())
            .map(|t| t.contact_id.clone())
    }

    /// Fail pending entries across all timelines, as `(contact, temp_id)` pairs.
    pub fn fail_pending(&mut self) -> Vec<(ContactId, String)> {
        let mut failed = Vec::new();
        for timeline in self.by_contact.values_mut() {
            let contact_id = timeline.contact_id.clone();
            failed.extend(timeline.fail_pending().into_iter().map(|id| (contact_id.clone(), id)));
        }
        failed
    }

    /// The earliest local entry still `Pending`, over all timelines.
    pub fn oldest_pending(&self) -> Option<(ContactId, String)> {
        self.by_contact
            .values()
            .flat_map(|t| t.messages.iter().map(move |m| (t, m)))
            .filter(|(_, m)| m.id.is_local() && m.delivery_status == DeliveryStatus::Pending)
            .min_by_key(|(_, m)| m.timestamp)
            .map(|(t, m)| (t.contact_id.clone(), m.id.as_str().to_string()))
    }

    pub fn clear(&mut self) {
        self.by_contact.clear();
    }
}
