// Contact Directory
// Contact profiles plus the last-message summary and unread counter shown in the contact list.

use log::debug;
use std::collections::HashMap;

use crate::models::{Contact, ContactId, ContactStatus, LastMessage, Message};

#[derive(Debug, Default)]
pub struct ContactDirectory {
    contacts: HashMap<ContactId, Contact>,
}

impl ContactDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the directory with a freshly fetched list.
    pub fn populate(&mut self, contacts: Vec<Contact>) {
        self.contacts = contacts.into_iter().map(|c| (c.id.clone(), c)).collect();
        debug!("Contact directory holds {} contacts", self.contacts.len());
    }

    pub fn get(&self, id: &str) -> Option<&Contact> {
        self.contacts.get(id)
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// Contacts ordered for display: most recent conversation first, then by name.
    pub fn list(&self) -> Vec<&Contact> {
        let mut list: Vec<&Contact> = self.contacts.values().collect();
        list.sort_by(|a, b| {
            let ta = a.last_message.as_ref().and_then(|m| m.timestamp);
            let tb = b.last_message.as_ref().and_then(|m| m.timestamp);
            tb.cmp(&ta).then_with(|| a.name.cmp(&b.name))
        });
        list
    }

    pub fn reset_unread(&mut self, id: &str) {
        if let Some(contact) = self.contacts.get_mut(id) {
            contact.unread_count = 0;
        }
    }

    /// Update the preview for the conversation `message` belongs to.
    pub fn record_message(&mut self, contact_id: &str, message: &Message) {
        let contact = self.entry(contact_id);
        contact.last_message = Some(LastMessage {
            text: message.summary(),
            timestamp: Some(message.timestamp),
        });
    }

    /// Preview update plus unread bump, for messages arriving in a conversation that is not open.
    pub fn record_unread(&mut self, contact_id: &str, message: &Message) {
        self.record_message(contact_id, message);
        let contact = self.entry(contact_id);
        contact.unread_count = contact.unread_count.saturating_add(1);
    }

    pub fn set_status(&mut self, id: &str, status: ContactStatus) -> bool {
        match self.contacts.get_mut(id) {
            Some(contact) if contact.status != status => {
                contact.status = status;
                true
            }
            _ => false,
        }
    }

    pub fn clear(&mut self) {
        self.contacts.clear();
    }

    // Messages can arrive from someone the last fetch did not list.
    fn entry(&mut self, id: &str) -> &mut Contact {
        self.contacts.entry(id.to_string()).or_insert_with(|| Contact {
            id: id.to_string(),
            name: id.to_string(),
            avatar: None,
            status: ContactStatus::Offline,
            last_message: None,
            unread_count: 0,
        })
    }
}
