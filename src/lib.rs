// Client-side chat session core: authentication, contacts, per-contact timelines
// with optimistic sends, and a self-healing realtime channel.

pub mod api;
pub mod channel;
pub mod client;
pub mod config;
pub mod contacts;
pub mod controller;
pub mod credentials;
pub mod error;
pub mod models;
pub mod session;
pub mod timeline;

// Re-export main types for convenience
pub use client::ChatClient;
pub use controller::{ChatController, ViewUpdate};
pub use error::{ChatError, ChatResult};
pub use models::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retry_classification() {
        assert!(ChatError::ChannelUnavailable.is_retryable());
        assert!(ChatError::Fetch("timeout".to_string()).is_retryable());
        assert!(ChatError::TransportDrop("reset".to_string()).is_retryable());
        assert!(!ChatError::Auth("Invalid credentials".to_string()).is_retryable());
        assert!(!ChatError::NoOpenConversation.is_retryable());
    }

    #[test]
    fn test_message_summaries() {
        let mut msg = Message {
            id: MessageId::Server("1".to_string()),
            sender_id: "1".to_string(),
            receiver_id: "2".to_string(),
            content: "Hello, world!".to_string(),
            kind: MessageKind::Text,
            timestamp: chrono::Utc::now(),
            delivery_status: DeliveryStatus::Sent,
        };
        assert_eq!(msg.summary(), "Hello, world!");

        msg.kind = MessageKind::Audio {
            uri: "/uploads/voice.mp3".to_string(),
            duration_secs: 9,
        };
        assert_eq!(msg.summary(), "[audio 9s]");
    }
}
