use thiserror::Error;

/// Failures surfaced by the chat core.
///
/// Transport drops are normally absorbed by the channel's reconnect loop and
/// only show up here when something asks for them explicitly.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChatError {
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("failed to fetch: {0}")]
    Fetch(String),

    #[error("realtime channel unavailable")]
    ChannelUnavailable,

    #[error("connection lost: {0}")]
    TransportDrop(String),

    #[error("no conversation is open")]
    NoOpenConversation,

    #[error("no message with id {0} in this conversation")]
    UnknownMessage(String),

    #[error("payment failed: {0}")]
    Payment(String),

    #[error("session storage error: {0}")]
    Storage(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ChatError {
    /// Whether repeating the same call later can succeed without user input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::Fetch(_) | ChatError::ChannelUnavailable | ChatError::TransportDrop(_)
        )
    }
}

impl From<std::io::Error> for ChatError {
    fn from(e: std::io::Error) -> Self {
        ChatError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Protocol(e.to_string())
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
