// Client configuration
// Defaults suit a backend running locally; the environment and CLI flags override them.

use log::warn;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::channel::backoff::ReconnectPolicy;
use crate::channel::protocol::Framing;
use crate::error::{ChatError, ChatResult};

pub const ENV_API_URL: &str = "CHATLINE_API_URL";
pub const ENV_REALTIME_URL: &str = "CHATLINE_REALTIME_URL";
pub const ENV_REALTIME_FRAMING: &str = "CHATLINE_REALTIME_FRAMING";
pub const ENV_REQUEST_TIMEOUT: &str = "CHATLINE_REQUEST_TIMEOUT_SECS";
pub const ENV_DATA_DIR: &str = "CHATLINE_DATA_DIR";

const DEFAULT_API_URL: &str = "http://localhost:5000";
const DEFAULT_REALTIME_URL: &str = "ws://localhost:5000/socket.io/?EIO=4&transport=websocket";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: String,
    pub realtime_url: String,
    pub realtime_framing: Framing,
    /// Bounds each REST request and each realtime handshake.
    pub request_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Directory for the persisted session. `None` means the platform config dir.
    pub data_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            api_url: DEFAULT_API_URL.to_string(),
            realtime_url: DEFAULT_REALTIME_URL.to_string(),
            realtime_framing: Framing::SocketIo,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            data_dir: None,
        }
    }
}

impl ClientConfig {
    /// Defaults overlaid with whatever `CHATLINE_*` variables are set.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = ClientConfig::default();
        if let Some(url) = lookup(ENV_API_URL) {
            config.api_url = url;
        }
        if let Some(url) = lookup(ENV_REALTIME_URL) {
            config.realtime_url = url;
        }
        if let Some(raw) = lookup(ENV_REALTIME_FRAMING) {
            match raw.parse::<Framing>() {
                Ok(framing) => config.realtime_framing = framing,
                Err(e) => warn!("Ignoring {}: {}", ENV_REALTIME_FRAMING, e),
            }
        }
        if let Some(raw) = lookup(ENV_REQUEST_TIMEOUT) {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => config.request_timeout = Duration::from_secs(secs),
                _ => warn!("Ignoring invalid {}='{}'", ENV_REQUEST_TIMEOUT, raw),
            }
        }
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            config.data_dir = Some(PathBuf::from(dir));
        }
        config
    }

    /// Resolve the directory holding `session.json`, creating it when missing.
    pub fn resolve_data_dir(&self) -> ChatResult<PathBuf> {
        let dir = match &self.data_dir {
            Some(dir) => dir.clone(),
            None => dirs::config_dir()
                .ok_or_else(|| ChatError::Storage("could not determine config directory".to_string()))?
                .join("chatline"),
        };
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(dir)
    }

    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.api_url.trim_end_matches('/'), path)
    }
}
