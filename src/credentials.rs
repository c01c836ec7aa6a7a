use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::api::Token;
use crate::error::{ChatError, ChatResult};
use crate::models::User;

const SESSION_FILE: &str = "session.json";

/// What survives a restart: the bearer token and enough identity to show who is logged in.
#[derive(Serialize, Deserialize, Clone)]
pub struct StoredSession {
    pub user_id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    token: String,
}

impl StoredSession {
    pub fn new(user: &User, token: &Token) -> Self {
        StoredSession {
            user_id: user.id.clone(),
            username: user.username.clone(),
            email: user.email.clone(),
            token: BASE64.encode(token.as_str()),
        }
    }

    pub fn token(&self) -> Option<Token> {
        BASE64
            .decode(&self.token)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .filter(|raw| !raw.is_empty())
            .map(Token::new)
    }

    pub fn user(&self) -> User {
        User {
            id: self.user_id.clone(),
            username: self.username.clone(),
            email: self.email.clone(),
            credits: 0,
        }
    }
}

/// File-backed store for the one persisted session, scoped to a data directory.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(data_dir: &Path) -> Self {
        CredentialStore {
            path: data_dir.join(SESSION_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, session: &StoredSession) -> ChatResult<()> {
        let file = File::create(&self.path)?;
        serde_json::to_writer_pretty(file, session)
            .map_err(|e| ChatError::Storage(format!("failed to write session: {}", e)))?;
        info!("Session saved for {}", session.username);
        Ok(())
    }

    pub fn load(&self) -> ChatResult<Option<StoredSession>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let mut contents = String::new();
        File::open(&self.path)?.read_to_string(&mut contents)?;
        let session: StoredSession = serde_json::from_str(&contents)
            .map_err(|e| ChatError::Storage(format!("corrupt session file {}: {}", self.path.display(), e)))?;
        info!("Loaded session for {} from {}", session.username, self.path.display());
        Ok(Some(session))
    }

    /// Remove the persisted session. Clearing an empty store is fine.
    pub fn clear(&self) -> ChatResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("Removed {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
