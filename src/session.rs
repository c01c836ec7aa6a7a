// Session Store
// Holds the authenticated identity and its bearer token for the lifetime of a login.

use log::{info, warn};
use std::sync::Arc;

use crate::api::{AuthGrant, Backend, Registration, Token};
use crate::credentials::{CredentialStore, StoredSession};
use crate::error::{ChatError, ChatResult};
use crate::models::User;

#[derive(Debug, Clone)]
pub struct AuthState {
    pub user: User,
    pub token: Token,
}

pub struct SessionStore {
    backend: Arc<dyn Backend>,
    store: CredentialStore,
    current: Option<AuthState>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn Backend>, store: CredentialStore) -> Self {
        SessionStore {
            backend,
            store,
            current: None,
        }
    }

    pub fn current(&self) -> Option<&AuthState> {
        self.current.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.current.is_some()
    }

    pub fn user_mut(&mut self) -> Option<&mut User> {
        self.current.as_mut().map(|auth| &mut auth.user)
    }

    pub async fn login(&mut self, email: &str, password: &str) -> ChatResult<AuthState> {
        let grant = self.backend.login(email, password).await?;
        self.adopt(grant, Some(email.to_string()))
    }

    pub async fn register(&mut self, registration: &Registration) -> ChatResult<AuthState> {
        let mut grant = self.backend.register(registration).await?;
        if grant.username.is_empty() {
            grant.username = registration.username.clone();
        }
        self.adopt(grant, Some(registration.email.clone()))
    }

    /// Reinstate the session persisted by a previous run, if any.
    pub fn restore(&mut self) -> ChatResult<Option<AuthState>> {
        let Some(stored) = self.store.load()? else {
            return Ok(None);
        };
        match stored.token() {
            Some(token) => {
                let auth = AuthState {
                    user: stored.user(),
                    token,
                };
                info!("Restored session for {}", auth.user.username);
                self.current = Some(auth.clone());
                Ok(Some(auth))
            }
            None => {
                warn!("Stored session has no usable token, discarding it");
                self.store.clear()?;
                Ok(None)
            }
        }
    }

    /// Forget the identity and the persisted credential.
    pub fn logout(&mut self) -> ChatResult<()> {
        if let Some(auth) = self.current.take() {
            info!("Logging out {}", auth.user.username);
        }
        self.store.clear()
    }

    fn adopt(&mut self, grant: AuthGrant, email: Option<String>) -> ChatResult<AuthState> {
        if grant.access_token.is_empty() {
            return Err(ChatError::Auth("server returned an empty token".to_string()));
        }
        let auth = AuthState {
            user: User {
                id: grant.user_id,
                username: grant.username,
                email,
                credits: 0,
            },
            token: Token::new(grant.access_token),
        };
        // A failed write only costs the user a login on next start.
        if let Err(e) = self.store.save(&StoredSession::new(&auth.user, &auth.token)) {
            warn!("Failed to persist session: {}", e);
        }
        info!("Authenticated as {} ({})", auth.user.username, auth.user.id);
        self.current = Some(auth.clone());
        Ok(auth)
    }
}
