// Chat client session root
// Owns the session store, the realtime channel and the conversation state for one login.

use log::{info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::api::{Backend, HttpBackend, PaymentReceipt, PaymentRequest, Registration};
use crate::channel::{Channel, Connector, ReconnectPolicy, WsConnector};
use crate::config::ClientConfig;
use crate::controller::{lock_state, ChatController, ChatState, SharedState, ViewUpdate};
use crate::credentials::CredentialStore;
use crate::error::{ChatError, ChatResult};
use crate::models::{Contact, User};
use crate::session::{AuthState, SessionStore};

pub struct ChatClient {
    backend: Arc<dyn Backend>,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    session: SessionStore,
    channel: Option<Channel>,
    state: Option<SharedState>,
}

impl ChatClient {
    /// Client talking HTTP + WebSocket to the configured backend.
    pub fn new(config: &ClientConfig) -> ChatResult<Self> {
        let backend = Arc::new(HttpBackend::new(config.clone())?);
        let connector = Arc::new(
            WsConnector::new(config.realtime_url.clone(), config.realtime_framing)
                .with_handshake_timeout(config.request_timeout),
        );
        let store = CredentialStore::new(&config.resolve_data_dir()?);
        Ok(Self::with_parts(backend, connector, store, config.reconnect.clone()))
    }

    pub fn with_parts(
        backend: Arc<dyn Backend>,
        connector: Arc<dyn Connector>,
        store: CredentialStore,
        policy: ReconnectPolicy,
    ) -> Self {
        ChatClient {
            session: SessionStore::new(backend.clone(), store),
            backend,
            connector,
            policy,
            channel: None,
            state: None,
        }
    }

    pub fn user(&self) -> Option<&User> {
        self.session.current().map(|auth| &auth.user)
    }

    pub fn channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    pub async fn login(&mut self, email: &str, password: &str) -> ChatResult<User> {
        let auth = self.session.login(email, password).await?;
        self.start(&auth).await;
        Ok(self.user().cloned().unwrap_or(auth.user))
    }

    pub async fn register(&mut self, registration: &Registration) -> ChatResult<User> {
        let auth = self.session.register(registration).await?;
        self.start(&auth).await;
        Ok(self.user().cloned().unwrap_or(auth.user))
    }

    /// Resume the session persisted by an earlier run.
    pub async fn restore(&mut self) -> ChatResult<Option<User>> {
        let Some(auth) = self.session.restore()? else {
            return Ok(None);
        };
        self.start(&auth).await;
        Ok(self.user().cloned())
    }

    pub async fn refresh_contacts(&self) -> ChatResult<Vec<Contact>> {
        let auth = self.auth()?;
        let state = self.state()?;
        let contacts = self.backend.contacts(&auth.token).await?;
        let mut state = lock_state(&state);
        state.contacts.populate(contacts);
        Ok(state.contacts.list().into_iter().cloned().collect())
    }

    /// Controller for this session's conversations.
    pub fn controller(&self) -> ChatResult<(ChatController, mpsc::UnboundedReceiver<ViewUpdate>)> {
        let auth = self.auth()?;
        let channel = self
            .channel
            .clone()
            .ok_or_else(|| ChatError::Auth("not logged in".to_string()))?;
        Ok(ChatController::new(
            self.backend.clone(),
            auth.token.clone(),
            channel,
            self.state()?,
        ))
    }

    /// Buy credits; the user's balance follows the server's answer.
    pub async fn top_up(&mut self, request: &PaymentRequest) -> ChatResult<PaymentReceipt> {
        let token = self.auth()?.token.clone();
        let receipt = self.backend.process_payment(&token, request).await?;
        if let Some(user) = self.session.user_mut() {
            user.credits = receipt.new_balance;
        }
        info!("Added {} credits, balance {}", receipt.credits_added, receipt.new_balance);
        Ok(receipt)
    }

    /// Close the channel, drop conversations and forget the stored credential.
    pub fn logout(&mut self) -> ChatResult<()> {
        self.teardown();
        self.session.logout()
    }

    async fn start(&mut self, auth: &AuthState) {
        self.teardown();
        let channel = Channel::new(self.connector.clone(), self.policy.clone());
        channel.open(auth.token.clone());
        self.channel = Some(channel);
        self.state = Some(ChatState::shared(auth.user.id.clone()));

        match self.backend.profile(&auth.token, &auth.user.id).await {
            Ok(profile) => {
                if let Some(user) = self.session.user_mut() {
                    user.credits = profile.credits;
                    if user.email.is_none() {
                        user.email = profile.email;
                    }
                }
            }
            Err(e) => warn!("Could not load profile for {}: {}", auth.user.username, e),
        }
    }

    fn teardown(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        if let Some(state) = self.state.take() {
            lock_state(&state).clear();
        }
    }

    fn auth(&self) -> ChatResult<&AuthState> {
        self.session
            .current()
            .ok_or_else(|| ChatError::Auth("not logged in".to_string()))
    }

    fn state(&self) -> ChatResult<SharedState> {
        self.state
            .clone()
            .ok_or_else(|| ChatError::Auth("not logged in".to_string()))
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        if let Some(channel) = &self.channel {
            channel.close();
        }
    }
}
