// REST backend access
// The chat core only talks to the backend through the `Backend` trait; `HttpBackend`
// is the reqwest-based implementation used by the binary.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use reqwest::{Client as HttpClient, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::ClientConfig;
use crate::error::{ChatError, ChatResult};
use crate::models::{de_id, Contact, ContactRecord, Message, MessageRecord, User};

/// Bearer credential handed out by login/register.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn new(raw: impl Into<String>) -> Self {
        Token(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

// Never print the credential itself.
impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Token(..)")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthGrant {
    pub access_token: String,
    #[serde(deserialize_with = "de_id")]
    pub user_id: String,
    /// Login answers with it, register does not.
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentRequest {
    pub amount: f64,
    pub currency: String,
    pub payment_method: String,
    pub credits: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PaymentReceipt {
    pub credits_added: i64,
    pub new_balance: i64,
}

#[derive(Serialize)]
struct LoginBody<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Deserialize)]
struct ProfileRecord {
    #[serde(deserialize_with = "de_id")]
    id: String,
    username: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    credits: i64,
}

/// Everything the client needs from the REST side of the backend.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn login(&self, email: &str, password: &str) -> ChatResult<AuthGrant>;

    async fn register(&self, registration: &Registration) -> ChatResult<AuthGrant>;

    async fn profile(&self, token: &Token, user_id: &str) -> ChatResult<User>;

    async fn contacts(&self, token: &Token) -> ChatResult<Vec<Contact>>;

    /// Full history with `contact_id`, oldest first.
    async fn messages(&self, token: &Token, contact_id: &str) -> ChatResult<Vec<Message>>;

    async fn process_payment(&self, token: &Token, request: &PaymentRequest) -> ChatResult<PaymentReceipt>;
}

pub struct HttpBackend {
    http: HttpClient,
    config: ClientConfig,
}

impl HttpBackend {
    pub fn new(config: ClientConfig) -> ChatResult<Self> {
        let http = HttpClient::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ChatError::Fetch(format!("failed to build HTTP client: {}", e)))?;
        Ok(HttpBackend { http, config })
    }

    async fn authenticate(&self, request: RequestBuilder) -> ChatResult<AuthGrant> {
        let response = request
            .send()
            .await
            .map_err(|e| ChatError::Auth(format!("request failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let reason = error_reason(response, status).await;
            warn!("Authentication rejected with {}: {}", status, reason);
            return Err(ChatError::Auth(reason));
        }
        response
            .json::<AuthGrant>()
            .await
            .map_err(|e| ChatError::Auth(format!("malformed auth response: {}", e)))
    }

    async fn fetch<T: DeserializeOwned>(&self, token: &Token, path: &str) -> ChatResult<T> {
        let url = self.config.endpoint(path);
        debug!("GET {}", url);
        let response = self
            .http
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, token.bearer())
            .send()
            .await
            .map_err(|e| ChatError::Fetch(format!("GET {} failed: {}", path, e)))?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let reason = error_reason(response, status).await;
            return Err(ChatError::Auth(reason));
        }
        if !status.is_success() {
            let reason = error_reason(response, status).await;
            error!("GET {} returned {}: {}", path, status, reason);
            return Err(ChatError::Fetch(reason));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ChatError::Fetch(format!("malformed response from {}: {}", path, e)))
    }
}

/// Prefer the backend's `{"error": ...}` body, fall back to the status line.
async fn error_reason(response: Response, status: StatusCode) -> String {
    match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn login(&self, email: &str, password: &str) -> ChatResult<AuthGrant> {
        info!("Logging in as {}", email);
        let request = self
            .http
            .post(self.config.endpoint("/api/login"))
            .json(&LoginBody { email, password });
        self.authenticate(request).await
    }

    async fn register(&self, registration: &Registration) -> ChatResult<AuthGrant> {
        info!("Registering account {}", registration.username);
        let request = self
            .http
            .post(self.config.endpoint("/api/register"))
            .json(registration);
        self.authenticate(request).await
    }

    async fn profile(&self, token: &Token, user_id: &str) -> ChatResult<User> {
        let record: ProfileRecord = self.fetch(token, &format!("/api/user/{}", user_id)).await?;
        Ok(User {
            id: record.id,
            username: record.username,
            email: record.email,
            credits: record.credits,
        })
    }

    async fn contacts(&self, token: &Token) -> ChatResult<Vec<Contact>> {
        let records: Vec<ContactRecord> = self.fetch(token, "/api/contacts").await?;
        debug!("Fetched {} contacts", records.len());
        Ok(records.into_iter().map(Contact::from).collect())
    }

    async fn messages(&self, token: &Token, contact_id: &str) -> ChatResult<Vec<Message>> {
        let records: Vec<MessageRecord> = self.fetch(token, &format!("/api/messages/{}", contact_id)).await?;
        debug!("Fetched {} messages for contact {}", records.len(), contact_id);
        records
            .into_iter()
            .map(|record| record.into_message().map_err(|e| ChatError::Fetch(e.to_string())))
            .collect()
    }

    async fn process_payment(&self, token: &Token, request: &PaymentRequest) -> ChatResult<PaymentReceipt> {
        info!("Processing payment for {} credits", request.credits);
        let response = self
            .http
            .post(self.config.endpoint("/api/payment/process"))
            .header(reqwest::header::AUTHORIZATION, token.bearer())
            .json(request)
            .send()
            .await
            .map_err(|e| ChatError::Payment(format!("request failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let reason = error_reason(response, status).await;
            return Err(ChatError::Payment(reason));
        }
        response
            .json::<PaymentReceipt>()
            .await
            .map_err(|e| ChatError::Payment(format!("malformed payment response: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_reply_without_username() {
        let raw = r#"{"message":"User created successfully","user_id":5,"access_token":"jwt"}"#;
        let grant: AuthGrant = serde_json::from_str(raw).unwrap();

        assert_eq!(grant.user_id, "5");
        assert_eq!(grant.access_token, "jwt");
        assert!(grant.username.is_empty());
    }

    #[test]
    fn test_login_reply() {
        let raw = r#"{"access_token":"jwt","user_id":"7","username":"carol"}"#;
        let grant: AuthGrant = serde_json::from_str(raw).unwrap();

        assert_eq!(grant.user_id, "7");
        assert_eq!(grant.username, "carol");
    }

    #[test]
    fn test_token_debug_is_redacted() {
        let token = Token::new("secret-jwt");
        assert_eq!(format!("{:?}", token), "Token(..)");
        assert_eq!(token.bearer(), "Bearer secret-jwt");
    }
}
