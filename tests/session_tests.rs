// Session lifecycle tests
// Login, persisted restore, top-up and logout through the client root.

mod common;
use common::{fast_policy, next_link, setup_logging, wait_for_state, FakeBackend, FakeConnector, ServerSide, PASSWORD};

use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;

use chatline::api::{PaymentRequest, Registration};
use chatline::channel::ChannelState;
use chatline::credentials::CredentialStore;
use chatline::{ChatClient, ChatError};

fn client(dir: &TempDir) -> (ChatClient, Arc<FakeConnector>, mpsc::UnboundedReceiver<ServerSide>) {
    setup_logging();
    let (connector, links) = FakeConnector::new();
    let client = ChatClient::with_parts(
        FakeBackend::new(),
        connector.clone(),
        CredentialStore::new(dir.path()),
        fast_policy(),
    );
    (client, connector, links)
}

fn payment(amount: f64, credits: i64) -> PaymentRequest {
    PaymentRequest {
        amount,
        currency: "USD".to_string(),
        payment_method: "card".to_string(),
        credits,
        card_token: None,
    }
}

#[tokio::test]
async fn test_login_persists_and_restores() {
    let dir = TempDir::new().unwrap();
    let (mut first, _connector, mut links) = client(&dir);

    let user = first.login("alice@example.org", PASSWORD).await.unwrap();
    assert_eq!(user.id, "1");
    assert_eq!(user.username, "alice");
    assert_eq!(user.credits, 25);
    assert!(dir.path().join("session.json").exists());

    // Login brings the realtime channel up on its own
    let _server = next_link(&mut links).await;
    wait_for_state(first.channel().unwrap(), ChannelState::Connected).await;
    drop(first);

    let (mut second, _connector, _links) = client(&dir);
    let restored = second.restore().await.unwrap().expect("session should be restored");
    assert_eq!(restored.id, "1");
    assert_eq!(restored.username, "alice");
    assert_eq!(restored.email.as_deref(), Some("alice@example.org"));
    assert_eq!(restored.credits, 25);
}

#[tokio::test]
async fn test_restore_without_stored_session() {
    let dir = TempDir::new().unwrap();
    let (mut client, connector, _links) = client(&dir);

    assert_eq!(client.restore().await.unwrap(), None);
    assert!(client.user().is_none());
    assert!(client.channel().is_none());
    assert_eq!(connector.attempts(), 0);
}

#[tokio::test]
async fn test_bad_password_is_an_auth_error() {
    let dir = TempDir::new().unwrap();
    let (mut client, connector, _links) = client(&dir);

    let result = client.login("alice@example.org", "wrong").await;

    assert!(matches!(result, Err(ChatError::Auth(_))));
    assert!(!dir.path().join("session.json").exists());
    assert!(client.user().is_none());
    assert_eq!(connector.attempts(), 0);
    assert!(matches!(client.controller(), Err(ChatError::Auth(_))));
}

#[tokio::test]
async fn test_register_signs_in() {
    let dir = TempDir::new().unwrap();
    let (mut client, _connector, _links) = client(&dir);

    let user = client
        .register(&Registration {
            username: "dave".to_string(),
            email: "dave@example.org".to_string(),
            password: PASSWORD.to_string(),
            phone_number: None,
            country: Some("NL".to_string()),
        })
        .await
        .unwrap();

    assert_eq!(user.username, "dave");
    assert_eq!(user.email.as_deref(), Some("dave@example.org"));
    assert!(dir.path().join("session.json").exists());
}

#[tokio::test]
async fn test_refresh_contacts_fills_directory() {
    let dir = TempDir::new().unwrap();
    let (mut client, _connector, _links) = client(&dir);
    assert!(matches!(client.refresh_contacts().await, Err(ChatError::Auth(_))));

    client.login("alice@example.org", PASSWORD).await.unwrap();
    let contacts = client.refresh_contacts().await.unwrap();

    let names: Vec<&str> = contacts.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["bob", "carol"]);

    let (controller, _updates) = client.controller().unwrap();
    assert_eq!(controller.with_state(|state| state.contacts.len()), 2);
}

#[tokio::test]
async fn test_top_up_updates_balance() {
    let dir = TempDir::new().unwrap();
    let (mut client, _connector, _links) = client(&dir);
    client.login("alice@example.org", PASSWORD).await.unwrap();

    let receipt = client.top_up(&payment(4.99, 100)).await.unwrap();
    assert_eq!(receipt.new_balance, 125);
    assert_eq!(client.user().map(|u| u.credits), Some(125));

    let refused = client.top_up(&payment(0.0, 10)).await;
    assert!(matches!(refused, Err(ChatError::Payment(_))));
    assert_eq!(client.user().map(|u| u.credits), Some(125));
}

#[tokio::test]
async fn test_logout_closes_channel_and_forgets_session() {
    let dir = TempDir::new().unwrap();
    let (mut client, connector, mut links) = client(&dir);
    client.login("alice@example.org", PASSWORD).await.unwrap();
    let _server = next_link(&mut links).await;
    let channel = client.channel().cloned().unwrap();
    wait_for_state(&channel, ChannelState::Connected).await;

    client.logout().unwrap();

    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(client.channel().is_none());
    assert!(client.user().is_none());
    assert!(!dir.path().join("session.json").exists());
    assert!(matches!(client.controller(), Err(ChatError::Auth(_))));

    // Logging out twice is harmless
    client.logout().unwrap();
    assert_eq!(connector.attempts(), 1);
}
