// Chat view controller tests
// Optimistic sends, confirmation by echo, inbound routing, stale loads and close.

mod common;
use common::{
    contact, eventually, fast_policy, new_message_event, next_link, server_message, setup_logging,
    wait_for_state, within, FakeBackend, FakeConnector, ServerSide, SELF_ID,
};

use std::sync::Arc;
use tokio::sync::mpsc;

use chatline::api::Token;
use chatline::channel::{Channel, ChannelState, ClientEvent, ServerEvent};
use chatline::controller::{ChatState, SharedState};
use chatline::{ChatController, ChatError, DeliveryStatus, Draft, MessageKind, ViewUpdate};

struct Harness {
    backend: Arc<FakeBackend>,
    channel: Channel,
    state: SharedState,
    controller: Arc<ChatController>,
    updates: mpsc::UnboundedReceiver<ViewUpdate>,
    links: mpsc::UnboundedReceiver<ServerSide>,
}

fn harness() -> Harness {
    setup_logging();
    let backend = FakeBackend::new();
    let (connector, links) = FakeConnector::new();
    let channel = Channel::new(connector, fast_policy());
    let state = ChatState::shared(SELF_ID);
    {
        let mut guard = state.lock().unwrap();
        guard.contacts.populate(vec![contact("42", "bob"), contact("7", "carol")]);
    }
    let (controller, updates) =
        ChatController::new(backend.clone(), Token::new("token-1"), channel.clone(), state.clone());
    Harness {
        backend,
        channel,
        state,
        controller: Arc::new(controller),
        updates,
        links,
    }
}

impl Harness {
    /// Open the channel and return the server side once connected.
    async fn connect(&mut self) -> ServerSide {
        self.channel.open(Token::new("token-1"));
        let server = next_link(&mut self.links).await;
        wait_for_state(&self.channel, ChannelState::Connected).await;
        server
    }

    fn timeline_len(&self, contact_id: &str) -> usize {
        self.controller.timeline(contact_id).map(|t| t.len()).unwrap_or(0)
    }

    fn unread(&self, contact_id: &str) -> u32 {
        let state = self.state.lock().unwrap();
        state.contacts.get(contact_id).map(|c| c.unread_count).unwrap_or(0)
    }

    /// Handler registered after the controller; once it fires, the controller has run.
    fn dispatched(&self) -> mpsc::UnboundedReceiver<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channel.on_event(move |_| {
            let _ = tx.send(());
        });
        rx
    }
}

#[tokio::test]
async fn test_submit_while_disconnected_marks_failed() {
    let h = harness();
    h.controller.open("42").await.unwrap();

    let result = h.controller.submit("hi");

    assert_eq!(result, Err(ChatError::ChannelUnavailable));
    let timeline = h.controller.timeline("42").unwrap();
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline.messages()[0].delivery_status, DeliveryStatus::Failed);
    assert_eq!(timeline.messages()[0].content, "hi");
    assert_eq!(h.channel.state(), ChannelState::Disconnected);
}

#[tokio::test]
async fn test_submit_is_pending_until_echo_confirms() {
    let mut h = harness();
    let mut server = h.connect().await;
    h.controller.open("42").await.unwrap();
    assert_eq!(
        server.next_event().await,
        ClientEvent::JoinChat {
            contact_id: "42".to_string()
        }
    );

    let pending = h.controller.submit("hello").unwrap().expect("message should be queued");

    // Visible before any round trip
    let timeline = h.controller.timeline("42").unwrap();
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline.messages()[0].delivery_status, DeliveryStatus::Pending);

    let client_id = match server.next_event().await {
        ClientEvent::SendMessage(outgoing) => {
            assert_eq!(outgoing.receiver_id, "42");
            assert_eq!(outgoing.content, "hello");
            assert_eq!(outgoing.message_type, "text");
            outgoing.client_id
        }
        other => panic!("Expected send_message, got {:?}", other),
    };
    assert_eq!(client_id, pending.id.as_str());

    server.push(new_message_event("500", SELF_ID, "42", Some(&client_id)));

    let controller = h.controller.clone();
    eventually(|| {
        controller
            .timeline("42")
            .map(|t| t.messages()[0].delivery_status == DeliveryStatus::Sent)
            .unwrap_or(false)
    })
    .await;
    let timeline = h.controller.timeline("42").unwrap();
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline.messages()[0].server_id(), Some("500"));
}

#[tokio::test]
async fn test_blank_submit_is_ignored() {
    let mut h = harness();
    let mut server = h.connect().await;
    h.controller.open("42").await.unwrap();
    server.next_event().await;

    assert_eq!(h.controller.submit("   \t"), Ok(None));
    assert_eq!(h.timeline_len("42"), 0);
    assert!(server.from_client.try_recv().is_err());
}

#[tokio::test]
async fn test_submit_without_open_conversation() {
    let h = harness();
    assert_eq!(h.controller.submit("hi"), Err(ChatError::NoOpenConversation));
}

#[tokio::test]
async fn test_media_draft_goes_out_with_payload() {
    let mut h = harness();
    let mut server = h.connect().await;
    h.controller.open("42").await.unwrap();
    server.next_event().await;

    h.controller
        .submit_draft(Draft::audio("/uploads/voice.mp3", 14))
        .unwrap()
        .expect("audio draft should be queued");

    match server.next_event().await {
        ClientEvent::SendMessage(outgoing) => {
            assert_eq!(outgoing.message_type, "audio");
            assert_eq!(outgoing.media_uri.as_deref(), Some("/uploads/voice.mp3"));
            assert_eq!(outgoing.duration, Some(14));
        }
        other => panic!("Expected send_message, got {:?}", other),
    }
    let timeline = h.controller.timeline("42").unwrap();
    assert!(matches!(timeline.messages()[0].kind, MessageKind::Audio { duration_secs: 14, .. }));
}

#[tokio::test]
async fn test_inbound_for_open_contact_is_merged_once() {
    let mut h = harness();
    let server = h.connect().await;
    h.controller.open("42").await.unwrap();
    let mut dispatched = h.dispatched();

    server.push(new_message_event("600", "42", SELF_ID, None));
    server.push(new_message_event("600", "42", SELF_ID, None));
    within(dispatched.recv()).await;
    within(dispatched.recv()).await;

    assert_eq!(h.timeline_len("42"), 1);
    assert_eq!(h.unread("42"), 0);
}

#[tokio::test]
async fn test_inbound_for_other_contact_only_touches_directory() {
    let mut h = harness();
    let server = h.connect().await;
    h.controller.open("42").await.unwrap();
    let mut dispatched = h.dispatched();

    server.push(new_message_event("601", "7", SELF_ID, None));
    within(dispatched.recv()).await;

    assert_eq!(h.unread("7"), 1);
    assert_eq!(h.timeline_len("42"), 0);
    assert_eq!(h.timeline_len("7"), 0);
    let state = h.state.lock().unwrap();
    let preview = state.contacts.get("7").and_then(|c| c.last_message.clone());
    assert_eq!(preview.map(|m| m.text), Some("message 601".to_string()));
}

#[tokio::test]
async fn test_open_resets_unread_and_notifies() {
    let mut h = harness();
    {
        let mut state = h.state.lock().unwrap();
        let message = server_message("1", "7", SELF_ID, "ping");
        state.contacts.record_unread("7", &message);
    }
    assert_eq!(h.unread("7"), 1);

    h.controller.open("7").await.unwrap();

    assert_eq!(h.unread("7"), 0);
    assert_eq!(within(h.updates.recv()).await, Some(ViewUpdate::ContactsChanged));
    assert_eq!(
        within(h.updates.recv()).await,
        Some(ViewUpdate::TimelineChanged("7".to_string()))
    );
}

#[tokio::test]
async fn test_close_stops_timeline_mutation() {
    let mut h = harness();
    let server = h.connect().await;
    h.controller.open("42").await.unwrap();

    h.controller.close();
    let mut dispatched = h.dispatched();
    server.push(new_message_event("700", "42", SELF_ID, None));
    within(dispatched.recv()).await;

    assert_eq!(h.timeline_len("42"), 0);
    assert_eq!(h.unread("42"), 0);
    assert_eq!(h.controller.open_contact(), None);
    // Room membership outlives the controller
    assert_eq!(h.channel.rooms(), vec!["42".to_string()]);
}

#[tokio::test]
async fn test_stale_load_does_not_overwrite_newer_conversation() {
    let h = harness();
    h.backend.set_history("A", vec![server_message("1", "A", SELF_ID, "from A")]);
    h.backend.set_history("B", vec![server_message("2", "B", SELF_ID, "from B")]);
    let release_a = h.backend.gate("A");

    let controller = h.controller.clone();
    let load_a = tokio::spawn(async move { controller.open("A").await });

    let controller = h.controller.clone();
    eventually(|| controller.open_contact().as_deref() == Some("A")).await;

    h.controller.open("B").await.unwrap();
    release_a.send(()).unwrap();
    within(load_a).await.unwrap().unwrap();

    let b = h.controller.timeline("B").unwrap();
    assert_eq!(b.len(), 1);
    assert_eq!(b.messages()[0].content, "from B");
    assert_eq!(h.timeline_len("A"), 0);
    assert_eq!(h.controller.open_contact().as_deref(), Some("B"));
}

#[tokio::test]
async fn test_failed_load_keeps_previous_timeline() {
    let h = harness();
    h.backend.set_history("42", vec![server_message("1", "42", SELF_ID, "old")]);
    h.controller.open("42").await.unwrap();
    assert_eq!(h.timeline_len("42"), 1);

    h.backend.set_fail_fetch(true);
    let result = h.controller.open("42").await;

    assert!(matches!(result, Err(ChatError::Fetch(_))));
    assert_eq!(h.timeline_len("42"), 1);
}

#[tokio::test]
async fn test_retry_resends_failed_message() {
    let mut h = harness();
    h.controller.open("42").await.unwrap();
    assert!(h.controller.submit("again").is_err());
    let temp_id = h.controller.timeline("42").unwrap().messages()[0].id.as_str().to_string();

    let mut server = h.connect().await;
    assert_eq!(
        server.next_event().await,
        ClientEvent::JoinChat {
            contact_id: "42".to_string()
        }
    );

    h.controller.retry(&temp_id).unwrap();

    match server.next_event().await {
        ClientEvent::SendMessage(outgoing) => assert_eq!(outgoing.client_id, temp_id),
        other => panic!("Expected send_message, got {:?}", other),
    }
    let timeline = h.controller.timeline("42").unwrap();
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline.messages()[0].delivery_status, DeliveryStatus::Pending);

    assert_eq!(
        h.controller.retry("missing"),
        Err(ChatError::UnknownMessage("missing".to_string()))
    );
}

#[tokio::test]
async fn test_presence_updates_contact_status() {
    let mut h = harness();
    let server = h.connect().await;
    h.controller.open("42").await.unwrap();
    let mut dispatched = h.dispatched();

    server.push(ServerEvent::Presence {
        user_id: "7".to_string(),
        online: true,
    });
    within(dispatched.recv()).await;

    let state = h.state.lock().unwrap();
    assert_eq!(
        state.contacts.get("7").map(|c| c.status),
        Some(chatline::ContactStatus::Online)
    );
}

#[tokio::test]
async fn test_send_lost_with_link_can_be_retried_after_reconnect() {
    let mut h = harness();
    let mut first = h.connect().await;
    h.controller.open("42").await.unwrap();
    first.next_event().await;

    let pending = h.controller.submit("hello").unwrap().expect("message should be queued");
    let temp_id = pending.id.as_str().to_string();
    assert!(matches!(first.next_event().await, ClientEvent::SendMessage(_)));

    // Link dies before the echo comes back
    drop(first);
    let mut second = next_link(&mut h.links).await;
    assert_eq!(
        second.next_event().await,
        ClientEvent::JoinChat {
            contact_id: "42".to_string()
        }
    );
    wait_for_state(&h.channel, ChannelState::Connected).await;

    let timeline = h.controller.timeline("42").unwrap();
    assert_eq!(timeline.messages()[0].delivery_status, DeliveryStatus::Failed);
    let mut saw_failure = false;
    while let Ok(update) = h.updates.try_recv() {
        saw_failure |= update
            == ViewUpdate::SendFailed {
                contact_id: "42".to_string(),
                temp_id: temp_id.clone(),
            };
    }
    assert!(saw_failure);

    h.controller.retry(&temp_id).unwrap();
    match second.next_event().await {
        ClientEvent::SendMessage(outgoing) => assert_eq!(outgoing.client_id, temp_id),
        other => panic!("Expected send_message, got {:?}", other),
    }

    second.push(new_message_event("800", SELF_ID, "42", Some(&temp_id)));
    let controller = h.controller.clone();
    eventually(|| {
        controller
            .timeline("42")
            .map(|t| t.len() == 1 && t.messages()[0].delivery_status == DeliveryStatus::Sent)
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn test_block_notice_without_client_id_fails_the_send() {
    let mut h = harness();
    let mut server = h.connect().await;
    h.controller.open("42").await.unwrap();
    server.next_event().await;
    let mut dispatched = h.dispatched();

    h.controller.submit("something rude").unwrap();
    server.next_event().await;
    server.push(ServerEvent::MessageBlocked {
        message: "Message contains inappropriate content".to_string(),
        reason: Some("profanity".to_string()),
        client_id: None,
    });
    within(dispatched.recv()).await;

    let timeline = h.controller.timeline("42").unwrap();
    assert_eq!(timeline.messages()[0].delivery_status, DeliveryStatus::Failed);
}
