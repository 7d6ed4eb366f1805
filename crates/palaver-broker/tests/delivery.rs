//! End-to-end delivery scenarios against the standalone broker.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

use palaver_broker::{
    Broker, ClientRegistry, ConnectionEndpoint, Router, StandaloneBroker,
};
use palaver_broker::standalone::StandaloneConfig;
use palaver_cache::{CacheBackend, ConversationCache, MemoryBackend, TaskPool};
use palaver_shared::ids::{ConversationKey, GroupId, MessageIdGen, Recipient, UserId};
use palaver_shared::message::{DeliveryStatus, MessageKind, SignalKind};
use palaver_shared::wire::{
    ClientFrame, DeliveryEnvelope, DeliveryPayload, InboundFrame, SendRequest, ServerFrame,
};
use palaver_store::{MemoryRepository, Repository};

struct Harness {
    broker: Arc<StandaloneBroker>,
    registry: Arc<ClientRegistry>,
    repository: Arc<MemoryRepository>,
    backend: Arc<MemoryBackend>,
}

impl Harness {
    async fn start() -> Self {
        let registry = Arc::new(ClientRegistry::new());
        let repository = Arc::new(MemoryRepository::new());
        let backend = Arc::new(MemoryBackend::new());
        let pool = Arc::new(TaskPool::new(2, 32));
        let cache = Arc::new(ConversationCache::new(
            backend.clone(),
            pool,
            10,
            Duration::from_secs(60),
        ));
        let router = Arc::new(Router::new(
            repository.clone() as Arc<dyn Repository>,
            cache,
            registry.clone(),
            MessageIdGen::new(0).unwrap(),
        ));
        let broker = StandaloneBroker::new(router, registry.clone(), StandaloneConfig::default());
        broker.start().await.unwrap();
        Self {
            broker,
            registry,
            repository,
            backend,
        }
    }

    /// Register a user and wait until the coordinating loop has applied
    /// the login event.
    async fn connect(&self, user: &str) -> (palaver_broker::ClientHandle, mpsc::Receiver<DeliveryEnvelope>) {
        let user_id = UserId::parse(user).unwrap();
        let endpoint = ConnectionEndpoint::new(user_id.clone(), 32);
        let (handle, rx) = endpoint.into_parts();
        self.broker.register_client(handle.clone()).await.unwrap();
        timeout(Duration::from_secs(1), async {
            while self.broker.get_client(&user_id).map(|h| h.session()) != Some(handle.session()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("login should land");
        (handle, rx)
    }

    async fn send(&self, sender: &str, request: SendRequest) {
        let frame = InboundFrame {
            sender_id: UserId::parse(sender).unwrap(),
            request,
        };
        self.broker.publish(frame.to_bytes().unwrap()).await.unwrap();
    }
}

fn text_request(recipient: &str, content: &str) -> SendRequest {
    SendRequest {
        recipient: Recipient::parse(recipient).unwrap(),
        kind: MessageKind::Text,
        content: content.into(),
        sender_display_name: Some("Sender".into()),
        sender_avatar: None,
        attachment_ref: None,
        attachment_meta: None,
        signal: None,
        signal_payload: None,
    }
}

fn signal_request(recipient: &str, signal: SignalKind) -> SendRequest {
    SendRequest {
        recipient: Recipient::parse(recipient).unwrap(),
        kind: MessageKind::AudioVideo,
        content: String::new(),
        sender_display_name: None,
        sender_avatar: None,
        attachment_ref: None,
        attachment_meta: None,
        signal: Some(signal),
        signal_payload: Some("{\"sdp\":\"...\"}".into()),
    }
}

async fn recv_delivery(rx: &mut mpsc::Receiver<DeliveryEnvelope>) -> (ServerFrame, DeliveryEnvelope) {
    let envelope = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("envelope should arrive")
        .expect("queue open");
    let frame = ServerFrame::from_bytes(&envelope.payload).unwrap();
    (frame, envelope)
}

fn assert_no_more(rx: &mut mpsc::Receiver<DeliveryEnvelope>) {
    assert!(
        rx.try_recv().is_err(),
        "expected no further envelope on this queue"
    );
}

#[tokio::test]
async fn private_text_echo_and_delivery() {
    let harness = Harness::start().await;
    let (_alice, mut alice_rx) = harness.connect("Ualice").await;
    let (_bob, mut bob_rx) = harness.connect("Ubob").await;

    harness.send("Ualice", text_request("Ubob", "hello bob")).await;

    let (alice_frame, alice_envelope) = recv_delivery(&mut alice_rx).await;
    let (bob_frame, bob_envelope) = recv_delivery(&mut bob_rx).await;

    let message = match bob_frame {
        ServerFrame::Delivery(DeliveryPayload::Private { message, conversation }) => {
            assert_eq!(
                conversation,
                ConversationKey::direct(
                    &UserId::parse("Ualice").unwrap(),
                    &UserId::parse("Ubob").unwrap()
                )
            );
            message
        }
        other => panic!("expected private delivery, got {other:?}"),
    };
    assert_eq!(message.content, "hello bob");
    assert_eq!(message.status, DeliveryStatus::Unsent);

    // Both envelopes reference the same persisted message id.
    assert_eq!(alice_envelope.message_id, Some(message.id));
    assert_eq!(bob_envelope.message_id, Some(message.id));
    match alice_frame {
        ServerFrame::Delivery(DeliveryPayload::Private { message: echo, .. }) => {
            assert_eq!(echo.id, message.id);
        }
        other => panic!("expected private echo, got {other:?}"),
    }

    assert_eq!(harness.repository.message_count().await, 1);
}

#[tokio::test]
async fn offline_recipient_is_skipped_but_persisted() {
    let harness = Harness::start().await;
    let (_alice, mut alice_rx) = harness.connect("Ualice").await;

    harness.send("Ualice", text_request("Ubob", "anyone home?")).await;

    // Sender still gets the echo; the offline peer gets nothing, and the
    // message is only retrievable from history.
    let (_, envelope) = recv_delivery(&mut alice_rx).await;
    assert!(envelope.message_id.is_some());
    assert_eq!(harness.repository.message_count().await, 1);
}

#[tokio::test]
async fn group_fan_out_exactly_once_with_sender_echo() {
    let harness = Harness::start().await;
    let group = GroupId::parse("Gteam").unwrap();
    let members = vec![
        UserId::parse("Uone").unwrap(),
        UserId::parse("Utwo").unwrap(),
        UserId::parse("Uthree").unwrap(),
    ];
    harness.repository.put_group(group.clone(), members).await;

    let (_u1, mut u1_rx) = harness.connect("Uone").await;
    let (_u2, mut u2_rx) = harness.connect("Utwo").await;
    let (_u3, mut u3_rx) = harness.connect("Uthree").await;

    harness.send("Uone", text_request("Gteam", "standup time")).await;

    let (u2_frame, _) = recv_delivery(&mut u2_rx).await;
    let (u3_frame, _) = recv_delivery(&mut u3_rx).await;
    let (echo_frame, _) = recv_delivery(&mut u1_rx).await;

    for frame in [&u2_frame, &u3_frame, &echo_frame] {
        match frame {
            ServerFrame::Delivery(DeliveryPayload::Group { group_id, message }) => {
                assert_eq!(group_id, &group);
                assert_eq!(message.content, "standup time");
            }
            other => panic!("expected group delivery, got {other:?}"),
        }
    }

    // Exactly one envelope each, the sender included.
    assert_no_more(&mut u1_rx);
    assert_no_more(&mut u2_rx);
    assert_no_more(&mut u3_rx);

    // The group's rolling list gains exactly one entry.
    let tail_key = format!("conv:{}", ConversationKey::group(&group).as_str());
    let tail = timeout(Duration::from_secs(1), async {
        loop {
            if let Ok(Some(raw)) = harness.backend.get(&tail_key).await {
                return raw;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("cache append should land");
    let entries: Vec<serde_json::Value> = serde_json::from_str(&tail).unwrap();
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
async fn group_member_not_connected_is_skipped() {
    let harness = Harness::start().await;
    let group = GroupId::parse("Gteam").unwrap();
    harness
        .repository
        .put_group(
            group.clone(),
            vec![
                UserId::parse("Uone").unwrap(),
                UserId::parse("Uoffline").unwrap(),
            ],
        )
        .await;

    let (_u1, mut u1_rx) = harness.connect("Uone").await;
    harness.send("Uone", text_request("Gteam", "ping")).await;

    let (_, envelope) = recv_delivery(&mut u1_rx).await;
    assert!(envelope.message_id.is_some());
    assert_no_more(&mut u1_rx);
    assert_eq!(harness.repository.message_count().await, 1);
}

#[tokio::test]
async fn signal_allow_list_controls_persistence() {
    let harness = Harness::start().await;
    let (_u1, mut u1_rx) = harness.connect("Uone").await;
    let (_u2, mut u2_rx) = harness.connect("Utwo").await;

    // call_start persists exactly one message.
    harness
        .send("Uone", signal_request("Utwo", SignalKind::CallStart))
        .await;
    let (_, start_envelope) = recv_delivery(&mut u2_rx).await;
    assert!(start_envelope.message_id.is_some());
    let _ = recv_delivery(&mut u1_rx).await;
    assert_eq!(harness.repository.message_count().await, 1);

    // ice_candidate persists nothing but is still delivered live.
    harness
        .send("Uone", signal_request("Utwo", SignalKind::IceCandidate))
        .await;
    let (frame, ice_envelope) = recv_delivery(&mut u2_rx).await;
    assert!(ice_envelope.message_id.is_none());
    match frame {
        ServerFrame::Delivery(DeliveryPayload::Private { message, .. }) => {
            assert_eq!(message.signal, Some(SignalKind::IceCandidate));
        }
        other => panic!("expected private delivery, got {other:?}"),
    }
    assert_eq!(harness.repository.message_count().await, 1);
}

#[tokio::test]
async fn register_then_unregister_leaves_no_entries() {
    let harness = Harness::start().await;
    let (handle, _rx) = harness.connect("Ualice").await;

    harness.broker.unregister_client(handle.clone()).await.unwrap();
    timeout(Duration::from_secs(1), async {
        while !harness.registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("logout should land");
    assert!(handle.is_closed());
}

#[tokio::test]
async fn double_login_displaces_older_session() {
    let harness = Harness::start().await;
    let (old, _old_rx) = harness.connect("Ualice").await;
    let (new, mut new_rx) = harness.connect("Ualice").await;

    timeout(Duration::from_secs(1), old.closed())
        .await
        .expect("older session should be torn down");
    assert!(!new.is_closed());

    // Deliveries reach only the surviving session.
    harness.send("Ualice", text_request("Ualice", "note to self")).await;
    let (_, envelope) = recv_delivery(&mut new_rx).await;
    assert!(envelope.message_id.is_some());
    assert_no_more(&mut new_rx);
}

#[tokio::test]
async fn fresh_broker_unaffected_by_closed_predecessor() {
    let first = Harness::start().await;
    let (_alice, _rx) = first.connect("Ualice").await;
    first.broker.close().await;
    assert!(first.registry.is_empty());

    // A new instance starts clean and serves traffic.
    let second = Harness::start().await;
    let (_alice, mut alice_rx) = second.connect("Ualice").await;
    second.send("Ualice", text_request("Ualice", "hello again")).await;
    let (_, envelope) = recv_delivery(&mut alice_rx).await;
    assert!(envelope.message_id.is_some());
    second.broker.close().await;

    // The first broker stays closed.
    assert!(matches!(
        first.broker.publish(Bytes::from_static(b"{}")).await,
        Err(palaver_broker::BrokerError::Closed)
    ));
}

#[tokio::test]
async fn avatar_ref_normalized_before_persist() {
    let harness = Harness::start().await;
    let (_alice, mut alice_rx) = harness.connect("Ualice").await;

    let mut request = text_request("Ualice", "check avatar");
    request.sender_avatar = Some("https://cdn.example.com/avatars/alice.png".into());
    harness.send("Ualice", request).await;

    let _ = recv_delivery(&mut alice_rx).await;
    let stored = harness.repository.all_messages().await;
    assert_eq!(stored[0].sender_avatar.as_deref(), Some("avatars/alice.png"));
}

#[tokio::test]
async fn undecodable_publish_is_dropped_not_fatal() {
    let harness = Harness::start().await;
    let (_alice, mut alice_rx) = harness.connect("Ualice").await;

    harness
        .broker
        .publish(Bytes::from_static(b"garbage"))
        .await
        .unwrap();
    harness.send("Ualice", text_request("Ualice", "still alive")).await;

    let (frame, _) = recv_delivery(&mut alice_rx).await;
    assert!(matches!(frame, ServerFrame::Delivery(_)));
}

// Keep the decoded-frame path honest: what an endpoint publishes is what
// the dispatch loop expects.
#[tokio::test]
async fn endpoint_frame_shape_matches_dispatch() {
    let client = ClientFrame::Send(text_request("Ubob", "via endpoint"));
    let bytes = client.to_bytes().unwrap();
    let decoded = ClientFrame::from_bytes(&bytes).unwrap();
    let ClientFrame::Send(request) = decoded else {
        panic!("expected send frame");
    };
    let inbound = InboundFrame {
        sender_id: UserId::parse("Ualice").unwrap(),
        request,
    };
    let raw = inbound.to_bytes().unwrap();
    assert_eq!(InboundFrame::from_bytes(&raw).unwrap(), inbound);
}
