//! Integration tests for the public Peer API.
//!
//! These tests drive peers through start/stop, direct messaging, mailboxes
//! and the signature gate, using only what the crate exports.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use peerchat::{
    Acceptance, Directory, DirectoryConfig, Message, MessageKind, MessageSink, Peer, PeerConfig,
    PeerError, PeerId, RateLimit,
};
use tokio::sync::Mutex;
use tokio::time::timeout;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Helper Functions
// =============================================================================

fn directory() -> Arc<Directory> {
    Arc::new(Directory::new(DirectoryConfig {
        rng_seed: Some(2024),
        ..DirectoryConfig::default()
    }))
}

async fn settle(directory: &Directory) {
    timeout(SETTLE_TIMEOUT, directory.settle())
        .await
        .expect("cluster did not settle");
}

async fn started(id: &str, directory: &Arc<Directory>, bootstrap: &[&str]) -> Peer {
    let peer = Peer::new(id, directory.clone());
    let bootstrap: Vec<PeerId> = bootstrap.iter().map(|b| PeerId::from(*b)).collect();
    peer.start(&bootstrap).await.expect("start failed");
    peer
}

#[derive(Default)]
struct RecordingSink {
    received: Mutex<Vec<Message>>,
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn on_direct(&self, message: &Message) {
        self.received.lock().await.push(message.clone());
    }

    async fn on_group(&self, message: &Message) {
        self.received.lock().await.push(message.clone());
    }
}

/// Sink whose direct handler always panics.
struct FaultySink;

#[async_trait]
impl MessageSink for FaultySink {
    async fn on_direct(&self, _message: &Message) {
        panic!("sink exploded");
    }

    async fn on_group(&self, _message: &Message) {}
}

fn tamper_signature(message: &Message) -> Message {
    let mut signature = message.signature().to_string();
    let flipped = if signature.starts_with('0') { "1" } else { "0" };
    signature.replace_range(0..1, flipped);
    Message::from_parts(
        message.id(),
        message.sender().clone(),
        message.kind().clone(),
        message.timestamp(),
        message.content(),
        signature,
    )
}

// =============================================================================
// Test: direct delivery
// =============================================================================

#[tokio::test]
async fn direct_ping_reaches_recipient_once() {
    let dir = directory();
    let alpha = started("alpha", &dir, &[]).await;
    alpha.subscribe("crew-room").await;
    let bravo = started("bravo", &dir, &["alpha"]).await;
    bravo.subscribe("crew-room").await;

    let msg_id = alpha
        .send_direct_message(bravo.peer_id(), "ping")
        .await
        .expect("send failed");
    settle(&dir).await;

    let log = bravo.message_log_snapshot().await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].id(), msg_id);
    assert_eq!(log[0].content(), "ping");
    assert_eq!(log[0].sender(), alpha.peer_id());
    assert_eq!(log[0].recipient(), Some(bravo.peer_id()));

    // The sender keeps everything it sent.
    assert!(alpha.has_message(&msg_id).await);
    assert_eq!(bravo.stats().accepted, 1);
}

#[tokio::test]
async fn bootstrap_connects_symmetrically() {
    let dir = directory();
    let alpha = started("alpha", &dir, &[]).await;
    let bravo = started("bravo", &dir, &["alpha", "bravo", "nobody"]).await;

    assert_eq!(bravo.connected_peers().await, vec![PeerId::from("alpha")]);
    assert_eq!(alpha.connected_peers().await, vec![PeerId::from("bravo")]);
}

#[tokio::test]
async fn sink_sees_each_accepted_message() {
    let dir = directory();
    let alpha = started("alpha", &dir, &[]).await;
    let sink = Arc::new(RecordingSink::default());
    let bravo = Peer::with_options("bravo", dir.clone(), PeerConfig::default(), sink.clone());
    bravo.start(&[]).await.expect("start failed");
    bravo.subscribe("crew-room").await;

    alpha
        .send_direct_message(bravo.peer_id(), "ping")
        .await
        .expect("send failed");
    alpha
        .publish_to_topic("crew-room", "hello")
        .await
        .expect("publish failed");
    settle(&dir).await;

    let received = sink.received.lock().await;
    assert_eq!(received.len(), 2);
    let direct = received.iter().filter(|m| m.recipient().is_some()).count();
    assert_eq!(direct, 1);
}

#[tokio::test]
async fn panicking_sink_does_not_stall_the_cluster() {
    let dir = directory();
    let alpha = started("alpha", &dir, &[]).await;
    let bravo = Peer::with_options(
        "bravo",
        dir.clone(),
        PeerConfig::default(),
        Arc::new(FaultySink),
    );
    bravo.start(&[]).await.expect("start failed");

    for text in ["first", "second"] {
        alpha
            .send_direct_message(bravo.peer_id(), text)
            .await
            .expect("send failed");
    }
    settle(&dir).await;

    assert_eq!(dir.pending_deliveries(), 0);
    assert!(bravo.is_running().await);
    assert_eq!(bravo.message_log_snapshot().await.len(), 2);
    assert_eq!(bravo.stats().accepted, 2);
}

// =============================================================================
// Test: offline mailbox
// =============================================================================

#[tokio::test]
async fn mailbox_is_drained_on_start() {
    let dir = directory();
    let alpha = started("alpha", &dir, &[]).await;
    let bravo = Peer::new("bravo", dir.clone());

    let msg_id = alpha
        .send_direct_message(bravo.peer_id(), "are you there?")
        .await
        .expect("send failed");
    assert_eq!(dir.mailbox_len(bravo.peer_id()).await, 1);

    bravo.start(&[]).await.expect("start failed");

    // Drain happens inside start.
    assert!(bravo.has_message(&msg_id).await);
    assert_eq!(dir.mailbox_len(bravo.peer_id()).await, 0);
}

#[tokio::test]
async fn message_to_stopped_peer_goes_to_mailbox() {
    let dir = directory();
    let alpha = started("alpha", &dir, &[]).await;
    let bravo = started("bravo", &dir, &[]).await;
    bravo.stop().await;

    alpha
        .send_direct_message(bravo.peer_id(), "while you were out")
        .await
        .expect("send failed");
    settle(&dir).await;
    assert!(bravo.message_log_snapshot().await.is_empty());
    assert_eq!(dir.mailbox_len(bravo.peer_id()).await, 1);

    bravo.start(&[]).await.expect("restart failed");
    assert_eq!(bravo.message_log_snapshot().await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sends_racing_a_start_are_never_stranded() {
    const SENDS: usize = 200;

    for _ in 0..10 {
        let dir = directory();
        let alpha = started("alpha", &dir, &[]).await;
        let bravo = Peer::new("bravo", dir.clone());

        let sender = {
            let alpha = alpha.clone();
            let target = bravo.peer_id().clone();
            tokio::spawn(async move {
                for i in 0..SENDS {
                    alpha
                        .send_direct_message(&target, &format!("msg {}", i))
                        .await
                        .expect("send failed");
                    tokio::task::yield_now().await;
                }
            })
        };
        bravo.start(&[]).await.expect("start failed");
        sender.await.expect("sender task");
        settle(&dir).await;

        assert_eq!(dir.mailbox_len(bravo.peer_id()).await, 0);
        assert_eq!(bravo.message_log_snapshot().await.len(), SENDS);
    }
}

// =============================================================================
// Test: authenticity gate
// =============================================================================

#[tokio::test]
async fn tampered_signature_is_never_logged() {
    let dir = directory();
    let alpha = started("alpha", &dir, &[]).await;
    let bravo = started("bravo", &dir, &[]).await;

    // Address a real message to an offline id so it is signed but not delivered.
    alpha
        .send_direct_message(&"charlie".into(), "secret")
        .await
        .expect("send failed");
    let original = alpha.message_log_snapshot().await.remove(0);

    let redirected = Message::from_parts(
        original.id(),
        original.sender().clone(),
        MessageKind::Direct {
            recipient: bravo.peer_id().clone(),
        },
        original.timestamp(),
        original.content(),
        original.signature(),
    );
    assert_eq!(
        bravo.receive_direct_message(tamper_signature(&original)).await,
        Acceptance::Rejected
    );
    assert_eq!(
        bravo.receive_direct_message(redirected).await,
        Acceptance::Rejected
    );
    assert!(bravo.message_log_snapshot().await.is_empty());
    assert_eq!(bravo.stats().rejected, 2);
}

#[tokio::test]
async fn old_session_signature_is_rejected_after_restart() {
    let dir = directory();
    let alpha = started("alpha", &dir, &[]).await;
    let bravo = started("bravo", &dir, &[]).await;

    alpha
        .send_direct_message(&"charlie".into(), "old key")
        .await
        .expect("send failed");
    let stale = alpha.message_log_snapshot().await.remove(0);

    alpha.stop().await;
    alpha.start(&[]).await.expect("restart failed");

    assert_eq!(
        bravo.receive_direct_message(stale).await,
        Acceptance::Rejected
    );
}

// =============================================================================
// Test: lifecycle and errors
// =============================================================================

#[tokio::test]
async fn not_running_peer_refuses_to_send() {
    let dir = directory();
    let alpha = Peer::new("alpha", dir.clone());

    let err = alpha
        .send_direct_message(&"bravo".into(), "hi")
        .await
        .expect_err("should fail");
    assert_eq!(err, PeerError::NotRunning("alpha".into()));
    assert!(matches!(
        alpha.publish_to_topic("crew-room", "hi").await,
        Err(PeerError::NotRunning(_))
    ));
    assert!(alpha.message_log_snapshot().await.is_empty());
}

#[tokio::test]
async fn duplicate_id_is_refused_until_stop() {
    let dir = directory();
    let first = started("alpha", &dir, &[]).await;
    let impostor = Peer::new("alpha", dir.clone());

    assert_eq!(
        impostor.start(&[]).await,
        Err(PeerError::PeerIdInUse("alpha".into()))
    );
    assert_eq!(
        dir.public_key(first.peer_id()).await,
        first.public_key().await
    );

    first.stop().await;
    impostor.start(&[]).await.expect("id should be free");
    assert_eq!(
        dir.public_key(impostor.peer_id()).await,
        impostor.public_key().await
    );
}

#[tokio::test]
async fn start_twice_and_stop_twice_are_harmless() {
    let dir = directory();
    let alpha = started("alpha", &dir, &[]).await;
    alpha.start(&[]).await.expect("second start");
    assert!(alpha.is_running().await);

    alpha.stop().await;
    alpha.stop().await;
    assert!(!alpha.is_running().await);
    assert!(!dir.is_registered(alpha.peer_id()).await);
}

#[tokio::test]
async fn rate_limited_peer_reports_error() {
    let dir = directory();
    let config = PeerConfig {
        send_rate_limit: Some(RateLimit {
            max_messages: 3,
            window: Duration::from_secs(60),
        }),
        ..PeerConfig::default()
    };
    let alpha = Peer::with_options("alpha", dir.clone(), config, Arc::new(peerchat::LogSink));
    alpha.start(&[]).await.expect("start failed");

    for i in 0..3 {
        alpha
            .send_direct_message(&"bravo".into(), &format!("msg {}", i))
            .await
            .expect("within limit");
    }
    assert_eq!(
        alpha.send_direct_message(&"bravo".into(), "one too many").await,
        Err(PeerError::RateLimited)
    );
    assert_eq!(dir.mailbox_len(&"bravo".into()).await, 3);
}

#[tokio::test]
async fn separate_directories_are_isolated() {
    let east = directory();
    let west = directory();
    let alpha = started("alpha", &east, &[]).await;
    let bravo = started("bravo", &west, &[]).await;
    let alpha_west = started("alpha", &west, &[]).await;

    alpha
        .send_direct_message(bravo.peer_id(), "across the fence")
        .await
        .expect("send failed");
    settle(&east).await;
    settle(&west).await;

    assert!(bravo.message_log_snapshot().await.is_empty());
    assert_eq!(east.mailbox_len(bravo.peer_id()).await, 1);
    assert!(alpha_west.is_running().await);
}
