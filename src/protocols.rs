//! Chat protocol handler and application sink.
//!
//! Accepted messages leave the peer layer through [`ChatProtocol`], which
//! routes them by kind to an application-supplied [`MessageSink`].
//!
//! | Kind | Sink method | Default behaviour ([`LogSink`]) |
//! |------|-------------|----------------------------------|
//! | Direct | [`MessageSink::on_direct`] | `info!` with sender and recipient |
//! | Group | [`MessageSink::on_group`] | `info!` with sender and topic |
//!
//! The handler also owns the wire codec for messages. In-process delivery
//! moves [`Message`] values directly and never encodes them.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{info, warn};

use crate::messages::{self, Message, MessageKind};

/// Stable protocol identifier. Descriptive only.
pub const PROTOCOL_ID: &str = "/peerchat/1.0.0";

/// Application-side consumer of accepted messages.
///
/// Called from the receiving peer's inbound task, after verification and
/// deduplication. Implementations should not block for long; the peer's
/// queue is drained one message at a time.
#[async_trait]
pub trait MessageSink: Send + Sync + 'static {
    /// A direct message addressed to the local peer was accepted.
    async fn on_direct(&self, message: &Message);

    /// A group message on a subscribed topic was accepted.
    async fn on_group(&self, message: &Message);
}

/// Sink that records accepted messages as structured log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl MessageSink for LogSink {
    async fn on_direct(&self, message: &Message) {
        info!(
            protocol = PROTOCOL_ID,
            msg_id = %message.id().short(),
            from = %message.sender(),
            to = %message.recipient().map(|r| r.as_str()).unwrap_or_default(),
            content = message.content(),
            "direct message"
        );
    }

    async fn on_group(&self, message: &Message) {
        info!(
            protocol = PROTOCOL_ID,
            msg_id = %message.id().short(),
            from = %message.sender(),
            topic = message.topic().unwrap_or_default(),
            content = message.content(),
            "group message"
        );
    }
}

#[derive(Clone)]
pub struct ChatProtocol {
    sink: Arc<dyn MessageSink>,
}

impl ChatProtocol {
    pub fn new(sink: Arc<dyn MessageSink>) -> Self {
        Self { sink }
    }

    pub fn protocol_id(&self) -> &'static str {
        PROTOCOL_ID
    }

    /// Dispatch an accepted message to the sink by kind.
    ///
    /// A panicking sink is contained here and logged; the message stays
    /// accepted. Returns `false` if the sink panicked.
    pub async fn handle_incoming(&self, message: &Message) -> bool {
        let dispatch = async {
            match message.kind() {
                MessageKind::Direct { .. } => self.sink.on_direct(message).await,
                MessageKind::Group { .. } => self.sink.on_group(message).await,
            }
        };

        match AssertUnwindSafe(dispatch).catch_unwind().await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    protocol = PROTOCOL_ID,
                    msg_id = %message.id().short(),
                    from = %message.sender(),
                    "message sink panicked"
                );
                false
            }
        }
    }

    pub fn serialize_message(&self, message: &Message) -> Result<Vec<u8>, bincode::Error> {
        messages::serialize_bounded(message)
    }

    /// Decode a message from wire bytes.
    /// SECURITY: Bounded by `MAX_WIRE_MESSAGE_SIZE`; the signature is not
    /// checked here.
    pub fn deserialize_message(&self, bytes: &[u8]) -> Result<Message, bincode::Error> {
        messages::deserialize_bounded(bytes)
    }
}

impl Default for ChatProtocol {
    fn default() -> Self {
        Self::new(Arc::new(LogSink))
    }
}

impl std::fmt::Debug for ChatProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatProtocol")
            .field("protocol_id", &PROTOCOL_ID)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        direct: Mutex<Vec<Message>>,
        group: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn on_direct(&self, message: &Message) {
            self.direct.lock().await.push(message.clone());
        }

        async fn on_group(&self, message: &Message) {
            self.group.lock().await.push(message.clone());
        }
    }

    #[tokio::test]
    async fn dispatches_by_kind() {
        let sink = Arc::new(RecordingSink::default());
        let protocol = ChatProtocol::new(sink.clone());
        let kp = Keypair::from_secret_key_bytes(&[1u8; 32]);

        let direct = Message::direct(&kp, "alpha".into(), "bravo".into(), "ping");
        let group = Message::group(&kp, "alpha".into(), "crew-room", "hello");
        assert!(protocol.handle_incoming(&direct).await);
        assert!(protocol.handle_incoming(&group).await);

        assert_eq!(*sink.direct.lock().await, vec![direct]);
        assert_eq!(*sink.group.lock().await, vec![group]);
    }

    struct PanickingSink;

    #[async_trait]
    impl MessageSink for PanickingSink {
        async fn on_direct(&self, _message: &Message) {
            panic!("sink failure");
        }

        async fn on_group(&self, _message: &Message) {}
    }

    #[tokio::test]
    async fn sink_panic_is_contained() {
        let protocol = ChatProtocol::new(Arc::new(PanickingSink));
        let kp = Keypair::from_secret_key_bytes(&[4u8; 32]);

        let direct = Message::direct(&kp, "alpha".into(), "bravo".into(), "boom");
        let group = Message::group(&kp, "alpha".into(), "t", "fine");
        assert!(!protocol.handle_incoming(&direct).await);
        assert!(protocol.handle_incoming(&group).await);
    }

    #[tokio::test]
    async fn log_sink_accepts_both_kinds() {
        let protocol = ChatProtocol::default();
        let kp = Keypair::from_secret_key_bytes(&[2u8; 32]);
        assert!(
            protocol
                .handle_incoming(&Message::direct(&kp, "a".into(), "b".into(), "x"))
                .await
        );
        assert!(
            protocol
                .handle_incoming(&Message::group(&kp, "a".into(), "t", "y"))
                .await
        );
    }

    #[test]
    fn codec_round_trip_and_rejects_garbage() {
        let protocol = ChatProtocol::default();
        let kp = Keypair::from_secret_key_bytes(&[3u8; 32]);
        let message = Message::direct(&kp, "alpha".into(), "bravo".into(), "ping");

        let bytes = protocol.serialize_message(&message).expect("serialize");
        let decoded = protocol.deserialize_message(&bytes).expect("deserialize");
        assert_eq!(decoded, message);
        assert!(decoded.verify(&kp.verifying_key()));

        assert!(protocol.deserialize_message(&bytes[..bytes.len() / 2]).is_err());
        assert!(protocol.deserialize_message(&[]).is_err());
    }

    #[test]
    fn protocol_id_is_stable() {
        assert_eq!(ChatProtocol::default().protocol_id(), "/peerchat/1.0.0");
    }
}
