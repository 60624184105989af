//! # Chat Messages
//!
//! This module defines the [`Message`] record exchanged between peers and its
//! canonical signed form.
//!
//! ## Message Kinds
//!
//! | Kind | Addressed to | Delivery path |
//! |------|--------------|---------------|
//! | `Direct` | one recipient `PeerId` | directory → recipient inbox, else mailbox |
//! | `Group` | a topic | bounded-fanout gossip among topic subscribers |
//!
//! ## Message IDs
//!
//! A [`MessageId`] is 32 bytes, computed once at construction as
//! `blake3(domain || sender || nonce || timestamp)` with a random 16-byte nonce.
//! It is unique in practice and never recomputed after construction.
//!
//! ## Signed Payload
//!
//! The canonical payload joins, in order: id, sender, recipient-or-empty,
//! topic-or-empty, timestamp, content. Variable-length fields are
//! length-prefixed so that no two field assignments produce the same bytes.
//!
//! Signed fields have no setters. A message is signed in its constructor and
//! stays write-once from then on; [`Message::from_parts`] exists only to
//! rebuild a message that arrived from elsewhere.
//!
//! ## Wire Form
//!
//! Messages serialize with bincode. Decoding always goes through
//! [`deserialize_bounded`] so oversized input cannot exhaust memory.

use bincode::Options;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::crypto;
use crate::identity::{Keypair, PeerId, now_ms};

/// Maximum content size of a single message (64 KiB).
/// SECURITY: Prevents memory exhaustion from large messages.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Maximum buffer size for deserialization.
/// Content limit plus room for ids, peer names, topic and signature.
pub const MAX_WIRE_MESSAGE_SIZE: u64 = (MAX_MESSAGE_SIZE as u64) + 4096;

/// Domain separation prefix for message id hashing.
const MESSAGE_ID_DOMAIN: &[u8] = b"peerchat-msgid-v1:";

/// Returns bincode options with size limits enforced.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_WIRE_MESSAGE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
/// SECURITY: Use this instead of raw bincode::deserialize.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Serialize with the same options `deserialize_bounded` expects.
pub fn serialize_bounded<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

// ============================================================================
// Message ID
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId([u8; 32]);

impl MessageId {
    fn generate(sender: &PeerId, timestamp: u64) -> Self {
        let nonce: [u8; 16] = rand::random();
        let mut hasher = blake3::Hasher::new();
        hasher.update(MESSAGE_ID_DOMAIN);
        hasher.update(&(sender.as_bytes().len() as u32).to_le_bytes());
        hasher.update(sender.as_bytes());
        hasher.update(&nonce);
        hasher.update(&timestamp.to_le_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// First 8 bytes in hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl std::fmt::Debug for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageId({})", self.short())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

// ============================================================================
// Message
// ============================================================================

/// Addressing of a message. Exactly one of recipient or topic exists.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Direct { recipient: PeerId },
    Group { topic: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    sender: PeerId,
    kind: MessageKind,
    timestamp: u64,
    content: String,
    signature: String,
}

impl Message {
    /// Build and sign a direct message from `sender` to `recipient`.
    pub fn direct(
        keypair: &Keypair,
        sender: PeerId,
        recipient: PeerId,
        content: impl Into<String>,
    ) -> Self {
        Self::signed(keypair, sender, MessageKind::Direct { recipient }, content.into())
    }

    /// Build and sign a group message from `sender` on `topic`.
    pub fn group(
        keypair: &Keypair,
        sender: PeerId,
        topic: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::signed(
            keypair,
            sender,
            MessageKind::Group { topic: topic.into() },
            content.into(),
        )
    }

    fn signed(keypair: &Keypair, sender: PeerId, kind: MessageKind, content: String) -> Self {
        let timestamp = now_ms();
        let id = MessageId::generate(&sender, timestamp);
        let mut message = Self {
            id,
            sender,
            kind,
            timestamp,
            content,
            signature: String::new(),
        };
        message.signature = crypto::sign_payload(keypair, &message.signed_payload());
        message
    }

    /// Rebuild a message from its fields, e.g. after receiving it from a
    /// transport. The signature is taken as-is and checked on acceptance.
    pub fn from_parts(
        id: MessageId,
        sender: PeerId,
        kind: MessageKind,
        timestamp: u64,
        content: impl Into<String>,
        signature: impl Into<String>,
    ) -> Self {
        Self {
            id,
            sender,
            kind,
            timestamp,
            content: content.into(),
            signature: signature.into(),
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn sender(&self) -> &PeerId {
        &self.sender
    }

    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn recipient(&self) -> Option<&PeerId> {
        match &self.kind {
            MessageKind::Direct { recipient } => Some(recipient),
            MessageKind::Group { .. } => None,
        }
    }

    pub fn topic(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::Direct { .. } => None,
            MessageKind::Group { topic } => Some(topic),
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self.kind, MessageKind::Direct { .. })
    }

    /// Build the canonical bytes covered by the signature.
    ///
    /// Format: id(32) || sender || recipient || topic || timestamp(8) || content,
    /// where every variable-length field is `len(4, LE) || bytes` and an absent
    /// recipient/topic is encoded as the empty string.
    pub fn signed_payload(&self) -> Vec<u8> {
        let recipient = self.recipient().map(PeerId::as_bytes).unwrap_or_default();
        let topic = self.topic().map(str::as_bytes).unwrap_or_default();
        let sender = self.sender.as_bytes();
        let content = self.content.as_bytes();

        let mut payload = Vec::with_capacity(
            32 + 8 + 4 * 4 + sender.len() + recipient.len() + topic.len() + content.len(),
        );
        payload.extend_from_slice(self.id.as_bytes());
        for field in [sender, recipient, topic] {
            payload.extend_from_slice(&(field.len() as u32).to_le_bytes());
            payload.extend_from_slice(field);
        }
        payload.extend_from_slice(&self.timestamp.to_le_bytes());
        payload.extend_from_slice(&(content.len() as u32).to_le_bytes());
        payload.extend_from_slice(content);
        payload
    }

    /// Check the signature against `public_key`.
    pub fn verify(&self, public_key: &VerifyingKey) -> bool {
        crypto::verify_payload(&self.signed_payload(), &self.signature, public_key)
    }
}
