//! # peerchat - In-Process P2P Chat Overlay
//!
//! peerchat simulates a small peer-to-peer messaging network inside one
//! process:
//!
//! - **Identity**: a fresh Ed25519 keypair per peer session; every message is signed
//! - **Direct messages**: point-to-point, with an offline mailbox for absent peers
//! - **Gossip**: topic broadcast with bounded fanout and per-peer deduplication
//! - **History sync**: pull recent messages from neighbors and merge by timestamp
//!
//! ## Architecture
//!
//! Peers share an explicitly constructed [`Directory`], passed in as
//! `Arc<Directory>`. Nothing is global, so independent clusters can run side
//! by side (e.g. one per test).
//!
//! Delivery is message passing. The directory puts each delivery on the
//! recipient's inbound queue and the recipient's own task drains it, so
//! re-gossip never recurses through other peers' call stacks.
//! [`Directory::settle`] waits until the cluster has gone quiet.
//!
//! ## Security Model
//!
//! - The directory's `PeerId` → public key binding is the only trust anchor
//! - Messages are signed over a length-prefixed canonical payload
//! - Forged or unverifiable messages are dropped and counted, never raised as errors
//! - The gossip ledger and outbound rate limiting are bounded
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `peer` | Peer lifecycle, send/publish/receive, history sync |
//! | `directory` | Shared registry, subscriptions, gossip ledger, mailboxes |
//! | `identity` | `PeerId` and Ed25519 keypairs |
//! | `crypto` | Domain-separated signing and verification |
//! | `messages` | `Message` record, canonical payload, bounded wire codec |
//! | `history` | Append-only message log and merge helpers |
//! | `protocols` | Protocol id, handler dispatch, `MessageSink` trait |
//! | `ratelimit` | Sliding-window outbound limit |

mod crypto;
mod directory;
mod history;
mod identity;
mod messages;
mod peer;
mod protocols;
mod ratelimit;

pub use crypto::{SignatureError, sign_payload, verify_payload};
pub use directory::{DEFAULT_MAX_TRACKED_MESSAGES, Directory, DirectoryConfig, Route};
pub use identity::{IdentityError, Keypair, PeerId};
pub use messages::{MAX_MESSAGE_SIZE, MAX_WIRE_MESSAGE_SIZE, Message, MessageId, MessageKind};
pub use peer::{
    Acceptance, DEFAULT_GOSSIP_FANOUT, DEFAULT_MAX_MESSAGE_SIZE, Peer, PeerConfig, PeerError,
    PeerStats,
};
pub use protocols::{ChatProtocol, LogSink, MessageSink, PROTOCOL_ID};
pub use ratelimit::{DEFAULT_RATE_LIMIT_MESSAGES, DEFAULT_RATE_LIMIT_WINDOW, RateLimit};
