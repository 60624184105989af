//! # Peer
//!
//! A [`Peer`] is one simulated chat node. It is a cheap-to-clone handle over
//! shared state; every clone refers to the same node.
//!
//! ## Lifecycle
//!
//! ```ignore
//! let directory = Arc::new(Directory::default());
//! let alpha = Peer::new("alpha", directory.clone());
//! alpha.start(&[]).await?;
//! alpha.subscribe("crew-room").await;
//!
//! let bravo = Peer::new("bravo", directory.clone());
//! bravo.start(&["alpha".into()]).await?;
//!
//! alpha.send_direct_message(&"bravo".into(), "ping").await?;
//! alpha.publish_to_topic("crew-room", "hello").await?;
//! directory.settle().await;
//! ```
//!
//! `start` generates a fresh keypair, registers with the directory, connects
//! to the bootstrap peers and drains the offline mailbox before returning.
//! `stop` unregisters; deliveries already queued are still processed, and the
//! log survives for a later `start`.
//!
//! ## Inbound Path
//!
//! The directory pushes deliveries onto the peer's inbound queue. A task
//! spawned by `start` drains the queue one message at a time:
//!
//! | Kind | Steps |
//! |------|-------|
//! | Direct | verify → append (dedup) → dispatch |
//! | Group | ledger test-and-set → verify → append (dedup) → dispatch → re-gossip |
//!
//! Rejections and duplicates are outcomes ([`Acceptance`]), not errors. They
//! are logged and counted in [`PeerStats`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ed25519_dalek::VerifyingKey;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info, trace, warn};

use crate::directory::Directory;
use crate::history::{self, MessageLog};
use crate::identity::{IdentityError, Keypair, PeerId};
use crate::messages::{MAX_MESSAGE_SIZE, Message, MessageId, MessageKind};
use crate::protocols::{ChatProtocol, LogSink, MessageSink};
use crate::ratelimit::{RateLimit, RateLimiter};

/// Number of subscribers a gossip step forwards to.
pub const DEFAULT_GOSSIP_FANOUT: usize = 3;

/// Largest message body a peer will send, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = MAX_MESSAGE_SIZE;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerConfig {
    /// Subscribers reached per gossip step.
    pub gossip_fanout: usize,
    /// Maximum content size accepted by `send_direct_message`/`publish_to_topic`.
    pub max_message_size: usize,
    /// Re-verify messages imported through history sync.
    pub verify_history: bool,
    /// Outbound send limit. `None` disables limiting.
    pub send_rate_limit: Option<RateLimit>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            gossip_fanout: DEFAULT_GOSSIP_FANOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            verify_history: true,
            send_rate_limit: None,
        }
    }
}

// ============================================================================
// Errors and Outcomes
// ============================================================================

/// Error returned by peer operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// The operation needs a running peer.
    NotRunning(PeerId),
    /// Keypair generation failed during `start`.
    Identity(IdentityError),
    /// Another registered peer already holds this id.
    PeerIdInUse(PeerId),
    /// Topic is empty or whitespace.
    InvalidTopic,
    /// Message content exceeds `PeerConfig::max_message_size`.
    MessageTooLarge { size: usize, max: usize },
    /// Outbound send limit exceeded (per `PeerConfig::send_rate_limit`).
    RateLimited,
}

impl std::fmt::Display for PeerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRunning(id) => write!(f, "peer {} is not running", id),
            Self::Identity(e) => write!(f, "{}", e),
            Self::PeerIdInUse(id) => write!(f, "peer id {} is already registered", id),
            Self::InvalidTopic => write!(f, "topic name is empty"),
            Self::MessageTooLarge { size, max } => {
                write!(f, "message size {} exceeds maximum of {} bytes", size, max)
            }
            Self::RateLimited => write!(f, "send rate limit exceeded"),
        }
    }
}

impl std::error::Error for PeerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Identity(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IdentityError> for PeerError {
    fn from(e: IdentityError) -> Self {
        Self::Identity(e)
    }
}

/// Result of handing one inbound message to a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acceptance {
    /// Verified and appended to the log.
    Accepted,
    /// Already seen; nothing stored or forwarded.
    Duplicate,
    /// Signature did not verify against the directory key, or the sender is
    /// not registered.
    Rejected,
}

/// Snapshot of a peer's inbound counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub accepted: u64,
    pub duplicates: u64,
    pub rejected: u64,
}

#[derive(Default)]
struct StatCounters {
    accepted: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
}

impl StatCounters {
    fn record(&self, outcome: Acceptance) {
        let counter = match outcome {
            Acceptance::Accepted => &self.accepted,
            Acceptance::Duplicate => &self.duplicates,
            Acceptance::Rejected => &self.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PeerStats {
        PeerStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Peer
// ============================================================================

#[derive(Default)]
struct Lifecycle {
    running: bool,
    keypair: Option<Keypair>,
}

struct PeerShared {
    peer_id: PeerId,
    directory: Arc<Directory>,
    config: PeerConfig,
    protocol: ChatProtocol,
    lifecycle: RwLock<Lifecycle>,
    connected_peers: RwLock<BTreeSet<PeerId>>,
    subscriptions: RwLock<BTreeSet<String>>,
    log: RwLock<MessageLog>,
    stats: StatCounters,
    rate_limiter: Option<Mutex<RateLimiter>>,
}

#[derive(Clone)]
pub struct Peer {
    shared: Arc<PeerShared>,
}

impl Peer {
    /// Create an inert peer with default config that logs accepted messages.
    pub fn new(peer_id: impl Into<PeerId>, directory: Arc<Directory>) -> Self {
        Self::with_options(peer_id, directory, PeerConfig::default(), Arc::new(LogSink))
    }

    pub fn with_options(
        peer_id: impl Into<PeerId>,
        directory: Arc<Directory>,
        config: PeerConfig,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        let rate_limiter = config
            .send_rate_limit
            .map(|limit| Mutex::new(RateLimiter::new(limit)));
        Self {
            shared: Arc::new(PeerShared {
                peer_id: peer_id.into(),
                directory,
                config,
                protocol: ChatProtocol::new(sink),
                lifecycle: RwLock::new(Lifecycle::default()),
                connected_peers: RwLock::new(BTreeSet::new()),
                subscriptions: RwLock::new(BTreeSet::new()),
                log: RwLock::new(MessageLog::default()),
                stats: StatCounters::default(),
                rate_limiter,
            }),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.shared.peer_id
    }

    pub fn config(&self) -> &PeerConfig {
        &self.shared.config
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.shared.directory
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Bring the peer online. No-op if already running.
    ///
    /// # Errors
    /// - `Identity` if no keypair could be generated
    /// - `PeerIdInUse` if another running peer holds the same id
    pub async fn start(&self, bootstrap_peers: &[PeerId]) -> Result<(), PeerError> {
        let id = self.peer_id();
        {
            let mut lifecycle = self.shared.lifecycle.write().await;
            if lifecycle.running {
                debug!(peer = %id, "already running");
                return Ok(());
            }

            let keypair = Keypair::generate()?;
            let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
            self.shared
                .directory
                .register(self.clone(), keypair.verifying_key(), inbox_tx)
                .await?;

            lifecycle.running = true;
            lifecycle.keypair = Some(keypair);
            tokio::spawn(run_inbox(self.clone(), inbox_rx));
        }

        for target in bootstrap_peers {
            self.connect_to_peer(target).await;
        }

        let pending = self.shared.directory.drain_offline(id).await;
        let drained = pending.len();
        for message in pending {
            self.receive(message).await;
        }

        info!(
            peer = %id,
            bootstrap = bootstrap_peers.len(),
            drained,
            "peer online"
        );
        Ok(())
    }

    /// Take the peer offline. No-op if not running.
    pub async fn stop(&self) {
        let mut lifecycle = self.shared.lifecycle.write().await;
        if !lifecycle.running {
            return;
        }
        lifecycle.running = false;
        lifecycle.keypair = None;
        self.shared.directory.unregister(self.peer_id()).await;
        let logged = self.shared.log.read().await.len();
        info!(peer = %self.peer_id(), messages = logged, "peer offline");
    }

    pub async fn is_running(&self) -> bool {
        self.shared.lifecycle.read().await.running
    }

    /// Public key of the current session, if running.
    pub async fn public_key(&self) -> Option<VerifyingKey> {
        self.shared
            .lifecycle
            .read()
            .await
            .keypair
            .as_ref()
            .map(Keypair::verifying_key)
    }

    async fn signing_keypair(&self) -> Result<Keypair, PeerError> {
        let lifecycle = self.shared.lifecycle.read().await;
        match (&lifecycle.keypair, lifecycle.running) {
            (Some(keypair), true) => Ok(keypair.clone()),
            _ => Err(PeerError::NotRunning(self.peer_id().clone())),
        }
    }

    // ========================================================================
    // Connections and Subscriptions
    // ========================================================================

    /// Add a symmetric edge to `target`. Silently ignores self and ids the
    /// directory does not know.
    pub async fn connect_to_peer(&self, target: &PeerId) {
        if target == self.peer_id() {
            return;
        }
        let Some(other) = self.shared.directory.find_peer(target).await else {
            trace!(peer = %self.peer_id(), target = %target, "connect to unknown peer ignored");
            return;
        };

        // One set at a time: two peers connecting to each other never hold
        // both locks.
        let added = self
            .shared
            .connected_peers
            .write()
            .await
            .insert(target.clone());
        other
            .shared
            .connected_peers
            .write()
            .await
            .insert(self.peer_id().clone());

        if added {
            debug!(peer = %self.peer_id(), target = %target, "connected");
        }
    }

    /// Join `topic`. Blank topics are ignored.
    pub async fn subscribe(&self, topic: &str) {
        if topic.trim().is_empty() {
            return;
        }
        let added = self
            .shared
            .subscriptions
            .write()
            .await
            .insert(topic.to_string());
        self.shared.directory.subscribe(topic, self.peer_id()).await;
        if added {
            debug!(peer = %self.peer_id(), topic = topic, "subscribed");
        }
    }

    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.shared.connected_peers.read().await.iter().cloned().collect()
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        self.shared.subscriptions.read().await.iter().cloned().collect()
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    async fn check_outbound(&self, content: &str) -> Result<(), PeerError> {
        let max = self.shared.config.max_message_size;
        if content.len() > max {
            return Err(PeerError::MessageTooLarge {
                size: content.len(),
                max,
            });
        }
        if let Some(limiter) = &self.shared.rate_limiter
            && limiter.lock().await.check_and_record()
        {
            warn!(peer = %self.peer_id(), "send rate limit exceeded");
            return Err(PeerError::RateLimited);
        }
        Ok(())
    }

    /// Sign and send a direct message. An offline recipient gets it in its
    /// mailbox.
    ///
    /// # Errors
    /// `NotRunning`, `MessageTooLarge`, `RateLimited`
    pub async fn send_direct_message(
        &self,
        recipient: &PeerId,
        text: &str,
    ) -> Result<MessageId, PeerError> {
        let keypair = self.signing_keypair().await?;
        self.check_outbound(text).await?;

        let message = Message::direct(&keypair, self.peer_id().clone(), recipient.clone(), text);
        let msg_id = message.id();
        self.shared.log.write().await.append(message.clone());

        let route = self.shared.directory.deliver_direct(recipient, message).await;
        debug!(
            peer = %self.peer_id(),
            to = %recipient,
            msg_id = %msg_id.short(),
            ?route,
            "direct message sent"
        );
        Ok(msg_id)
    }

    /// Sign and gossip a group message on `topic`, subscribing first.
    ///
    /// # Errors
    /// `NotRunning`, `InvalidTopic`, `MessageTooLarge`, `RateLimited`
    pub async fn publish_to_topic(&self, topic: &str, text: &str) -> Result<MessageId, PeerError> {
        let keypair = self.signing_keypair().await?;
        if topic.trim().is_empty() {
            return Err(PeerError::InvalidTopic);
        }
        self.check_outbound(text).await?;

        self.subscribe(topic).await;
        let message = Message::group(&keypair, self.peer_id().clone(), topic, text);
        let msg_id = message.id();
        self.shared.log.write().await.append(message.clone());

        let directory = &self.shared.directory;
        directory.mark_delivered(msg_id, self.peer_id()).await;
        let targets = directory
            .spread_gossip_from(self.peer_id(), &message, self.shared.config.gossip_fanout)
            .await;

        debug!(
            peer = %self.peer_id(),
            topic = topic,
            msg_id = %msg_id.short(),
            targets = targets.len(),
            "published"
        );
        Ok(msg_id)
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    async fn receive(&self, message: Message) -> Acceptance {
        match message.kind() {
            MessageKind::Direct { .. } => self.receive_direct_message(message).await,
            MessageKind::Group { .. } => self.receive_group_message(message).await,
        }
    }

    /// Check `message` against the sender's registered key.
    async fn verify(&self, message: &Message) -> bool {
        match self.shared.directory.public_key(message.sender()).await {
            Some(key) => message.verify(&key),
            None => false,
        }
    }

    fn reject(&self, message: &Message, path: &'static str) -> Acceptance {
        warn!(
            peer = %self.peer_id(),
            from = %message.sender(),
            msg_id = %message.id().short(),
            path,
            "rejected message: signature check failed"
        );
        self.shared.stats.record(Acceptance::Rejected);
        Acceptance::Rejected
    }

    /// Inbound handler for direct messages.
    ///
    /// Normally driven by the peer's inbound queue or the mailbox drain.
    pub async fn receive_direct_message(&self, message: Message) -> Acceptance {
        if !self.verify(&message).await {
            return self.reject(&message, "direct");
        }
        if !self.shared.log.write().await.append(message.clone()) {
            self.shared.stats.record(Acceptance::Duplicate);
            return Acceptance::Duplicate;
        }
        self.shared.stats.record(Acceptance::Accepted);
        self.shared.protocol.handle_incoming(&message).await;
        Acceptance::Accepted
    }

    /// Inbound handler for group messages.
    ///
    /// The first call for a message id claims this peer's ledger entry; any
    /// later call is a `Duplicate` with no side effects.
    pub async fn receive_group_message(&self, message: Message) -> Acceptance {
        let directory = &self.shared.directory;
        if !directory.mark_delivered(message.id(), self.peer_id()).await {
            trace!(peer = %self.peer_id(), msg_id = %message.id().short(), "gossip duplicate");
            self.shared.stats.record(Acceptance::Duplicate);
            return Acceptance::Duplicate;
        }
        if !self.verify(&message).await {
            return self.reject(&message, "gossip");
        }

        let appended = self.shared.log.write().await.append(message.clone());
        if appended {
            self.shared.protocol.handle_incoming(&message).await;
        }
        let targets = directory
            .spread_gossip_from(self.peer_id(), &message, self.shared.config.gossip_fanout)
            .await;
        trace!(
            peer = %self.peer_id(),
            msg_id = %message.id().short(),
            relayed = targets.len(),
            "gossip relayed"
        );

        let outcome = if appended {
            Acceptance::Accepted
        } else {
            Acceptance::Duplicate
        };
        self.shared.stats.record(outcome);
        outcome
    }

    // ========================================================================
    // History
    // ========================================================================

    /// Pull recent messages from up to `neighbor_count` neighbors and merge
    /// them into the local log.
    ///
    /// Returns the pulled messages sorted by timestamp. With
    /// `PeerConfig::verify_history`, messages that fail verification are left
    /// out of both the log and the result. Messages already in the local log
    /// were checked on arrival and are not verified again.
    pub async fn request_history_from_neighbors(
        &self,
        neighbor_count: usize,
        messages_per_neighbor: usize,
    ) -> Vec<Message> {
        let directory = &self.shared.directory;
        let connected = self.connected_peers().await;
        let sampled = directory.random_peers(neighbor_count, self.peer_id()).await;
        let candidates =
            history::select_candidates(self.peer_id(), connected, sampled, neighbor_count);

        let mut aggregated = Vec::new();
        for candidate in &candidates {
            if let Some(neighbor) = directory.find_peer(candidate).await {
                aggregated.extend(neighbor.export_recent_messages(messages_per_neighbor).await);
            }
        }
        history::sort_by_timestamp(&mut aggregated);

        if self.shared.config.verify_history {
            let mut verified = Vec::with_capacity(aggregated.len());
            for message in aggregated {
                if self.has_message(&message.id()).await || self.verify(&message).await {
                    verified.push(message);
                } else {
                    self.reject(&message, "history");
                }
            }
            aggregated = verified;
        }

        let mut merged = 0;
        {
            let mut log = self.shared.log.write().await;
            for message in &aggregated {
                if log.append(message.clone()) {
                    merged += 1;
                }
            }
        }

        info!(
            peer = %self.peer_id(),
            neighbors = candidates.len(),
            pulled = aggregated.len(),
            merged,
            "merged history from neighbors"
        );
        aggregated
    }

    async fn export_recent_messages(&self, limit: usize) -> Vec<Message> {
        self.shared.log.read().await.recent(limit)
    }

    /// Point-in-time copy of the local log, in acceptance order.
    pub async fn message_log_snapshot(&self) -> Vec<Message> {
        self.shared.log.read().await.snapshot()
    }

    /// Whether message `id` is in the local log.
    pub async fn has_message(&self, id: &MessageId) -> bool {
        self.shared.log.read().await.contains(id)
    }

    pub fn stats(&self) -> PeerStats {
        self.shared.stats.snapshot()
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("peer_id", self.peer_id())
            .finish_non_exhaustive()
    }
}

/// Drain the inbound queue until every sender is gone.
async fn run_inbox(peer: Peer, mut inbox: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = inbox.recv().await {
        let _slot = peer.shared.directory.delivery_slot();
        peer.receive(message).await;
    }
    trace!(peer = %peer.peer_id(), "inbox closed");
}
