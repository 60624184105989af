//! # Peer Directory
//!
//! The [`Directory`] is the authoritative registry shared by every peer of one
//! simulated cluster. It is constructed explicitly and handed to each
//! [`Peer`] as an `Arc<Directory>`; several directories can coexist in one
//! process without seeing each other.
//!
//! ## State
//!
//! | Map | Key → Value | Purpose |
//! |-----|-------------|---------|
//! | `peers` | `PeerId` → handle, public key, inbox | membership and trust anchor |
//! | `topic_subscriptions` | topic → `PeerId` set | gossip targets (insert-only) |
//! | `gossip_deliveries` | `MessageId` → `PeerId` set | at-most-once acceptance per peer |
//! | `offline_messages` | `PeerId` → FIFO queue | store-and-forward mailbox |
//!
//! Handle and public key live in one entry, so they appear and disappear
//! together. A peer absent from `peers` has no key, and nothing it signed can
//! be accepted.
//!
//! ## Delivery
//!
//! Delivering to a registered peer pushes the message onto that peer's inbound
//! queue; the peer's own task processes it later. Delivering to anyone else
//! appends to their mailbox, drained when they next start.
//!
//! Every queued delivery is counted in `in_flight` until the receiving task has
//! finished with it. A delivery made while handling another one is counted
//! before the parent finishes, so [`Directory::settle`] also waits for any
//! re-gossip the queued work triggers.
//!
//! ## Bounds
//!
//! The gossip ledger is an LRU over message ids, capped at
//! [`DirectoryConfig::max_tracked_messages`]. A message evicted from the
//! ledger and delivered again is caught by the receiver's local log instead.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};

use ed25519_dalek::VerifyingKey;
use lru::LruCache;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tokio::sync::{Mutex, Notify, RwLock, mpsc};
use tracing::{debug, trace};

use crate::identity::PeerId;
use crate::messages::{Message, MessageId};
use crate::peer::{Peer, PeerError};

/// Default number of message ids tracked by the gossip ledger.
/// SECURITY: Bounds ledger memory regardless of traffic volume.
pub const DEFAULT_MAX_TRACKED_MESSAGES: usize = 100_000;

/// Sending half of a peer's inbound queue.
pub(crate) type Inbox = mpsc::UnboundedSender<Message>;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryConfig {
    /// Seed for shuffles and neighbor sampling. `None` seeds from entropy.
    pub rng_seed: Option<u64>,
    /// Capacity of the gossip-delivery ledger, in message ids.
    pub max_tracked_messages: usize,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            rng_seed: None,
            max_tracked_messages: DEFAULT_MAX_TRACKED_MESSAGES,
        }
    }
}

/// Where a delivery ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    /// Queued on the recipient's inbound queue.
    Online,
    /// Stored in the recipient's offline mailbox.
    Mailbox,
}

struct PeerEntry {
    peer: Peer,
    public_key: VerifyingKey,
    inbox: Inbox,
}

// ============================================================================
// Directory
// ============================================================================

pub struct Directory {
    peers: RwLock<HashMap<PeerId, PeerEntry>>,
    topic_subscriptions: RwLock<HashMap<String, BTreeSet<PeerId>>>,
    gossip_deliveries: Mutex<LruCache<MessageId, HashSet<PeerId>>>,
    offline_messages: Mutex<HashMap<PeerId, VecDeque<Message>>>,
    rng: Mutex<StdRng>,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Directory {
    pub fn new(config: DirectoryConfig) -> Self {
        let ledger_cap = NonZeroUsize::new(config.max_tracked_messages)
            .unwrap_or(NonZeroUsize::new(1).expect("1 is non-zero"));
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            peers: RwLock::new(HashMap::new()),
            topic_subscriptions: RwLock::new(HashMap::new()),
            gossip_deliveries: Mutex::new(LruCache::new(ledger_cap)),
            offline_messages: Mutex::new(HashMap::new()),
            rng: Mutex::new(rng),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Insert a peer together with its public key and inbox.
    ///
    /// # Errors
    /// `PeerIdInUse` if another registered peer holds the id.
    pub(crate) async fn register(
        &self,
        peer: Peer,
        public_key: VerifyingKey,
        inbox: Inbox,
    ) -> Result<(), PeerError> {
        let mut peers = self.peers.write().await;
        let id = peer.peer_id().clone();
        if peers.contains_key(&id) {
            return Err(PeerError::PeerIdInUse(id));
        }
        debug!(peer = %id, "registered");
        peers.insert(
            id,
            PeerEntry {
                peer,
                public_key,
                inbox,
            },
        );
        Ok(())
    }

    /// Remove a peer. Dropping the entry drops the directory's inbox sender,
    /// which lets the peer's inbound task drain and exit.
    pub(crate) async fn unregister(&self, id: &PeerId) -> bool {
        let removed = self.peers.write().await.remove(id).is_some();
        if removed {
            debug!(peer = %id, "unregistered");
        }
        removed
    }

    pub async fn find_peer(&self, id: &PeerId) -> Option<Peer> {
        self.peers.read().await.get(id).map(|entry| entry.peer.clone())
    }

    /// Public key a registered peer signed in with.
    pub async fn public_key(&self, id: &PeerId) -> Option<VerifyingKey> {
        self.peers.read().await.get(id).map(|entry| entry.public_key)
    }

    pub async fn is_registered(&self, id: &PeerId) -> bool {
        self.peers.read().await.contains_key(id)
    }

    /// Ids of all registered peers, sorted.
    pub async fn registered_peers(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Up to `limit` registered peers other than `exclude`, in random order.
    pub async fn random_peers(&self, limit: usize, exclude: &PeerId) -> Vec<PeerId> {
        if limit == 0 {
            return Vec::new();
        }
        let mut ids = self.registered_peers().await;
        ids.retain(|id| id != exclude);
        ids.shuffle(&mut *self.rng.lock().await);
        ids.truncate(limit);
        ids
    }

    // ========================================================================
    // Topics
    // ========================================================================

    pub(crate) async fn subscribe(&self, topic: &str, id: &PeerId) {
        self.topic_subscriptions
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .insert(id.clone());
    }

    /// Subscribers of `topic`, sorted. Includes peers that are not running.
    pub async fn subscribers(&self, topic: &str) -> Vec<PeerId> {
        self.topic_subscriptions
            .read()
            .await
            .get(topic)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ========================================================================
    // Gossip Ledger
    // ========================================================================

    /// Record that `peer` has taken delivery of message `id`.
    ///
    /// Returns `true` if this is the first time, `false` if it was already
    /// recorded. The check and the insert happen under one lock.
    ///
    /// Once `id` is evicted from the ledger this returns `true` again, so a
    /// late copy is verified and relayed a second time. The receiver's log
    /// still keeps it from being appended or dispatched twice.
    pub async fn mark_delivered(&self, id: MessageId, peer: &PeerId) -> bool {
        let mut ledger = self.gossip_deliveries.lock().await;
        ledger.get_or_insert_mut(id, HashSet::new).insert(peer.clone())
    }

    pub async fn has_seen(&self, id: &MessageId, peer: &PeerId) -> bool {
        self.gossip_deliveries
            .lock()
            .await
            .peek(id)
            .is_some_and(|seen| seen.contains(peer))
    }

    // ========================================================================
    // Offline Mailboxes
    // ========================================================================

    pub(crate) async fn enqueue_offline(&self, id: &PeerId, message: Message) {
        trace!(peer = %id, msg_id = %message.id().short(), "queued in mailbox");
        self.offline_messages
            .lock()
            .await
            .entry(id.clone())
            .or_default()
            .push_back(message);
    }

    /// Take every message waiting for `id`, oldest first, and remove the
    /// mailbox.
    pub(crate) async fn drain_offline(&self, id: &PeerId) -> Vec<Message> {
        self.offline_messages
            .lock()
            .await
            .remove(id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub async fn mailbox_len(&self, id: &PeerId) -> usize {
        self.offline_messages
            .lock()
            .await
            .get(id)
            .map_or(0, VecDeque::len)
    }

    // ========================================================================
    // Delivery
    // ========================================================================

    /// Route a direct message to `recipient`: its inbound queue if registered,
    /// its mailbox otherwise.
    pub(crate) async fn deliver_direct(&self, recipient: &PeerId, message: Message) -> Route {
        self.deliver_to(recipient, message).await
    }

    /// Forward a group message to at most `fanout` subscribers of its topic.
    ///
    /// Subscribers are shuffled afresh on every call. The sender and any peer
    /// already in the ledger for this message are skipped. Returns the peers
    /// the message was handed to.
    pub async fn spread_gossip_from(
        &self,
        sender: &PeerId,
        message: &Message,
        fanout: usize,
    ) -> Vec<PeerId> {
        let Some(topic) = message.topic() else {
            return Vec::new();
        };

        let mut subscribers = self.subscribers(topic).await;
        subscribers.shuffle(&mut *self.rng.lock().await);

        let mut targets = Vec::with_capacity(fanout.min(subscribers.len()));
        for candidate in subscribers {
            if targets.len() >= fanout {
                break;
            }
            if &candidate == sender || self.has_seen(&message.id(), &candidate).await {
                continue;
            }
            self.deliver_to(&candidate, message.clone()).await;
            targets.push(candidate);
        }

        trace!(
            from = %sender,
            msg_id = %message.id().short(),
            topic = topic,
            targets = targets.len(),
            "gossip spread"
        );
        targets
    }

    async fn deliver_to(&self, target: &PeerId, message: Message) -> Route {
        // Held until the message is queued somewhere. `register` needs the
        // write lock, so a peer starting concurrently either is visible here
        // or registers after the enqueue and drains it.
        let peers = self.peers.read().await;

        let message = match peers.get(target) {
            Some(entry) => {
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                match entry.inbox.send(message) {
                    Ok(()) => return Route::Online,
                    // Inbound task is gone.
                    Err(mpsc::error::SendError(message)) => {
                        self.delivery_finished();
                        message
                    }
                }
            }
            None => message,
        };

        self.enqueue_offline(target, message).await;
        drop(peers);
        Route::Mailbox
    }

    // ========================================================================
    // Quiescence
    // ========================================================================

    /// Called by a peer's inbound task after it has fully handled one queued
    /// delivery.
    pub(crate) fn delivery_finished(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Slot for one dequeued delivery, released when the guard drops.
    pub(crate) fn delivery_slot(&self) -> DeliverySlot<'_> {
        DeliverySlot { directory: self }
    }

    /// Deliveries queued but not yet processed.
    pub fn pending_deliveries(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until every queued delivery, including the re-gossip it causes,
    /// has been processed.
    pub async fn settle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Releases one in-flight delivery on drop, including during unwinding.
pub(crate) struct DeliverySlot<'a> {
    directory: &'a Directory,
}

impl Drop for DeliverySlot<'_> {
    fn drop(&mut self) {
        self.directory.delivery_finished();
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new(DirectoryConfig::default())
    }
}

impl std::fmt::Debug for Directory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Directory")
            .field("in_flight", &self.pending_deliveries())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use std::sync::Arc;

    fn seeded() -> Directory {
        Directory::new(DirectoryConfig {
            rng_seed: Some(7),
            ..DirectoryConfig::default()
        })
    }

    fn group(topic: &str) -> Message {
        let kp = Keypair::from_secret_key_bytes(&[1u8; 32]);
        Message::group(&kp, "alpha".into(), topic, "hello")
    }

    fn direct(recipient: &str) -> Message {
        let kp = Keypair::from_secret_key_bytes(&[1u8; 32]);
        Message::direct(&kp, "alpha".into(), recipient.into(), "ping")
    }

    #[tokio::test]
    async fn mark_delivered_is_test_and_set() {
        let dir = seeded();
        let id = group("t").id();
        let peer = PeerId::from("bravo");

        assert!(!dir.has_seen(&id, &peer).await);
        assert!(dir.mark_delivered(id, &peer).await);
        assert!(!dir.mark_delivered(id, &peer).await);
        assert!(dir.has_seen(&id, &peer).await);
        assert!(!dir.has_seen(&id, &PeerId::from("charlie")).await);
    }

    #[tokio::test]
    async fn ledger_is_bounded() {
        let dir = Directory::new(DirectoryConfig {
            rng_seed: Some(1),
            max_tracked_messages: 2,
        });
        let peer = PeerId::from("bravo");
        let ids: Vec<MessageId> = (0..3u8).map(|b| MessageId::from_bytes([b; 32])).collect();

        for id in &ids {
            dir.mark_delivered(*id, &peer).await;
        }
        assert!(!dir.has_seen(&ids[0], &peer).await, "oldest id evicted");
        assert!(dir.has_seen(&ids[2], &peer).await);
    }

    #[tokio::test]
    async fn mailbox_is_fifo_and_drained_once() {
        let dir = seeded();
        let bravo = PeerId::from("bravo");
        let first = direct("bravo");
        let second = direct("bravo");

        assert_eq!(dir.deliver_direct(&bravo, first.clone()).await, Route::Mailbox);
        assert_eq!(dir.deliver_direct(&bravo, second.clone()).await, Route::Mailbox);
        assert_eq!(dir.mailbox_len(&bravo).await, 2);

        let drained = dir.drain_offline(&bravo).await;
        assert_eq!(drained, vec![first, second]);
        assert_eq!(dir.mailbox_len(&bravo).await, 0);
        assert!(dir.drain_offline(&bravo).await.is_empty());
    }

    #[tokio::test]
    async fn spread_respects_fanout_and_skips() {
        let dir = seeded();
        let message = group("room");
        let sender = PeerId::from("alpha");
        for name in ["alpha", "p1", "p2", "p3", "p4", "p5", "p6"] {
            dir.subscribe("room", &PeerId::from(name)).await;
        }
        dir.mark_delivered(message.id(), &PeerId::from("p1")).await;

        let targets = dir.spread_gossip_from(&sender, &message, 3).await;
        assert_eq!(targets.len(), 3);
        assert!(!targets.contains(&sender));
        assert!(!targets.contains(&PeerId::from("p1")));
        let distinct: HashSet<_> = targets.iter().collect();
        assert_eq!(distinct.len(), 3);
        for target in &targets {
            assert_eq!(dir.mailbox_len(target).await, 1);
        }
    }

    #[tokio::test]
    async fn spread_with_few_subscribers_exhausts_list() {
        let dir = seeded();
        let message = group("room");
        let sender = PeerId::from("alpha");
        dir.subscribe("room", &sender).await;
        dir.subscribe("room", &PeerId::from("bravo")).await;

        let targets = dir.spread_gossip_from(&sender, &message, 3).await;
        assert_eq!(targets, vec![PeerId::from("bravo")]);
        assert!(dir.spread_gossip_from(&sender, &message, 0).await.is_empty());
        assert!(dir.spread_gossip_from(&sender, &direct("x"), 3).await.is_empty());
    }

    #[tokio::test]
    async fn shuffle_is_deterministic_for_a_seed() {
        async fn run() -> Vec<PeerId> {
            let dir = seeded();
            for i in 0..10 {
                dir.subscribe("room", &PeerId::new(format!("p{}", i))).await;
            }
            let message = group("room");
            dir.spread_gossip_from(&PeerId::from("alpha"), &message, 4).await
        }
        assert_eq!(run().await, run().await);
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let dir = seeded();
        let bravo = PeerId::from("bravo");
        dir.subscribe("room", &bravo).await;
        dir.subscribe("room", &bravo).await;
        assert_eq!(dir.subscribers("room").await, vec![bravo]);
        assert!(dir.subscribers("other").await.is_empty());
    }

    #[tokio::test]
    async fn random_peers_of_empty_directory() {
        let dir = seeded();
        assert!(dir.random_peers(5, &PeerId::from("me")).await.is_empty());
        assert!(dir.random_peers(0, &PeerId::from("me")).await.is_empty());
    }

    #[tokio::test]
    async fn delivery_slot_releases_on_drop() {
        let dir = Arc::new(seeded());
        let (inbox, mut rx) = mpsc::unbounded_channel();
        let kp = Keypair::from_secret_key_bytes(&[2u8; 32]);
        let bravo = Peer::new("bravo", dir.clone());
        dir.register(bravo.clone(), kp.verifying_key(), inbox)
            .await
            .expect("register");

        let route = dir.deliver_direct(bravo.peer_id(), direct("bravo")).await;
        assert_eq!(route, Route::Online);
        assert_eq!(dir.pending_deliveries(), 1);
        assert!(rx.recv().await.is_some());

        let worker = {
            let dir = dir.clone();
            tokio::spawn(async move {
                let _slot = dir.delivery_slot();
                if dir.pending_deliveries() > 0 {
                    panic!("handler failed");
                }
            })
        };
        assert!(worker.await.is_err());
        assert_eq!(dir.pending_deliveries(), 0);
        dir.settle().await;
    }

    #[tokio::test]
    async fn delivery_to_closed_inbox_falls_back_to_mailbox() {
        let dir = Arc::new(seeded());
        let (inbox, rx) = mpsc::unbounded_channel();
        drop(rx);
        let kp = Keypair::from_secret_key_bytes(&[2u8; 32]);
        dir.register(Peer::new("bravo", dir.clone()), kp.verifying_key(), inbox)
            .await
            .expect("register");

        let bravo = PeerId::from("bravo");
        let route = dir.deliver_direct(&bravo, direct("bravo")).await;
        assert_eq!(route, Route::Mailbox);
        assert_eq!(dir.mailbox_len(&bravo).await, 1);
        assert_eq!(dir.pending_deliveries(), 0);
    }

    #[tokio::test]
    async fn settle_returns_when_idle() {
        let dir = seeded();
        assert_eq!(dir.pending_deliveries(), 0);
        dir.settle().await;
    }
}
