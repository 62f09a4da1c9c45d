//! Main application lifecycle and coordination.
//!
//! [`Engine`] ties the identity store, the dispatcher and the outbound
//! sender together and owns every cache they use: peer keys, pooled
//! connections and the replay set. Two engines in one process share nothing.

use crate::{
    crypto::{keystore::Storage, Fingerprint, Identity, IdentityStore, Peer},
    transport::{BatchSender, ConnectionPool, Dispatcher, ReplayGuard},
    utils::{MessengerConfig, Result},
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

pub use crate::transport::dispatcher::InboundMessage;

/// Confirmation that a message was handed to the network
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    /// Id of the sent envelope
    pub message_id: Uuid,
    /// Recipient's fingerprint
    pub recipient: Fingerprint,
    /// Recipient's display name
    pub recipient_name: String,
    /// When the envelope was written
    pub sent_at: chrono::DateTime<chrono::Utc>,
}

/// Engine statistics
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Local fingerprint
    pub fingerprint: Fingerprint,
    /// Peers held in the key cache
    pub cached_peers: usize,
    /// Whether the dispatcher is accepting connections
    pub listening: bool,
    /// Inbound connections accepted
    pub accepted: u64,
    /// Inbound frames queued for the crypto workers
    pub queued: u64,
    /// Messages handed to the inbound callback
    pub delivered: u64,
    /// Frames dropped on a full queue
    pub saturated: u64,
    /// Frames rejected by decoding, lookup, crypto or replay checks
    pub rejected: u64,
    /// Message ids held by the replay guard
    pub replay_entries: usize,
    /// Time since the engine was created
    pub uptime: chrono::Duration,
}

/// Peer-to-peer messaging engine
pub struct Engine {
    config: MessengerConfig,
    identity: Identity,
    store: Arc<IdentityStore>,
    pool: Arc<ConnectionPool>,
    replay: Arc<ReplayGuard>,
    sender: BatchSender,
    dispatcher: Dispatcher,
    started_at: chrono::DateTime<chrono::Utc>,
}

impl Engine {
    /// Generate a new identity in `storage` and build an engine around it
    pub async fn create(
        config: MessengerConfig,
        storage: Arc<dyn Storage>,
        password: &str,
    ) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(IdentityStore::new(storage, &config));
        let identity = store.generate(password, false).await?;
        Ok(Self::assemble(config, store, identity))
    }

    /// Unlock the identity stored in `storage` and warm the peer cache
    pub async fn open(
        config: MessengerConfig,
        storage: Arc<dyn Storage>,
        password: &str,
    ) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(IdentityStore::new(storage, &config));
        let identity = store.load(password).await?;
        store.preload_all().await?;
        Ok(Self::assemble(config, store, identity))
    }

    /// Build an engine around an already unlocked identity
    pub async fn with_identity(
        config: MessengerConfig,
        storage: Arc<dyn Storage>,
        identity: Identity,
    ) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(IdentityStore::new(storage, &config));
        store.preload_all().await?;
        Ok(Self::assemble(config, store, identity))
    }

    fn assemble(config: MessengerConfig, store: Arc<IdentityStore>, identity: Identity) -> Self {
        let pool = Arc::new(ConnectionPool::from_config(&config));
        let replay = Arc::new(ReplayGuard::new(
            config.crypto.replay_capacity,
            config.crypto.max_clock_skew,
        ));
        let sender = BatchSender::new(Arc::clone(&pool), config.performance.broadcast_concurrency);
        let dispatcher = Dispatcher::new(
            identity.clone(),
            Arc::clone(&store),
            Arc::clone(&replay),
            &config,
        );

        log::info!("Engine ready for {}", identity);
        Self {
            config,
            identity,
            store,
            pool,
            replay,
            sender,
            dispatcher,
            started_at: chrono::Utc::now(),
        }
    }

    /// Local fingerprint
    pub fn my_fingerprint(&self) -> Fingerprint {
        self.identity.fingerprint()
    }

    /// Local public key as PEM, for handing to peers
    pub fn public_key_pem(&self) -> Result<String> {
        self.identity.public_key_pem()
    }

    /// Configuration the engine was built with
    pub fn config(&self) -> &MessengerConfig {
        &self.config
    }

    /// Encrypt, sign and send `plaintext` to one peer
    pub async fn send(
        &self,
        recipient_fingerprint_or_prefix: &str,
        plaintext: &[u8],
    ) -> Result<DeliveryReceipt> {
        let peer = self.store.resolve(recipient_fingerprint_or_prefix).await?;
        let message_id = self.sender.send_one(&peer, plaintext, &self.identity).await?;

        Ok(DeliveryReceipt {
            message_id,
            recipient: peer.fingerprint,
            recipient_name: peer.name,
            sent_at: chrono::Utc::now(),
        })
    }

    /// Send `plaintext` to every known peer, one result per peer
    pub async fn broadcast(&self, plaintext: &[u8]) -> Result<HashMap<Fingerprint, Result<()>>> {
        let peers = self.store.list_peers().await?;
        self.sender.broadcast(&peers, plaintext, &self.identity).await
    }

    /// Install the callback receiving inbound messages, replacing any previous one
    ///
    /// The callback runs inline on a crypto worker, so while it runs that
    /// worker takes no further frames. Hand slow work off to a channel or a
    /// task instead of doing it in the callback.
    pub async fn register_inbound_callback<F>(&self, callback: F)
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        self.dispatcher.set_handler(Arc::new(callback)).await;
    }

    /// Known peers, sorted by name
    pub async fn list_peers(&self) -> Result<Vec<Peer>> {
        self.store.list_peers().await
    }

    /// Add or update a peer from its public key
    pub async fn add_peer(
        &self,
        name: &str,
        host: &str,
        port: u16,
        public_key_blob: &[u8],
    ) -> Result<Peer> {
        self.store.add_peer(name, host, port, public_key_blob).await
    }

    /// Forget a peer
    pub async fn remove_peer(&self, fingerprint_or_prefix: &str) -> Result<Peer> {
        self.store.remove_peer(fingerprint_or_prefix).await
    }

    /// Start accepting messages on the configured listen address
    pub async fn listen(&self) -> Result<SocketAddr> {
        self.listen_on(&self.config.network.listen_address()).await
    }

    /// Start accepting messages on `address`
    pub async fn listen_on(&self, address: &str) -> Result<SocketAddr> {
        self.dispatcher.start(address).await
    }

    /// Stop accepting, drain queued messages and close pooled connections
    pub async fn shutdown(&self) {
        log::info!("Shutting down engine {}", self.identity.fingerprint().short());
        self.dispatcher.shutdown().await;
        self.pool.close_all();
    }

    /// Engine statistics
    pub async fn stats(&self) -> EngineStats {
        let dispatch = self.dispatcher.stats();
        EngineStats {
            fingerprint: self.identity.fingerprint(),
            cached_peers: self.store.cached_count().await,
            listening: self.dispatcher.is_running(),
            accepted: dispatch.accepted(),
            queued: dispatch.queued(),
            delivered: dispatch.delivered(),
            saturated: dispatch.saturated(),
            rejected: dispatch.rejected(),
            replay_entries: self.replay.len(),
            uptime: chrono::Utc::now().signed_duration_since(self.started_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::identity::fixtures::{identity, TEST_KEY_BITS};
    use crate::crypto::{FileStorage, MemoryStorage};
    use crate::utils::{IdentityError, MessengerError, NetworkError};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn test_config() -> MessengerConfig {
        let mut config = MessengerConfig::default();
        config.crypto.key_bits = TEST_KEY_BITS;
        config.crypto.kdf_iterations = 1_000;
        config
    }

    async fn engine(index: usize) -> Engine {
        Engine::with_identity(test_config(), Arc::new(MemoryStorage::new()), identity(index))
            .await
            .unwrap()
    }

    /// Engine listening on loopback, with its inbound messages forwarded to a channel
    async fn listening_engine(index: usize) -> (Engine, u16, mpsc::UnboundedReceiver<InboundMessage>) {
        let engine = engine(index).await;
        let (tx, rx) = mpsc::unbounded_channel();
        engine
            .register_inbound_callback(move |message| {
                let _ = tx.send(message);
            })
            .await;
        let port = engine.listen_on("127.0.0.1:0").await.unwrap().port();
        (engine, port, rx)
    }

    async fn introduce(engine: &Engine, name: &str, other: &Engine, port: u16) {
        let pem = other.public_key_pem().unwrap();
        engine.add_peer(name, "127.0.0.1", port, pem.as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_and_open() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(FileStorage::new(dir.path()));

        let created = Engine::create(test_config(), storage.clone(), "open sesame")
            .await
            .unwrap();
        let fingerprint = created.my_fingerprint();

        let opened = Engine::open(test_config(), storage.clone(), "open sesame")
            .await
            .unwrap();
        assert_eq!(opened.my_fingerprint(), fingerprint);

        let err = Engine::open(test_config(), storage, "wrong password").await.err().unwrap();
        assert!(matches!(err, MessengerError::Identity(IdentityError::Decryption)));
    }

    #[tokio::test]
    async fn test_hello_delivered_once() {
        let alice = engine(0).await;
        let (bob, bob_port, mut inbox) = listening_engine(1).await;

        introduce(&alice, "bob", &bob, bob_port).await;
        introduce(&bob, "alice", &alice, 9).await;

        let receipt = alice.send(&bob.my_fingerprint().short(), b"hello").await.unwrap();
        assert_eq!(receipt.recipient, bob.my_fingerprint());
        assert_eq!(receipt.recipient_name, "bob");

        let message = tokio::time::timeout(Duration::from_secs(10), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.text(), "hello");
        assert_eq!(message.sender, alice.my_fingerprint());
        assert_eq!(message.message_id, receipt.message_id);

        tokio::time::sleep(Duration::from_millis(200)).await;
        bob.shutdown().await;
        assert!(inbox.try_recv().is_err());

        let stats = bob.stats().await;
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.replay_entries, 1);
        assert!(!stats.listening);
    }

    #[tokio::test]
    async fn test_broadcast_with_unreachable_peer() {
        let alice = engine(0).await;
        let (bob, bob_port, mut bob_inbox) = listening_engine(1).await;
        let (carol, carol_port, mut carol_inbox) = listening_engine(2).await;
        let dave = engine(3).await;
        let dave_port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        introduce(&alice, "bob", &bob, bob_port).await;
        introduce(&alice, "carol", &carol, carol_port).await;
        introduce(&alice, "dave", &dave, dave_port).await;
        introduce(&bob, "alice", &alice, 9).await;
        introduce(&carol, "alice", &alice, 9).await;

        let results = alice.broadcast(b"hi all").await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results.values().filter(|r| r.is_ok()).count(), 2);
        assert!(matches!(
            results[&dave.my_fingerprint()],
            Err(MessengerError::Network(NetworkError::ConnectionFailed { .. }))
        ));

        for inbox in [&mut bob_inbox, &mut carol_inbox] {
            let message = tokio::time::timeout(Duration::from_secs(10), inbox.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(message.text(), "hi all");
            assert_eq!(message.sender, alice.my_fingerprint());
        }

        bob.shutdown().await;
        carol.shutdown().await;
    }

    #[tokio::test]
    async fn test_message_from_unknown_sender_dropped() {
        let alice = engine(0).await;
        let (bob, bob_port, mut inbox) = listening_engine(1).await;

        // Bob never learns Alice's key.
        introduce(&alice, "bob", &bob, bob_port).await;
        alice.send(&bob.my_fingerprint().to_hex(), b"who am i").await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        bob.shutdown().await;
        assert!(inbox.try_recv().is_err());
        assert_eq!(bob.stats().await.rejected, 1);
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let alice = engine(0).await;
        let err = alice.send("abcdef", b"anyone").await.unwrap_err();
        assert!(matches!(err, MessengerError::Identity(IdentityError::UnknownPeer { .. })));
    }

    #[tokio::test]
    async fn test_engines_do_not_share_peers() {
        let alice = engine(0).await;
        let bob = engine(1).await;
        introduce(&alice, "carol", &engine(2).await, 9000).await;

        assert_eq!(alice.list_peers().await.unwrap().len(), 1);
        assert!(bob.list_peers().await.unwrap().is_empty());

        alice.remove_peer(&identity(2).fingerprint().short()).await.unwrap();
        assert!(alice.list_peers().await.unwrap().is_empty());
    }
}
