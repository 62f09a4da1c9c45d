//! Local key storage and the peer directory.
//!
//! [`IdentityStore`] owns the local key pair on disk (password-encrypted) and
//! the set of known peers, addressed by fingerprint. Parsed peer keys are
//! cached in memory for the life of the store; [`IdentityStore::preload_all`]
//! fills the cache at startup so steady-state lookups never touch storage.
//!
//! Storage is abstracted behind [`Storage`] so the on-disk layout stays a
//! collaborator concern:
//!
//! ```text
//! <keys_dir>/my_private_key.enc        encrypted PKCS#8, JSON wrapper
//! <keys_dir>/my_public_key.pem         SubjectPublicKeyInfo PEM
//! <keys_dir>/peers/<fingerprint>.json  one record per peer
//! ```

use crate::crypto::identity::{Fingerprint, Identity, PublicKeyOps, RsaKeyPair, RsaPublic};
use crate::crypto::symmetric;
use crate::utils::{
    CryptoConfig, IdentityError, MessengerConfig, MessengerError, NetworkError, Result,
};
use base64::{engine::general_purpose, Engine};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Encrypted private key file name
pub const PRIVATE_KEY_FILE: &str = "my_private_key.enc";

/// Public key file name
pub const PUBLIC_KEY_FILE: &str = "my_public_key.pem";

/// Directory holding one record per peer
pub const PEERS_DIR: &str = "peers";

const PEER_RECORD_EXTENSION: &str = "json";
const KDF_NAME: &str = "pbkdf2-hmac-sha256";
const PRIVATE_KEY_FORMAT_VERSION: u8 = 1;

/// Byte-level storage the key store persists through
///
/// All paths are relative to the storage root.
pub trait Storage: Send + Sync {
    /// Read a whole file
    fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Create or replace a file
    fn write(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// Create or replace a file readable only by the owner
    fn write_secret(&self, path: &Path, data: &[u8]) -> Result<()> {
        self.write(path, data)
    }

    /// Delete a file
    fn remove(&self, path: &Path) -> Result<()>;

    /// List the files directly inside `dir`; a missing directory is empty
    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>>;

    /// Whether a file exists
    fn exists(&self, path: &Path) -> bool;
}

/// [`Storage`] backed by a directory on the local filesystem
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Storage rooted at `root` (created lazily on first write)
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// The storage root
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn prepare(&self, path: &Path) -> Result<PathBuf> {
        let full = self.root.join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(full)
    }
}

impl Storage for FileStorage {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.root.join(path))?)
    }

    fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        std::fs::write(self.prepare(path)?, data)?;
        Ok(())
    }

    #[cfg(unix)]
    fn write_secret(&self, path: &Path, data: &[u8]) -> Result<()> {
        use std::io::Write;
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

        let full = self.prepare(path)?;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&full)?;
        // mode() only applies on creation
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        file.write_all(data)?;
        file.sync_all()?;
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(self.root.join(path))?;
        Ok(())
    }

    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let full = self.root.join(dir);
        if !full.exists() {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(full)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                paths.push(dir.join(entry.file_name()));
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn exists(&self, path: &Path) -> bool {
        self.root.join(path).is_file()
    }
}

/// In-memory [`Storage`], for tests and embedders that manage persistence themselves
#[derive(Debug, Default)]
pub struct MemoryStorage {
    files: std::sync::RwLock<BTreeMap<PathBuf, Vec<u8>>>,
}

impl MemoryStorage {
    /// Empty storage
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> MessengerError {
        MessengerError::unexpected("memory storage lock poisoned")
    }
}

impl Storage for MemoryStorage {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let files = self.files.read().map_err(|_| Self::poisoned())?;
        files.get(path).cloned().ok_or_else(|| {
            MessengerError::Io(format!("{}: no such file", path.display()))
        })
    }

    fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut files = self.files.write().map_err(|_| Self::poisoned())?;
        files.insert(path.to_path_buf(), data.to_vec());
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let mut files = self.files.write().map_err(|_| Self::poisoned())?;
        files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| MessengerError::Io(format!("{}: no such file", path.display())))
    }

    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let files = self.files.read().map_err(|_| Self::poisoned())?;
        Ok(files
            .keys()
            .filter(|path| path.parent() == Some(dir))
            .cloned()
            .collect())
    }

    fn exists(&self, path: &Path) -> bool {
        self.files
            .read()
            .map(|files| files.contains_key(path))
            .unwrap_or(false)
    }
}

/// On-disk wrapper around the encrypted PKCS#8 private key
#[derive(Debug, Serialize, Deserialize)]
struct EncryptedPrivateKey {
    version: u8,
    kdf: String,
    iterations: u32,
    salt: String,
    nonce: String,
    /// `ciphertext || tag`
    ciphertext: String,
    fingerprint: Fingerprint,
}

/// On-disk peer record
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PeerRecord {
    name: String,
    host: String,
    port: u16,
    fingerprint: Fingerprint,
    public_key: String,
    added_at: chrono::DateTime<chrono::Utc>,
}

/// A remote identity known locally
#[derive(Debug, Clone)]
pub struct Peer {
    /// Display name
    pub name: String,
    /// Host the peer listens on
    pub host: String,
    /// Port the peer listens on
    pub port: u16,
    /// Fingerprint of `public_key`
    pub fingerprint: Fingerprint,
    /// Parsed public key
    pub public_key: Arc<dyn PublicKeyOps>,
    /// When the peer was added
    pub added_at: chrono::DateTime<chrono::Utc>,
}

impl Peer {
    /// Build a peer around an already parsed key
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        public_key: Arc<dyn PublicKeyOps>,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            fingerprint: public_key.fingerprint(),
            public_key,
            added_at: chrono::Utc::now(),
        }
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn from_record(record: PeerRecord) -> Result<Self> {
        let public_key = RsaPublic::from_blob(record.public_key.as_bytes())?;
        let computed = public_key.fingerprint();
        if computed != record.fingerprint {
            return Err(IdentityError::FingerprintMismatch {
                stored: record.fingerprint.to_hex(),
                computed: computed.to_hex(),
            }
            .into());
        }

        Ok(Self {
            name: record.name,
            host: record.host,
            port: record.port,
            fingerprint: computed,
            public_key: Arc::new(public_key),
            added_at: record.added_at,
        })
    }

    fn to_record(&self) -> Result<PeerRecord> {
        Ok(PeerRecord {
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
            fingerprint: self.fingerprint,
            public_key: self.public_key.to_pem()?,
            added_at: self.added_at,
        })
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}> ({})", self.name, self.address(), self.fingerprint.short())
    }
}

fn peer_record_path(fingerprint: &Fingerprint) -> PathBuf {
    Path::new(PEERS_DIR).join(format!("{}.{}", fingerprint.to_hex(), PEER_RECORD_EXTENSION))
}

fn load_peer_record(storage: &dyn Storage, path: &Path) -> Result<Peer> {
    let bytes = storage.read(path)?;
    let record: PeerRecord = serde_json::from_slice(&bytes)?;
    Peer::from_record(record)
}

fn is_peer_record(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(PEER_RECORD_EXTENSION)
}

fn record_stem(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_ascii_lowercase)
}

/// Local identity storage and fingerprint-addressed peer cache
pub struct IdentityStore {
    storage: Arc<dyn Storage>,
    crypto: CryptoConfig,
    preload_concurrency: usize,
    peers: RwLock<HashMap<Fingerprint, Peer>>,
    preloaded: AtomicBool,
}

impl IdentityStore {
    /// Create a store over `storage`
    pub fn new(storage: Arc<dyn Storage>, config: &MessengerConfig) -> Self {
        Self {
            storage,
            crypto: config.crypto.clone(),
            preload_concurrency: config.performance.preload_concurrency,
            peers: RwLock::new(HashMap::new()),
            preloaded: AtomicBool::new(false),
        }
    }

    /// Whether a local identity has been generated
    pub fn has_identity(&self) -> bool {
        self.storage.exists(Path::new(PRIVATE_KEY_FILE))
    }

    /// Generate and persist a new local identity
    ///
    /// # Errors
    ///
    /// Returns `IdentityError::WeakSecret` for short passwords and
    /// `IdentityError::AlreadyExists` if an identity is already stored and
    /// `force` is not set.
    pub async fn generate(&self, password: &str, force: bool) -> Result<Identity> {
        self.check_password(password)?;
        if self.has_identity() && !force {
            return Err(IdentityError::AlreadyExists {
                path: PRIVATE_KEY_FILE.to_string(),
            }
            .into());
        }

        let bits = self.crypto.key_bits;
        log::info!("Generating RSA-{} identity", bits);
        let identity = tokio::task::spawn_blocking(move || Identity::generate(bits)).await??;
        self.store_identity(&identity, password).await?;

        log::info!("Identity generated: {}", identity.fingerprint());
        Ok(identity)
    }

    /// Encrypt and persist an existing identity, replacing any stored one
    pub async fn store_identity(&self, identity: &Identity, password: &str) -> Result<()> {
        self.check_password(password)?;

        let der = identity.secret_key().to_pkcs8_der()?;
        let password = password.to_string();
        let iterations = self.crypto.kdf_iterations;
        let fingerprint = identity.fingerprint();

        let wrapper = tokio::task::spawn_blocking(move || -> Result<EncryptedPrivateKey> {
            let salt = symmetric::random_salt();
            let key = symmetric::derive_key(&password, &salt, iterations);
            let sealed = symmetric::seal(&key[..], &der)?;
            let (nonce, ciphertext) = sealed.split_at(symmetric::NONCE_SIZE);
            Ok(EncryptedPrivateKey {
                version: PRIVATE_KEY_FORMAT_VERSION,
                kdf: KDF_NAME.to_string(),
                iterations,
                salt: general_purpose::STANDARD.encode(salt),
                nonce: general_purpose::STANDARD.encode(nonce),
                ciphertext: general_purpose::STANDARD.encode(ciphertext),
                fingerprint,
            })
        })
        .await??;

        self.storage.write_secret(
            Path::new(PRIVATE_KEY_FILE),
            &serde_json::to_vec_pretty(&wrapper)?,
        )?;
        self.storage.write(
            Path::new(PUBLIC_KEY_FILE),
            identity.public_key_pem()?.as_bytes(),
        )?;
        Ok(())
    }

    /// Decrypt and load the local identity
    ///
    /// # Errors
    ///
    /// Returns `IdentityError::NotFound` if no identity is stored and
    /// `IdentityError::Decryption` on a wrong password or corrupted file.
    pub async fn load(&self, password: &str) -> Result<Identity> {
        if !self.has_identity() {
            return Err(IdentityError::NotFound {
                path: PRIVATE_KEY_FILE.to_string(),
            }
            .into());
        }

        let bytes = self.storage.read(Path::new(PRIVATE_KEY_FILE))?;
        let password = password.to_string();

        let identity = tokio::task::spawn_blocking(move || -> Result<Identity> {
            let wrapper: EncryptedPrivateKey =
                serde_json::from_slice(&bytes).map_err(|_| IdentityError::Decryption)?;
            if wrapper.version != PRIVATE_KEY_FORMAT_VERSION || wrapper.kdf != KDF_NAME {
                return Err(IdentityError::Decryption.into());
            }

            let salt = general_purpose::STANDARD
                .decode(&wrapper.salt)
                .map_err(|_| IdentityError::Decryption)?;
            let mut sealed = general_purpose::STANDARD
                .decode(&wrapper.nonce)
                .map_err(|_| IdentityError::Decryption)?;
            sealed.extend(
                general_purpose::STANDARD
                    .decode(&wrapper.ciphertext)
                    .map_err(|_| IdentityError::Decryption)?,
            );

            let key = symmetric::derive_key(&password, &salt, wrapper.iterations);
            let der = zeroize::Zeroizing::new(
                symmetric::open(&key[..], &sealed).map_err(|_| IdentityError::Decryption)?,
            );
            let keys = RsaKeyPair::from_pkcs8_der(&der).map_err(|_| IdentityError::Decryption)?;

            let identity = Identity::from_secret_key(Arc::new(keys));
            if identity.fingerprint() != wrapper.fingerprint {
                return Err(IdentityError::FingerprintMismatch {
                    stored: wrapper.fingerprint.to_hex(),
                    computed: identity.fingerprint().to_hex(),
                }
                .into());
            }
            Ok(identity)
        })
        .await??;

        log::info!("Loaded identity {}", identity.fingerprint());
        Ok(identity)
    }

    /// Parse, persist and cache a peer's public key
    ///
    /// Re-adding a known key updates its name and address.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::MalformedKey` if the blob is not a valid public key.
    pub async fn add_peer(
        &self,
        name: &str,
        host: &str,
        port: u16,
        public_key_blob: &[u8],
    ) -> Result<Peer> {
        if host.trim().is_empty() || port == 0 {
            return Err(NetworkError::InvalidAddress {
                address: format!("{}:{}", host, port),
            }
            .into());
        }

        let public_key = RsaPublic::from_blob(public_key_blob)?;
        let name = if name.trim().is_empty() {
            public_key.fingerprint().short()
        } else {
            name.trim().to_string()
        };
        let peer = Peer::new(name, host.trim(), port, Arc::new(public_key));

        let record = serde_json::to_vec_pretty(&peer.to_record()?)?;
        self.storage.write(&peer_record_path(&peer.fingerprint), &record)?;
        self.peers.write().await.insert(peer.fingerprint, peer.clone());

        log::info!("Peer added: {}", peer);
        Ok(peer)
    }

    /// Forget a peer: delete its record and evict it from the cache
    pub async fn remove_peer(&self, fingerprint_or_prefix: &str) -> Result<Peer> {
        let peer = self.resolve(fingerprint_or_prefix).await?;
        let path = peer_record_path(&peer.fingerprint);
        if self.storage.exists(&path) {
            self.storage.remove(&path)?;
        }
        self.peers.write().await.remove(&peer.fingerprint);

        log::info!("Peer removed: {}", peer);
        Ok(peer)
    }

    /// Find a peer by full fingerprint or unique hex prefix
    ///
    /// # Errors
    ///
    /// Returns `IdentityError::UnknownPeer` if nothing matches and
    /// `IdentityError::AmbiguousPeer` if a prefix matches several peers.
    pub async fn resolve(&self, fingerprint_or_prefix: &str) -> Result<Peer> {
        let query = fingerprint_or_prefix.trim().to_ascii_lowercase();
        let unknown = || -> MessengerError {
            IdentityError::UnknownPeer {
                query: fingerprint_or_prefix.to_string(),
            }
            .into()
        };

        if query.is_empty() || !query.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(unknown());
        }

        if let Ok(fingerprint) = Fingerprint::from_hex(&query) {
            if let Some(peer) = self.peers.read().await.get(&fingerprint) {
                return Ok(peer.clone());
            }
            if self.preloaded.load(Ordering::Acquire) {
                return Err(unknown());
            }
            let path = peer_record_path(&fingerprint);
            if !self.storage.exists(&path) {
                return Err(unknown());
            }
            return self.cache_from_storage(&path).await;
        }

        let mut matches: HashSet<String> = self
            .peers
            .read()
            .await
            .keys()
            .filter(|fp| fp.matches_prefix(&query))
            .map(Fingerprint::to_hex)
            .collect();

        if !self.preloaded.load(Ordering::Acquire) {
            for path in self.storage.list(Path::new(PEERS_DIR))? {
                if let Some(stem) = record_stem(&path).filter(|_| is_peer_record(&path)) {
                    if stem.starts_with(&query) {
                        matches.insert(stem);
                    }
                }
            }
        }

        match matches.len() {
            0 => Err(unknown()),
            1 => {
                let hex = matches.into_iter().next().ok_or_else(unknown)?;
                let fingerprint = Fingerprint::from_hex(&hex)?;
                if let Some(peer) = self.peers.read().await.get(&fingerprint) {
                    return Ok(peer.clone());
                }
                self.cache_from_storage(&peer_record_path(&fingerprint)).await
            }
            n => Err(IdentityError::AmbiguousPeer {
                prefix: fingerprint_or_prefix.to_string(),
                matches: n,
            }
            .into()),
        }
    }

    /// All known peers, sorted by name
    pub async fn list_peers(&self) -> Result<Vec<Peer>> {
        if !self.preloaded.load(Ordering::Acquire) {
            self.preload_all().await?;
        }

        let mut peers: Vec<Peer> = self.peers.read().await.values().cloned().collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name).then(a.fingerprint.cmp(&b.fingerprint)));
        Ok(peers)
    }

    /// Parse every stored peer record into the cache with bounded parallelism
    ///
    /// Records that fail to load are logged and skipped. Returns the number
    /// of peers loaded.
    pub async fn preload_all(&self) -> Result<usize> {
        let paths: Vec<PathBuf> = self
            .storage
            .list(Path::new(PEERS_DIR))?
            .into_iter()
            .filter(|p| is_peer_record(p))
            .collect();

        if paths.is_empty() {
            self.preloaded.store(true, Ordering::Release);
            return Ok(0);
        }

        let total = paths.len();
        let concurrency = total.min(self.preload_concurrency);

        let results: Vec<(PathBuf, Result<Peer>)> = stream::iter(paths)
            .map(|path| {
                let storage = Arc::clone(&self.storage);
                async move {
                    let loaded = {
                        let path = path.clone();
                        tokio::task::spawn_blocking(move || load_peer_record(storage.as_ref(), &path))
                            .await
                            .map_err(MessengerError::from)
                            .and_then(|r| r)
                    };
                    (path, loaded)
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut loaded = 0;
        {
            let mut cache = self.peers.write().await;
            for (path, result) in results {
                match result {
                    Ok(peer) => {
                        cache.insert(peer.fingerprint, peer);
                        loaded += 1;
                    }
                    Err(e) => log::warn!("Failed to load peer record {}: {}", path.display(), e),
                }
            }
        }
        self.preloaded.store(true, Ordering::Release);

        log::info!("Preloaded {}/{} peer keys into cache", loaded, total);
        Ok(loaded)
    }

    /// Number of peers currently cached
    pub async fn cached_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Drop every cached peer; later lookups reload from storage
    pub async fn clear_cache(&self) {
        self.peers.write().await.clear();
        self.preloaded.store(false, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) async fn insert_cached(&self, peer: Peer) {
        self.peers.write().await.insert(peer.fingerprint, peer);
    }

    async fn cache_from_storage(&self, path: &Path) -> Result<Peer> {
        let storage = Arc::clone(&self.storage);
        let owned = path.to_path_buf();
        let peer =
            tokio::task::spawn_blocking(move || load_peer_record(storage.as_ref(), &owned)).await??;

        self.peers
            .write()
            .await
            .insert(peer.fingerprint, peer.clone());
        log::debug!("Cached peer key {}", peer.fingerprint.short());
        Ok(peer)
    }

    fn check_password(&self, password: &str) -> Result<()> {
        if password.chars().count() < self.crypto.min_password_length {
            return Err(IdentityError::WeakSecret {
                min_length: self.crypto.min_password_length,
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::identity::fixtures::{identity, TEST_KEY_BITS};
    use crate::utils::CryptoError;
    use tempfile::TempDir;

    const PASSWORD: &str = "correct horse battery";

    fn test_config() -> MessengerConfig {
        let mut config = MessengerConfig::default();
        config.crypto.key_bits = TEST_KEY_BITS;
        config.crypto.kdf_iterations = 1_000;
        config
    }

    fn memory_store() -> (Arc<MemoryStorage>, IdentityStore) {
        let storage = Arc::new(MemoryStorage::new());
        let store = IdentityStore::new(storage.clone(), &test_config());
        (storage, store)
    }

    fn pem(index: usize) -> String {
        identity(index).public_key_pem().unwrap()
    }

    /// Key with chosen canonical bytes, for steering fingerprints in tests
    #[derive(Debug)]
    struct FixedKey(Vec<u8>);

    impl PublicKeyOps for FixedKey {
        fn algorithm(&self) -> &'static str {
            "TEST"
        }
        fn key_bits(&self) -> usize {
            0
        }
        fn canonical_bytes(&self) -> &[u8] {
            &self.0
        }
        fn to_pem(&self) -> Result<String> {
            Ok(String::new())
        }
        fn verify(&self, _message: &[u8], _signature: &[u8]) -> Result<()> {
            Err(CryptoError::SignatureVerification.into())
        }
        fn wrap_key(&self, _key: &[u8]) -> Result<Vec<u8>> {
            Err(CryptoError::Encryption {
                reason: "test key".to_string(),
            }
            .into())
        }
    }

    #[tokio::test]
    async fn test_generate_rejects_weak_password() {
        let (_, store) = memory_store();
        let err = store.generate("short", false).await.unwrap_err();
        assert!(matches!(
            err,
            MessengerError::Identity(IdentityError::WeakSecret { min_length: 8 })
        ));
        assert!(!store.has_identity());
    }

    #[tokio::test]
    async fn test_generate_then_load() {
        let (storage, store) = memory_store();
        let generated = store.generate(PASSWORD, false).await.unwrap();
        assert!(storage.exists(Path::new(PUBLIC_KEY_FILE)));

        let loaded = store.load(PASSWORD).await.unwrap();
        assert_eq!(loaded.fingerprint(), generated.fingerprint());

        let err = store.generate(PASSWORD, false).await.unwrap_err();
        assert!(matches!(err, MessengerError::Identity(IdentityError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn test_load_wrong_password() {
        let (_, store) = memory_store();
        store.store_identity(&identity(0), PASSWORD).await.unwrap();

        let err = store.load("not the password").await.unwrap_err();
        assert!(matches!(err, MessengerError::Identity(IdentityError::Decryption)));
    }

    #[tokio::test]
    async fn test_load_corrupted_storage() {
        let (storage, store) = memory_store();
        store.store_identity(&identity(0), PASSWORD).await.unwrap();
        storage.write(Path::new(PRIVATE_KEY_FILE), b"{ garbage").unwrap();

        let err = store.load(PASSWORD).await.unwrap_err();
        assert!(matches!(err, MessengerError::Identity(IdentityError::Decryption)));
    }

    #[tokio::test]
    async fn test_load_missing_identity() {
        let (_, store) = memory_store();
        let err = store.load(PASSWORD).await.unwrap_err();
        assert!(matches!(err, MessengerError::Identity(IdentityError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_add_peer_and_resolve() {
        let (_, store) = memory_store();
        let bob = store.add_peer("bob", "127.0.0.1", 9001, pem(1).as_bytes()).await.unwrap();
        assert_eq!(bob.fingerprint, identity(1).fingerprint());
        assert_eq!(bob.address(), "127.0.0.1:9001");

        let exact = store.resolve(&bob.fingerprint.to_hex()).await.unwrap();
        assert_eq!(exact.name, "bob");

        let by_prefix = store.resolve(&bob.fingerprint.short().to_uppercase()).await.unwrap();
        assert_eq!(by_prefix.fingerprint, bob.fingerprint);
    }

    #[tokio::test]
    async fn test_add_peer_malformed_key() {
        let (_, store) = memory_store();
        let err = store.add_peer("eve", "127.0.0.1", 9001, b"garbage").await.unwrap_err();
        assert!(matches!(err, MessengerError::Crypto(CryptoError::MalformedKey { .. })));
        assert_eq!(store.cached_count().await, 0);
    }

    #[tokio::test]
    async fn test_resolve_unknown() {
        let (_, store) = memory_store();
        let stranger = identity(2).fingerprint().to_hex();
        for query in ["", "xyz", "abcdef", stranger.as_str()] {
            let err = store.resolve(query).await.unwrap_err();
            assert!(matches!(err, MessengerError::Identity(IdentityError::UnknownPeer { .. })));
        }
    }

    #[tokio::test]
    async fn test_resolve_ambiguous_prefix() {
        let (_, store) = memory_store();

        // 17 keys over 16 leading hex digits: at least two must collide.
        let mut by_first_char: HashMap<char, usize> = HashMap::new();
        for i in 0..17u8 {
            let peer = Peer::new(format!("p{}", i), "127.0.0.1", 9000, Arc::new(FixedKey(vec![i])));
            let first = peer.fingerprint.to_hex().chars().next().unwrap();
            *by_first_char.entry(first).or_default() += 1;
            store.insert_cached(peer).await;
        }
        let (prefix, count) = by_first_char
            .into_iter()
            .find(|(_, count)| *count > 1)
            .unwrap();

        let err = store.resolve(&prefix.to_string()).await.unwrap_err();
        match err {
            MessengerError::Identity(IdentityError::AmbiguousPeer { matches, .. }) => {
                assert_eq!(matches, count);
            }
            other => panic!("expected ambiguity, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_preload_all_from_disk() {
        let dir = TempDir::new().unwrap();
        let config = test_config();

        {
            let store = IdentityStore::new(Arc::new(FileStorage::new(dir.path())), &config);
            store.add_peer("alice", "10.0.0.1", 8000, pem(0).as_bytes()).await.unwrap();
            store.add_peer("bob", "10.0.0.2", 8000, pem(1).as_bytes()).await.unwrap();
            store.add_peer("carol", "10.0.0.3", 8000, pem(2).as_bytes()).await.unwrap();
        }

        let reopened = IdentityStore::new(Arc::new(FileStorage::new(dir.path())), &config);
        assert_eq!(reopened.cached_count().await, 0);
        assert_eq!(reopened.preload_all().await.unwrap(), 3);
        assert_eq!(reopened.cached_count().await, 3);

        let names: Vec<String> = reopened
            .list_peers()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["alice", "bob", "carol"]);
    }

    #[tokio::test]
    async fn test_resolve_loads_on_cache_miss() {
        let (storage, store) = memory_store();
        store.add_peer("bob", "127.0.0.1", 9001, pem(1).as_bytes()).await.unwrap();

        let fresh = IdentityStore::new(storage, &test_config());
        let bob = fresh.resolve(&identity(1).fingerprint().short()).await.unwrap();
        assert_eq!(bob.name, "bob");
        assert_eq!(fresh.cached_count().await, 1);
    }

    #[tokio::test]
    async fn test_tampered_record_detected() {
        let (storage, store) = memory_store();
        let bob = store.add_peer("bob", "127.0.0.1", 9001, pem(1).as_bytes()).await.unwrap();

        // Swap in another key under bob's fingerprint.
        let path = peer_record_path(&bob.fingerprint);
        let mut record: PeerRecord = serde_json::from_slice(&storage.read(&path).unwrap()).unwrap();
        record.public_key = pem(2);
        storage.write(&path, &serde_json::to_vec(&record).unwrap()).unwrap();

        let fresh = IdentityStore::new(storage, &test_config());
        let err = fresh.resolve(&bob.fingerprint.to_hex()).await.unwrap_err();
        assert!(matches!(
            err,
            MessengerError::Identity(IdentityError::FingerprintMismatch { .. })
        ));
        assert_eq!(fresh.preload_all().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_peer() {
        let (storage, store) = memory_store();
        let bob = store.add_peer("bob", "127.0.0.1", 9001, pem(1).as_bytes()).await.unwrap();

        store.remove_peer(&bob.fingerprint.short()).await.unwrap();
        assert!(!storage.exists(&peer_record_path(&bob.fingerprint)));
        assert!(store.resolve(&bob.fingerprint.to_hex()).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_private_key_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = IdentityStore::new(Arc::new(FileStorage::new(dir.path())), &test_config());
        store.store_identity(&identity(0), PASSWORD).await.unwrap();

        let mode = std::fs::metadata(dir.path().join(PRIVATE_KEY_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
