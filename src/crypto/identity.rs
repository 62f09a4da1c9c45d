//! Identity management and RSA cryptographic operations.
//!
//! Asymmetric keys are exposed through two capability traits,
//! [`PublicKeyOps`] and [`SecretKeyOps`], so the envelope codec and the
//! dispatcher never name a concrete algorithm. RSA (OAEP for key wrapping,
//! PSS for signatures, both over SHA-256) is the only implementation today.
//!
//! Every identity is addressed by its [`Fingerprint`]: the SHA-256 digest of
//! the public key's SubjectPublicKeyInfo DER encoding.

use crate::utils::config::MIN_KEY_BITS;
use crate::utils::{CryptoError, MessengerError, Result};
use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, Pss, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Length of a fingerprint in bytes
pub const FINGERPRINT_LENGTH: usize = 32;

/// Number of hex characters shown by [`Fingerprint::short`]
pub const SHORT_FINGERPRINT_LENGTH: usize = 12;

/// SHA-256 digest of a public key's canonical encoding
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint([u8; FINGERPRINT_LENGTH]);

impl Fingerprint {
    /// Hash a canonical public key encoding
    pub fn of_canonical_bytes(canonical: &[u8]) -> Self {
        Self(Sha256::digest(canonical).into())
    }

    /// Wrap raw fingerprint bytes, e.g. taken from an envelope
    pub fn from_bytes(bytes: [u8; FINGERPRINT_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Parse a full 64-character hex fingerprint
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str.trim()).map_err(|e| CryptoError::MalformedKey {
            reason: format!("invalid fingerprint '{}': {}", hex_str, e),
        })?;
        let bytes: [u8; FINGERPRINT_LENGTH] =
            bytes.try_into().map_err(|_| CryptoError::MalformedKey {
                reason: format!("fingerprint '{}' is not {} bytes", hex_str, FINGERPRINT_LENGTH),
            })?;
        Ok(Self(bytes))
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LENGTH] {
        &self.0
    }

    /// Lowercase hex rendering
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Abbreviated hex rendering for logs and prompts
    pub fn short(&self) -> String {
        self.to_hex()[..SHORT_FINGERPRINT_LENGTH].to_string()
    }

    /// Case-insensitive hex prefix match
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        self.to_hex().starts_with(&prefix.trim().to_ascii_lowercase())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = MessengerError;

    fn try_from(value: String) -> Result<Self> {
        Self::from_hex(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(fingerprint: Fingerprint) -> Self {
        fingerprint.to_hex()
    }
}

/// Public half of an asymmetric key: verification and key wrapping
pub trait PublicKeyOps: Send + Sync + fmt::Debug {
    /// Algorithm label, e.g. `"RSA"`
    fn algorithm(&self) -> &'static str;

    /// Modulus (or equivalent) size in bits
    fn key_bits(&self) -> usize;

    /// Canonical encoding the fingerprint is computed over
    fn canonical_bytes(&self) -> &[u8];

    /// PEM rendering for sharing and storage
    fn to_pem(&self) -> Result<String>;

    /// Verify a detached signature over `message`
    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()>;

    /// Encrypt a symmetric key for the holder of the matching secret key
    fn wrap_key(&self, key: &[u8]) -> Result<Vec<u8>>;

    /// Fingerprint of this key
    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_canonical_bytes(self.canonical_bytes())
    }
}

/// Secret half of an asymmetric key: signing and key unwrapping
pub trait SecretKeyOps: Send + Sync {
    /// Matching public key
    fn public_key(&self) -> Arc<dyn PublicKeyOps>;

    /// Produce a detached signature over `message`
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;

    /// Recover a symmetric key wrapped with [`PublicKeyOps::wrap_key`]
    fn unwrap_key(&self, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>>;

    /// PKCS#8 DER encoding, for encryption at rest
    fn to_pkcs8_der(&self) -> Result<Zeroizing<Vec<u8>>>;
}

/// Compute the fingerprint of any public key
pub fn fingerprint_of(public_key: &dyn PublicKeyOps) -> Fingerprint {
    public_key.fingerprint()
}

/// RSA public key with its cached canonical encoding
pub struct RsaPublic {
    key: RsaPublicKey,
    der: Vec<u8>,
}

impl RsaPublic {
    /// Wrap an RSA public key, computing its SPKI DER encoding
    pub fn from_key(key: RsaPublicKey) -> Result<Self> {
        let der = key
            .to_public_key_der()
            .map_err(|e| CryptoError::MalformedKey {
                reason: e.to_string(),
            })?
            .as_bytes()
            .to_vec();
        Ok(Self { key, der })
    }

    /// Parse a public key blob: SPKI PEM, PKCS#1 PEM or SPKI DER
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::MalformedKey` if none of the encodings parse or
    /// the modulus is smaller than [`MIN_KEY_BITS`].
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        let key = match std::str::from_utf8(blob) {
            Ok(text) if text.contains("-----BEGIN") => RsaPublicKey::from_public_key_pem(text)
                .map_err(|e| e.to_string())
                .or_else(|_| RsaPublicKey::from_pkcs1_pem(text).map_err(|e| e.to_string())),
            _ => RsaPublicKey::from_public_key_der(blob).map_err(|e| e.to_string()),
        }
        .map_err(|reason| CryptoError::MalformedKey { reason })?;

        let bits = key.size() * 8;
        if bits < MIN_KEY_BITS {
            return Err(CryptoError::MalformedKey {
                reason: format!("{}-bit modulus is below the {}-bit minimum", bits, MIN_KEY_BITS),
            }
            .into());
        }

        Self::from_key(key)
    }
}

impl fmt::Debug for RsaPublic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaPublic")
            .field("bits", &self.key_bits())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl PublicKeyOps for RsaPublic {
    fn algorithm(&self) -> &'static str {
        "RSA"
    }

    fn key_bits(&self) -> usize {
        self.key.size() * 8
    }

    fn canonical_bytes(&self) -> &[u8] {
        &self.der
    }

    fn to_pem(&self) -> Result<String> {
        self.key.to_public_key_pem(LineEnding::LF).map_err(|e| {
            CryptoError::MalformedKey {
                reason: e.to_string(),
            }
            .into()
        })
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        if signature.len() != self.key.size() {
            return Err(CryptoError::SignatureVerification.into());
        }
        let digest = Sha256::digest(message);
        self.key
            .verify(Pss::new::<Sha256>(), &digest, signature)
            .map_err(|_| CryptoError::SignatureVerification.into())
    }

    fn wrap_key(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), key)
            .map_err(|e| {
                CryptoError::Encryption {
                    reason: format!("key wrap failed: {}", e),
                }
                .into()
            })
    }
}

/// RSA key pair implementing both capability traits
pub struct RsaKeyPair {
    private: RsaPrivateKey,
    public: Arc<RsaPublic>,
}

impl RsaKeyPair {
    /// Generate a new random key pair
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::KeyGeneration` for sizes below [`MIN_KEY_BITS`]
    /// or if the RNG fails.
    pub fn generate(bits: usize) -> Result<Self> {
        if bits < MIN_KEY_BITS {
            return Err(CryptoError::KeyGeneration {
                reason: format!("{}-bit keys are below the {}-bit minimum", bits, MIN_KEY_BITS),
            }
            .into());
        }
        let private = RsaPrivateKey::new(&mut OsRng, bits).map_err(|e| {
            CryptoError::KeyGeneration {
                reason: e.to_string(),
            }
        })?;
        Self::from_private_key(private)
    }

    /// Restore a key pair from its PKCS#8 DER encoding
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self> {
        let private = RsaPrivateKey::from_pkcs8_der(der).map_err(|e| CryptoError::MalformedKey {
            reason: e.to_string(),
        })?;
        Self::from_private_key(private)
    }

    fn from_private_key(private: RsaPrivateKey) -> Result<Self> {
        let public = Arc::new(RsaPublic::from_key(private.to_public_key())?);
        Ok(Self { private, public })
    }
}

impl SecretKeyOps for RsaKeyPair {
    fn public_key(&self) -> Arc<dyn PublicKeyOps> {
        self.public.clone()
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let digest = Sha256::digest(message);
        self.private
            .sign_with_rng(&mut OsRng, Pss::new::<Sha256>(), &digest)
            .map_err(|e| {
                CryptoError::Encryption {
                    reason: format!("signing failed: {}", e),
                }
                .into()
            })
    }

    fn unwrap_key(&self, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        self.private
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::KeyUnwrap.into())
    }

    fn to_pkcs8_der(&self) -> Result<Zeroizing<Vec<u8>>> {
        let document = self.private.to_pkcs8_der().map_err(|e| CryptoError::KeyGeneration {
            reason: e.to_string(),
        })?;
        Ok(Zeroizing::new(document.as_bytes().to_vec()))
    }
}

/// The local identity: a key pair plus its fingerprint
#[derive(Clone)]
pub struct Identity {
    secret: Arc<dyn SecretKeyOps>,
    public: Arc<dyn PublicKeyOps>,
    fingerprint: Fingerprint,
}

impl Identity {
    /// Generate a new RSA identity
    pub fn generate(bits: usize) -> Result<Self> {
        Ok(Self::from_secret_key(Arc::new(RsaKeyPair::generate(bits)?)))
    }

    /// Build an identity around any secret key implementation
    pub fn from_secret_key(secret: Arc<dyn SecretKeyOps>) -> Self {
        let public = secret.public_key();
        let fingerprint = public.fingerprint();
        Self {
            secret,
            public,
            fingerprint,
        }
    }

    /// This identity's fingerprint
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Shareable public key
    pub fn public_key(&self) -> Arc<dyn PublicKeyOps> {
        self.public.clone()
    }

    /// Secret key capabilities
    pub fn secret_key(&self) -> &dyn SecretKeyOps {
        self.secret.as_ref()
    }

    /// Public key as PEM, suitable for handing to peers
    pub fn public_key_pem(&self) -> Result<String> {
        self.public.to_pem()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint)
            .field("algorithm", &self.public.algorithm())
            .field("bits", &self.public.key_bits())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{} ({})", self.public.algorithm(), self.public.key_bits(), self.fingerprint.short())
    }
}

/// Shared key material for tests. RSA generation is slow, so each test
/// binary generates a handful of identities once and hands out clones.
#[cfg(test)]
pub(crate) mod fixtures {
    use super::Identity;
    use std::sync::OnceLock;

    pub(crate) const TEST_KEY_BITS: usize = 2048;

    static IDENTITIES: OnceLock<Vec<Identity>> = OnceLock::new();

    pub(crate) fn identity(index: usize) -> Identity {
        IDENTITIES.get_or_init(|| {
            let handles: Vec<_> = (0..4)
                .map(|_| std::thread::spawn(|| Identity::generate(TEST_KEY_BITS).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })[index]
            .clone()
    }
}
