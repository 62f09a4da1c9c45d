//! Signed, encrypted message envelopes.
//!
//! An envelope carries one message from a sender to a single recipient. The
//! payload is sealed with a fresh AES-256-GCM key, that key is wrapped for
//! the recipient, and the whole envelope is signed by the sender.
//!
//! The signature covers a fixed canonical layout rather than the serialized
//! struct, so the wire encoding can change without invalidating signatures:
//!
//! ```text
//! version (1) || sender fingerprint (32) || message id (16) ||
//! timestamp (i64 BE, 8) || wrapped key length (u32 BE) || wrapped key ||
//! ciphertext length (u32 BE) || nonce || ciphertext || tag
//! ```

use crate::crypto::identity::{Fingerprint, Identity, PublicKeyOps, FINGERPRINT_LENGTH};
use crate::crypto::symmetric;
use crate::utils::{CryptoError, ProtocolError, Result};
use crate::{MAX_FRAME_SIZE, MAX_PLAINTEXT_SIZE, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Length of a message id in bytes
pub const MESSAGE_ID_LENGTH: usize = 16;

/// Wire envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Format version
    pub version: u8,
    /// Fingerprint of the sender's public key
    pub sender_fingerprint: [u8; FINGERPRINT_LENGTH],
    /// Random UUIDv4
    pub message_id: [u8; MESSAGE_ID_LENGTH],
    /// Unix seconds at sealing time
    pub timestamp: i64,
    /// Content key wrapped for the recipient
    #[serde(with = "serde_bytes")]
    pub wrapped_key: Vec<u8>,
    /// `nonce || ciphertext || tag`
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
    /// Sender's signature over [`Envelope::signing_bytes`]
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl Envelope {
    /// Sender fingerprint as a [`Fingerprint`]
    pub fn sender(&self) -> Fingerprint {
        Fingerprint::from_bytes(self.sender_fingerprint)
    }

    /// Message id as a UUID
    pub fn id(&self) -> Uuid {
        Uuid::from_bytes(self.message_id)
    }

    /// Canonical bytes covered by the signature
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            1 + FINGERPRINT_LENGTH
                + MESSAGE_ID_LENGTH
                + 8
                + 4
                + self.wrapped_key.len()
                + 4
                + self.ciphertext.len(),
        );
        out.push(self.version);
        out.extend_from_slice(&self.sender_fingerprint);
        out.extend_from_slice(&self.message_id);
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&(self.wrapped_key.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.wrapped_key);
        out.extend_from_slice(&(self.ciphertext.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Serialize for the wire
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from the wire
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: bytes.len(),
                max: MAX_FRAME_SIZE,
            }
            .into());
        }
        Ok(bincode::deserialize(bytes)?)
    }

    fn sign(&mut self, sender: &Identity) -> Result<()> {
        self.signature = sender.secret_key().sign(&self.signing_bytes())?;
        Ok(())
    }
}

/// Encrypt and sign `plaintext` for the holder of `recipient`
///
/// # Errors
///
/// Returns `ProtocolError::MessageTooLarge` if the plaintext exceeds
/// [`MAX_PLAINTEXT_SIZE`].
pub fn seal(plaintext: &[u8], sender: &Identity, recipient: &dyn PublicKeyOps) -> Result<Envelope> {
    seal_at(plaintext, sender, recipient, chrono::Utc::now().timestamp())
}

pub(crate) fn seal_at(
    plaintext: &[u8],
    sender: &Identity,
    recipient: &dyn PublicKeyOps,
    timestamp: i64,
) -> Result<Envelope> {
    if plaintext.len() > MAX_PLAINTEXT_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: plaintext.len(),
            max: MAX_PLAINTEXT_SIZE,
        }
        .into());
    }

    let content_key = symmetric::random_key();
    let ciphertext = symmetric::seal(&content_key[..], plaintext)?;
    let wrapped_key = recipient.wrap_key(&content_key[..])?;

    let mut envelope = Envelope {
        version: PROTOCOL_VERSION,
        sender_fingerprint: *sender.fingerprint().as_bytes(),
        message_id: *Uuid::new_v4().as_bytes(),
        timestamp,
        wrapped_key,
        ciphertext,
        signature: Vec::new(),
    };
    envelope.sign(sender)?;
    Ok(envelope)
}

/// Verify and decrypt an envelope addressed to `local`
///
/// Checks run in a fixed order and stop at the first failure: version,
/// signature, clock skew, key unwrap, payload integrity. Nothing past the
/// signature is interpreted until the signature verifies.
pub fn open(
    envelope: &Envelope,
    local: &Identity,
    sender_key: &dyn PublicKeyOps,
    max_skew: u64,
) -> Result<Vec<u8>> {
    if envelope.version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion {
            version: envelope.version,
        }
        .into());
    }

    sender_key.verify(&envelope.signing_bytes(), &envelope.signature)?;

    check_skew(envelope.timestamp, max_skew)?;

    let content_key = local.secret_key().unwrap_key(&envelope.wrapped_key)?;
    if content_key.len() != symmetric::KEY_SIZE {
        return Err(CryptoError::KeyUnwrap.into());
    }

    symmetric::open(&content_key, &envelope.ciphertext)
}

/// Fail with `StaleMessage` if `timestamp` is more than `max_skew` seconds from now
pub fn check_skew(timestamp: i64, max_skew: u64) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    if now.abs_diff(timestamp) > max_skew {
        return Err(ProtocolError::StaleMessage {
            timestamp,
            now,
            max_skew,
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::identity::fixtures::identity;
    use crate::defaults::DEFAULT_MAX_CLOCK_SKEW;
    use crate::utils::MessengerError;

    const SKEW: u64 = DEFAULT_MAX_CLOCK_SKEW;

    #[test]
    fn test_seal_open() {
        let (alice, bob) = (identity(0), identity(1));
        let envelope = seal(b"hello bob", &alice, bob.public_key().as_ref()).unwrap();

        assert_eq!(envelope.sender(), alice.fingerprint());
        assert_eq!(envelope.id().get_version_num(), 4);

        let wire = envelope.to_bytes().unwrap();
        let decoded = Envelope::from_bytes(&wire).unwrap();
        assert_eq!(decoded, envelope);

        let plaintext = open(&decoded, &bob, alice.public_key().as_ref(), SKEW).unwrap();
        assert_eq!(plaintext, b"hello bob");
    }

    #[test]
    fn test_signing_layout() {
        let (alice, bob) = (identity(0), identity(1));
        let envelope = seal(b"x", &alice, bob.public_key().as_ref()).unwrap();
        let bytes = envelope.signing_bytes();

        assert_eq!(bytes[0], PROTOCOL_VERSION);
        assert_eq!(&bytes[1..33], alice.fingerprint().as_bytes());
        assert_eq!(&bytes[33..49], &envelope.message_id);
        assert_eq!(&bytes[49..57], &envelope.timestamp.to_be_bytes());
        assert_eq!(
            u32::from_be_bytes(bytes[57..61].try_into().unwrap()) as usize,
            envelope.wrapped_key.len()
        );
    }

    #[test]
    fn test_tampering_rejected_by_signature() {
        let (alice, bob) = (identity(0), identity(1));
        let original = seal(b"transfer 10", &alice, bob.public_key().as_ref()).unwrap();

        let mut flipped_ciphertext = original.clone();
        let last = flipped_ciphertext.ciphertext.len() - 1;
        flipped_ciphertext.ciphertext[last] ^= 0x01;

        let mut flipped_key = original.clone();
        flipped_key.wrapped_key[0] ^= 0x80;

        let mut flipped_signature = original.clone();
        flipped_signature.signature[10] ^= 0x01;

        let mut shifted_time = original.clone();
        shifted_time.timestamp += 1;

        for tampered in [flipped_ciphertext, flipped_key, flipped_signature, shifted_time] {
            let err = open(&tampered, &bob, alice.public_key().as_ref(), SKEW).unwrap_err();
            assert!(
                matches!(err, MessengerError::Crypto(CryptoError::SignatureVerification)),
                "unexpected error: {:?}",
                err
            );
        }
    }

    #[test]
    fn test_wrong_sender_key() {
        let (alice, bob, carol) = (identity(0), identity(1), identity(2));
        let envelope = seal(b"hi", &alice, bob.public_key().as_ref()).unwrap();

        let err = open(&envelope, &bob, carol.public_key().as_ref(), SKEW).unwrap_err();
        assert!(matches!(err, MessengerError::Crypto(CryptoError::SignatureVerification)));
    }

    #[test]
    fn test_wrong_recipient() {
        let (alice, bob, carol) = (identity(0), identity(1), identity(2));
        let envelope = seal(b"for bob only", &alice, bob.public_key().as_ref()).unwrap();

        let err = open(&envelope, &carol, alice.public_key().as_ref(), SKEW).unwrap_err();
        assert!(matches!(err, MessengerError::Crypto(CryptoError::KeyUnwrap)));
    }

    #[test]
    fn test_stale_and_future_rejected() {
        let (alice, bob) = (identity(0), identity(1));
        let now = chrono::Utc::now().timestamp();

        for timestamp in [now - 301, now + 301] {
            let envelope = seal_at(b"late", &alice, bob.public_key().as_ref(), timestamp).unwrap();
            let err = open(&envelope, &bob, alice.public_key().as_ref(), SKEW).unwrap_err();
            assert!(matches!(err, MessengerError::Protocol(ProtocolError::StaleMessage { .. })));
        }

        let edge = seal_at(b"edge", &alice, bob.public_key().as_ref(), now - 250).unwrap();
        assert!(open(&edge, &bob, alice.public_key().as_ref(), SKEW).is_ok());
    }

    #[test]
    fn test_unsupported_version() {
        let (alice, bob) = (identity(0), identity(1));
        let mut envelope = seal(b"v2?", &alice, bob.public_key().as_ref()).unwrap();
        envelope.version = 2;

        let err = open(&envelope, &bob, alice.public_key().as_ref(), SKEW).unwrap_err();
        assert!(matches!(
            err,
            MessengerError::Protocol(ProtocolError::UnsupportedVersion { version: 2 })
        ));
    }

    #[test]
    fn test_plaintext_size_limit() {
        let (alice, bob) = (identity(0), identity(1));
        let big = vec![0u8; MAX_PLAINTEXT_SIZE + 1];
        let err = seal(&big, &alice, bob.public_key().as_ref()).unwrap_err();
        assert!(matches!(err, MessengerError::Protocol(ProtocolError::MessageTooLarge { .. })));
    }

    #[test]
    fn test_garbage_bytes() {
        let err = Envelope::from_bytes(b"definitely not an envelope").unwrap_err();
        assert!(matches!(err, MessengerError::Protocol(ProtocolError::InvalidMessage { .. })));
    }
}
