//! Error types and handling for the Enclave messaging engine.
//!
//! Every public entry point returns [`Result`], whose error side is the
//! unified [`MessengerError`]. Errors are grouped by the layer that raised
//! them so callers can decide how to react: cryptographic and identity
//! failures are surfaced and never retried, protocol failures drop the
//! offending frame, network failures may be retried on a fresh connection.

use thiserror::Error;

/// Result type alias for the Enclave library
pub type Result<T> = std::result::Result<T, MessengerError>;

/// Comprehensive error type for all engine operations
#[derive(Error, Debug, Clone)]
pub enum MessengerError {
    /// Cryptographic operation errors
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Network and transport layer errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Local identity and peer directory errors
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Configuration and I/O errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Protocol-level errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error for unexpected conditions
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

/// Cryptographic operation errors
#[derive(Error, Debug, Clone)]
pub enum CryptoError {
    /// Envelope signature did not validate under the sender's key
    #[error("Signature verification failed")]
    SignatureVerification,

    /// AEAD tag mismatch while decrypting the payload
    #[error("Message integrity check failed")]
    Integrity,

    /// The wrapped symmetric key could not be recovered with the local key
    #[error("Failed to unwrap message key")]
    KeyUnwrap,

    /// A supplied public key blob does not parse as a usable key
    #[error("Malformed key: {reason}")]
    MalformedKey { reason: String },

    /// Key generation failure
    #[error("Key generation failed: {reason}")]
    KeyGeneration { reason: String },

    /// Encryption, wrapping or signing failure
    #[error("Encryption failed: {reason}")]
    Encryption { reason: String },
}

/// Network and transport layer errors
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    /// Connection establishment failure
    #[error("Connection failed to {peer}: {reason}")]
    ConnectionFailed { peer: String, reason: String },

    /// Timeout during network operation
    #[error("Network timeout: {operation}")]
    Timeout { operation: String },

    /// Socket read/write failure on an established connection
    #[error("Transport error: {reason}")]
    Transport { reason: String },

    /// Invalid network address
    #[error("Invalid address: {address}")]
    InvalidAddress { address: String },
}

/// Local identity and peer directory errors
#[derive(Error, Debug, Clone)]
pub enum IdentityError {
    /// No cached or stored peer matches the query
    #[error("Unknown peer: {query}")]
    UnknownPeer { query: String },

    /// A fingerprint prefix matches more than one peer
    #[error("Ambiguous peer prefix '{prefix}' matches {matches} peers")]
    AmbiguousPeer { prefix: String, matches: usize },

    /// Password shorter than the configured minimum
    #[error("Password too short: minimum {min_length} characters")]
    WeakSecret { min_length: usize },

    /// Wrong password or corrupted private key storage
    #[error("Failed to decrypt private key (wrong password or corrupted key file)")]
    Decryption,

    /// No local identity has been generated yet
    #[error("Identity not found: {path}")]
    NotFound { path: String },

    /// Refusing to overwrite an existing identity
    #[error("Identity already exists: {path}")]
    AlreadyExists { path: String },

    /// Stored fingerprint does not match the stored public key
    #[error("Fingerprint mismatch: record says {stored}, key hashes to {computed}")]
    FingerprintMismatch { stored: String, computed: String },
}

/// Configuration and setup errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Directory creation failure
    #[error("Failed to create directory: {path}")]
    DirectoryCreation { path: String },
}

/// Protocol-level errors
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// Unsupported protocol version
    #[error("Unsupported protocol version: {version}")]
    UnsupportedVersion { version: u8 },

    /// Invalid message format
    #[error("Invalid message format: {reason}")]
    InvalidMessage { reason: String },

    /// Plaintext too large to seal
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Declared frame length over the configured ceiling
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Zero-length frame
    #[error("Empty frame")]
    EmptyFrame,

    /// Envelope timestamp outside the accepted clock skew
    #[error("Stale message: timestamp {timestamp} is more than {max_skew}s from local time {now}")]
    StaleMessage { timestamp: i64, now: i64, max_skew: u64 },

    /// Message replay detected
    #[error("Duplicate message: {message_id}")]
    Duplicate { message_id: String },

    /// Inbound queue is full; the frame was dropped
    #[error("Message queue saturated (capacity {capacity})")]
    QueueSaturated { capacity: usize },

    /// Broadcast called with no recipients
    #[error("No recipients")]
    NoRecipients,
}

/// Coarse error categories used for handling policy and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Signature, integrity, unwrap and key parsing failures
    Cryptographic,
    /// Stale, duplicate, oversized or dropped frames
    Protocol,
    /// Connect, read and write failures
    Network,
    /// Peer lookup, password and key storage failures
    Identity,
    /// Invalid or unreadable configuration
    Configuration,
    /// Everything else
    Internal,
}

impl MessengerError {
    /// Creates a new unexpected error with a custom message
    pub fn unexpected<S: Into<String>>(msg: S) -> Self {
        Self::Unexpected(msg.into())
    }

    /// Returns the handling category of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Crypto(_) => ErrorCategory::Cryptographic,
            Self::Protocol(_) => ErrorCategory::Protocol,
            Self::Network(_) | Self::Io(_) => ErrorCategory::Network,
            Self::Identity(_) => ErrorCategory::Identity,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Serialization(_) | Self::Unexpected(_) => ErrorCategory::Internal,
        }
    }

    /// Returns true if this error is recoverable by retrying on a fresh connection
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Network(NetworkError::Timeout { .. })
                | Self::Network(NetworkError::ConnectionFailed { .. })
                | Self::Network(NetworkError::Transport { .. })
        )
    }

    /// Returns true if this error indicates a security violation
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Self::Crypto(CryptoError::SignatureVerification)
                | Self::Crypto(CryptoError::Integrity)
                | Self::Protocol(ProtocolError::Duplicate { .. })
                | Self::Protocol(ProtocolError::StaleMessage { .. })
                | Self::Identity(IdentityError::FingerprintMismatch { .. })
        )
    }
}

impl From<std::io::Error> for MessengerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for MessengerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for MessengerError {
    fn from(err: bincode::Error) -> Self {
        Self::Protocol(ProtocolError::InvalidMessage {
            reason: err.to_string(),
        })
    }
}

impl From<tokio::task::JoinError> for MessengerError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Unexpected(format!("background task failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = MessengerError::Crypto(CryptoError::MalformedKey {
            reason: "not a PEM document".to_string(),
        });
        assert!(error.to_string().contains("Malformed key"));

        let error = MessengerError::Identity(IdentityError::AmbiguousPeer {
            prefix: "ab".to_string(),
            matches: 2,
        });
        assert!(error.to_string().contains("'ab'"));
    }

    #[test]
    fn test_error_recovery() {
        let timeout_error = MessengerError::Network(NetworkError::Timeout {
            operation: "connect".to_string(),
        });
        assert!(timeout_error.is_recoverable());

        let crypto_error = MessengerError::Crypto(CryptoError::SignatureVerification);
        assert!(!crypto_error.is_recoverable());

        let identity_error = MessengerError::Identity(IdentityError::Decryption);
        assert!(!identity_error.is_recoverable());
    }

    #[test]
    fn test_security_violations() {
        let sig_error = MessengerError::Crypto(CryptoError::SignatureVerification);
        assert!(sig_error.is_security_violation());

        let replay = MessengerError::Protocol(ProtocolError::Duplicate {
            message_id: "00".to_string(),
        });
        assert!(replay.is_security_violation());

        let network_error = MessengerError::Network(NetworkError::Timeout {
            operation: "connect".to_string(),
        });
        assert!(!network_error.is_security_violation());
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            MessengerError::from(CryptoError::KeyUnwrap).category(),
            ErrorCategory::Cryptographic
        );
        assert_eq!(
            MessengerError::from(ProtocolError::QueueSaturated { capacity: 1 }).category(),
            ErrorCategory::Protocol
        );
        assert_eq!(
            MessengerError::from(IdentityError::WeakSecret { min_length: 8 }).category(),
            ErrorCategory::Identity
        );
        assert_eq!(
            MessengerError::from(std::io::Error::new(std::io::ErrorKind::Other, "reset"))
                .category(),
            ErrorCategory::Network
        );
    }
}
