//! # Enclave
//!
//! A peer-to-peer encrypted messaging engine. Endpoints exchange signed,
//! encrypted envelopes directly over TCP with no server, broker or session
//! state beyond locally cached keys.
//!
//! ## Features
//!
//! - **Hybrid encryption**: AES-256-GCM payloads, RSA-OAEP wrapped keys
//! - **Authenticity**: RSA-PSS signatures verified before any decryption
//! - **Replay safety**: bounded replay guard plus a clock-skew window
//! - **Identity management**: password-protected keys, fingerprint-addressed peers
//! - **Bounded concurrency**: accept pool, message queue, crypto workers, pooled sends
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use enclave::{Engine, MessengerConfig};
//! use enclave::crypto::FileStorage;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MessengerConfig::default();
//!     let storage = Arc::new(FileStorage::new(&config.storage.keys_dir));
//!     let engine = Engine::open(config, storage, "correct horse").await?;
//!     engine.register_inbound_callback(|message| {
//!         println!("{}: {}", message.sender.short(), message.text());
//!     }).await;
//!     engine.listen().await?;
//!     engine.send("3fa2", b"hello").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`crypto`]: key capabilities, identities, the key store and the envelope codec
//! - [`transport`]: framing, replay guard, connection pool, dispatcher and batch sender
//! - [`app`]: the [`Engine`] that owns every cache and exposes the application API
//! - [`utils`]: configuration and error handling

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::module_name_repetitions)]

pub mod app;
pub mod crypto;
pub mod transport;
pub mod utils;

pub use app::{DeliveryReceipt, Engine, EngineStats, InboundMessage};
pub use crypto::{Envelope, Fingerprint, Identity, IdentityStore, Peer};
pub use utils::{MessengerConfig, MessengerError, Result};

/// Envelope format version
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest plaintext accepted by `seal` (1MB)
pub const MAX_PLAINTEXT_SIZE: usize = 1024 * 1024;

/// Largest frame accepted off the wire (10MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Default configuration values
pub mod defaults {
    /// Default port for inbound frames
    pub const DEFAULT_PORT: u16 = 8000;

    /// Default accepted clock skew in seconds (5 minutes)
    pub const DEFAULT_MAX_CLOCK_SKEW: u64 = 300;
}
