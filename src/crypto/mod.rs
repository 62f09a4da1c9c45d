//! Cryptographic primitives and identity management.
//!
//! This module provides the key capabilities, local identity and peer
//! storage, and the envelope codec used to seal and open every message.

pub mod envelope;
pub mod identity;
pub mod keystore;
pub mod symmetric;

pub use envelope::{open, seal, Envelope};
pub use identity::*;
pub use keystore::{FileStorage, IdentityStore, MemoryStorage, Peer, Storage};
