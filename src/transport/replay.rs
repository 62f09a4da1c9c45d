//! Replay protection for inbound envelopes.
//!
//! The guard remembers the ids of recently admitted messages in a bounded
//! set. Once full, the oldest id (by admission order) is forgotten; the
//! clock-skew window keeps forgotten ids from being replayed later because
//! their timestamps will have gone stale.

use crate::crypto::envelope::MESSAGE_ID_LENGTH;
use crate::utils::{ProtocolError, Result};
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use uuid::Uuid;

type MessageId = [u8; MESSAGE_ID_LENGTH];

#[derive(Debug, Default)]
struct Seen {
    ids: HashSet<MessageId>,
    order: VecDeque<(MessageId, i64)>,
}

/// Bounded record of admitted message ids
#[derive(Debug)]
pub struct ReplayGuard {
    seen: Mutex<Seen>,
    capacity: usize,
    max_skew: u64,
}

impl ReplayGuard {
    /// Create a guard remembering up to `capacity` ids
    pub fn new(capacity: usize, max_skew: u64) -> Self {
        Self {
            seen: Mutex::new(Seen::default()),
            capacity: capacity.max(1),
            max_skew,
        }
    }

    /// Admit a message, returning false for duplicates and stale timestamps
    pub fn admit(&self, message_id: &MessageId, timestamp: i64) -> bool {
        self.check(message_id, timestamp).is_ok()
    }

    /// Like [`admit`](Self::admit), but reports why a message was refused
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::StaleMessage` or `ProtocolError::Duplicate`.
    pub fn check(&self, message_id: &MessageId, timestamp: i64) -> Result<()> {
        crate::crypto::envelope::check_skew(timestamp, self.max_skew)?;

        let mut seen = self
            .seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if !seen.ids.insert(*message_id) {
            return Err(ProtocolError::Duplicate {
                message_id: Uuid::from_bytes(*message_id).to_string(),
            }
            .into());
        }
        seen.order.push_back((*message_id, timestamp));

        while seen.order.len() > self.capacity {
            if let Some((oldest, _)) = seen.order.pop_front() {
                seen.ids.remove(&oldest);
            }
        }
        Ok(())
    }

    /// Whether `message_id` is currently remembered
    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.seen
            .lock()
            .map(|seen| seen.ids.contains(message_id))
            .unwrap_or(false)
    }

    /// Number of remembered ids
    pub fn len(&self) -> usize {
        self.seen.lock().map(|seen| seen.ids.len()).unwrap_or(0)
    }

    /// Whether nothing has been admitted yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of remembered ids
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::MessengerError;
    use std::sync::Arc;

    fn id(n: u8) -> MessageId {
        [n; MESSAGE_ID_LENGTH]
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    #[test]
    fn test_duplicate_rejected() {
        let guard = ReplayGuard::new(10, 300);
        assert!(guard.admit(&id(1), now()));
        assert!(!guard.admit(&id(1), now()));

        let err = guard.check(&id(1), now()).unwrap_err();
        assert!(matches!(err, MessengerError::Protocol(ProtocolError::Duplicate { .. })));
    }

    #[test]
    fn test_stale_rejected_and_not_recorded() {
        let guard = ReplayGuard::new(10, 300);
        assert!(!guard.admit(&id(1), now() - 600));
        assert!(!guard.contains(&id(1)));
        assert!(guard.is_empty());
    }

    #[test]
    fn test_insertion_order_eviction() {
        let guard = ReplayGuard::new(3, 300);
        for n in 1..=4 {
            assert!(guard.admit(&id(n), now()));
        }
        assert_eq!(guard.len(), 3);
        assert!(!guard.contains(&id(1)));
        assert!(guard.contains(&id(4)));

        // The evicted id is admissible again while its timestamp is fresh.
        assert!(guard.admit(&id(1), now()));
        assert!(!guard.contains(&id(2)));
    }

    #[test]
    fn test_concurrent_submission_admits_once() {
        let guard = Arc::new(ReplayGuard::new(100, 300));
        let timestamp = now();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let guard = Arc::clone(&guard);
                std::thread::spawn(move || guard.admit(&id(7), timestamp))
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(guard.len(), 1);
    }
}
