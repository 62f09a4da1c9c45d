//! Outbound delivery: single sends and bounded fan-out.

use crate::crypto::envelope::seal;
use crate::crypto::{Fingerprint, Identity, Peer};
use crate::transport::pool::ConnectionPool;
use crate::transport::protocol::write_frame;
use crate::utils::{ProtocolError, Result};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Seals and delivers envelopes through a [`ConnectionPool`]
pub struct BatchSender {
    pool: Arc<ConnectionPool>,
    concurrency: usize,
}

impl BatchSender {
    /// Create a sender fanning out to at most `concurrency` peers at once
    pub fn new(pool: Arc<ConnectionPool>, concurrency: usize) -> Self {
        Self {
            pool,
            concurrency: concurrency.max(1),
        }
    }

    /// Seal `plaintext` for `peer` and deliver it, returning the message id
    pub async fn send_one(&self, peer: &Peer, plaintext: &[u8], sender: &Identity) -> Result<Uuid> {
        let identity = sender.clone();
        let recipient = Arc::clone(&peer.public_key);
        let payload = plaintext.to_vec();
        let envelope =
            tokio::task::spawn_blocking(move || seal(&payload, &identity, recipient.as_ref()))
                .await??;

        self.deliver(&peer.host, peer.port, &envelope.to_bytes()?).await?;
        log::debug!("Sent message {} to {}", envelope.id(), peer);
        Ok(envelope.id())
    }

    /// Send `plaintext` to every recipient concurrently
    ///
    /// Each recipient gets its own result; one failure never affects another.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::NoRecipients` if `recipients` is empty.
    pub async fn broadcast(
        &self,
        recipients: &[Peer],
        plaintext: &[u8],
        sender: &Identity,
    ) -> Result<HashMap<Fingerprint, Result<()>>> {
        if recipients.is_empty() {
            return Err(ProtocolError::NoRecipients.into());
        }

        let concurrency = recipients.len().min(self.concurrency);
        let results: HashMap<Fingerprint, Result<()>> = stream::iter(recipients)
            .map(|peer| async move {
                let result = self.send_one(peer, plaintext, sender).await.map(|_| ());
                if let Err(e) = &result {
                    log::warn!("Broadcast to {} failed: {}", peer, e);
                }
                (peer.fingerprint, result)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let ok = results.values().filter(|r| r.is_ok()).count();
        log::info!("Broadcast delivered to {}/{} peers", ok, recipients.len());
        Ok(results)
    }

    async fn deliver(&self, host: &str, port: u16, frame: &[u8]) -> Result<()> {
        let mut conn = self.pool.acquire(host, port).await?;

        match write_frame(conn.stream(), frame).await {
            Ok(()) => {
                self.pool.release(host, port, conn, true);
                Ok(())
            }
            Err(e) if conn.is_reused() => {
                log::debug!("Pooled connection to {}:{} failed ({}), retrying fresh", host, port, e);
                drop(conn);

                let mut fresh = self.pool.acquire_fresh(host, port).await?;
                let result = write_frame(fresh.stream(), frame).await;
                self.pool.release(host, port, fresh, result.is_ok());
                result
            }
            Err(e) => {
                self.pool.release(host, port, conn, false);
                Err(e)
            }
        }
    }
}
