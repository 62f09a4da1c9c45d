//! Inbound message dispatcher.
//!
//! Three independently bounded stages:
//!
//! 1. An accept loop limited to `max_handlers` concurrent connection handlers.
//! 2. Handlers that read exactly one frame per connection and push it onto a
//!    bounded queue without waiting. A full queue drops the frame.
//! 3. A fixed set of crypto workers that drain the queue in order, verify and
//!    decrypt each envelope on the blocking pool, consult the replay guard
//!    and hand the plaintext to the registered callback.
//!
//! A failure in one frame is logged and counted; it never affects another.

use crate::crypto::envelope::{open, Envelope};
use crate::crypto::{Fingerprint, Identity, IdentityStore};
use crate::transport::protocol::read_frame;
use crate::transport::replay::ReplayGuard;
use crate::utils::{MessengerConfig, MessengerError, NetworkError, ProtocolError, Result};
use chrono::TimeZone;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Callback receiving every verified, decrypted, non-replayed message
///
/// Called inline on the crypto worker that opened the envelope.
pub type InboundHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// A message delivered to the application
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Sender's fingerprint
    pub sender: Fingerprint,
    /// Sender's display name from the local peer directory
    pub sender_name: String,
    /// Message id chosen by the sender
    pub message_id: Uuid,
    /// Sender's clock at sealing time, unix seconds
    pub timestamp: i64,
    /// Decrypted payload
    pub plaintext: Vec<u8>,
}

impl InboundMessage {
    /// Payload as text, replacing invalid UTF-8
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.plaintext).into_owned()
    }

    /// Sender's timestamp as a date
    pub fn sent_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::Utc.timestamp_opt(self.timestamp, 0).single()
    }
}

/// Dispatcher counters
#[derive(Debug, Default)]
pub struct DispatcherStats {
    accepted: AtomicU64,
    queued: AtomicU64,
    delivered: AtomicU64,
    saturated: AtomicU64,
    rejected: AtomicU64,
}

impl DispatcherStats {
    /// Connections accepted
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Frames placed on the queue
    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    /// Messages handed to the callback
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Frames dropped because the queue was full
    pub fn saturated(&self) -> u64 {
        self.saturated.load(Ordering::Relaxed)
    }

    /// Frames that failed decoding, lookup, verification, decryption or replay checks
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct QueuedFrame {
    bytes: Vec<u8>,
    peer: SocketAddr,
}

#[derive(Debug, Clone)]
struct Limits {
    accept_backlog: u32,
    read_timeout: Duration,
    max_frame_size: usize,
    max_handlers: usize,
    queue_capacity: usize,
    crypto_workers: usize,
    max_skew: u64,
}

/// State shared with the spawned accept loop, handlers and workers
struct Shared {
    identity: Identity,
    store: Arc<IdentityStore>,
    replay: Arc<ReplayGuard>,
    handler: RwLock<Option<InboundHandler>>,
    stats: DispatcherStats,
    limits: Limits,
    queue: mpsc::Sender<QueuedFrame>,
}

impl Shared {
    fn enqueue(&self, bytes: Vec<u8>, peer: SocketAddr) -> Result<()> {
        match self.queue.try_send(QueuedFrame { bytes, peer }) {
            Ok(()) => {
                self.stats.queued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.saturated.fetch_add(1, Ordering::Relaxed);
                Err(ProtocolError::QueueSaturated {
                    capacity: self.limits.queue_capacity,
                }
                .into())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(MessengerError::unexpected("dispatcher queue closed"))
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let bytes = tokio::time::timeout(
            self.limits.read_timeout,
            read_frame(&mut stream, self.limits.max_frame_size),
        )
        .await
        .map_err(|_| NetworkError::Timeout {
            operation: format!("read frame from {}", peer),
        })??;

        self.enqueue(bytes, peer)
    }

    async fn process(&self, frame: QueuedFrame) -> Result<InboundMessage> {
        let envelope = Envelope::from_bytes(&frame.bytes)?;
        let sender = self.store.resolve(&envelope.sender().to_hex()).await?;

        let identity = self.identity.clone();
        let sender_key = Arc::clone(&sender.public_key);
        let max_skew = self.limits.max_skew;
        let (envelope, plaintext) = tokio::task::spawn_blocking(move || {
            open(&envelope, &identity, sender_key.as_ref(), max_skew)
                .map(|plaintext| (envelope, plaintext))
        })
        .await??;

        self.replay.check(&envelope.message_id, envelope.timestamp)?;

        Ok(InboundMessage {
            sender: sender.fingerprint,
            sender_name: sender.name,
            message_id: envelope.id(),
            timestamp: envelope.timestamp,
            plaintext,
        })
    }

    async fn deliver(&self, frame: QueuedFrame) {
        let peer = frame.peer;
        match self.process(frame).await {
            Ok(message) => {
                log::debug!(
                    "Message {} from {} via {}",
                    message.message_id,
                    message.sender.short(),
                    peer
                );
                let handler = self.handler.read().await.clone();
                match handler {
                    Some(handler) => {
                        handler(message);
                        self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    None => log::warn!("No inbound callback registered; dropping message from {}", peer),
                }
            }
            Err(e) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                if e.is_security_violation() {
                    log::warn!("Rejected frame from {}: {}", peer, e);
                } else {
                    log::debug!("Dropped frame from {}: {}", peer, e);
                }
            }
        }
    }
}

/// Accepts inbound frames and delivers verified messages to a callback
pub struct Dispatcher {
    shared: Arc<Shared>,
    receiver: Arc<Mutex<mpsc::Receiver<QueuedFrame>>>,
    stop_accepting: watch::Sender<bool>,
    stop_workers: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Dispatcher {
    /// Create a dispatcher for `identity`; nothing runs until [`start`](Self::start)
    pub fn new(
        identity: Identity,
        store: Arc<IdentityStore>,
        replay: Arc<ReplayGuard>,
        config: &MessengerConfig,
    ) -> Self {
        let limits = Limits {
            accept_backlog: config.network.accept_backlog,
            read_timeout: config.network.read_timeout(),
            max_frame_size: config.network.max_frame_size,
            max_handlers: config.performance.max_handlers,
            queue_capacity: config.performance.queue_capacity,
            crypto_workers: config.performance.crypto_workers,
            max_skew: config.crypto.max_clock_skew,
        };
        let (queue, receiver) = mpsc::channel(limits.queue_capacity);
        let (stop_accepting, _) = watch::channel(false);
        let (stop_workers, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                identity,
                store,
                replay,
                handler: RwLock::new(None),
                stats: DispatcherStats::default(),
                limits,
                queue,
            }),
            receiver: Arc::new(Mutex::new(receiver)),
            stop_accepting,
            stop_workers,
            accept_task: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Install the callback, replacing any previous one
    pub async fn set_handler(&self, handler: InboundHandler) {
        *self.shared.handler.write().await = Some(handler);
    }

    /// Counters
    pub fn stats(&self) -> &DispatcherStats {
        &self.shared.stats
    }

    /// Whether the accept loop is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Push a raw frame onto the queue as if it had arrived from `peer`
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::QueueSaturated` when the queue is full.
    pub fn enqueue_frame(&self, bytes: Vec<u8>, peer: SocketAddr) -> Result<()> {
        self.shared.enqueue(bytes, peer)
    }

    /// Bind `address`, then spawn the accept loop and crypto workers
    ///
    /// Returns the bound address, which differs from `address` when port 0
    /// was requested.
    pub async fn start(&self, address: &str) -> Result<SocketAddr> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(MessengerError::unexpected("dispatcher already running"));
        }

        let listener = match self.bind(address).await {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false, Ordering::Release);
                return Err(e);
            }
        };
        let local_addr = listener.local_addr().map_err(|e| NetworkError::Transport {
            reason: e.to_string(),
        })?;
        self.stop_accepting.send_replace(false);
        self.stop_workers.send_replace(false);

        let mut workers = self.workers.lock().await;
        for worker in 0..self.shared.limits.crypto_workers.max(1) {
            workers.push(tokio::spawn(run_worker(
                worker,
                Arc::clone(&self.shared),
                Arc::clone(&self.receiver),
                self.stop_workers.subscribe(),
            )));
        }
        *self.accept_task.lock().await = Some(tokio::spawn(run_accept_loop(
            listener,
            Arc::clone(&self.shared),
            self.stop_accepting.subscribe(),
        )));

        log::info!(
            "Listening on {} ({} handlers, {} workers, queue {})",
            local_addr,
            self.shared.limits.max_handlers,
            self.shared.limits.crypto_workers,
            self.shared.limits.queue_capacity
        );
        Ok(local_addr)
    }

    /// Stop accepting, let workers drain queued frames, and join every task
    ///
    /// Connections already accepted keep their handler until the frame is
    /// queued or the read timeout expires, so shutdown can take up to
    /// `read_timeout`. Workers are stopped only after every handler is done.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        self.stop_accepting.send_replace(true);
        let accept_task = self.accept_task.lock().await.take();
        if let Some(task) = accept_task {
            if let Err(e) = task.await {
                log::error!("Accept loop failed: {}", e);
            }
        }

        self.stop_workers.send_replace(true);
        let workers: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                log::error!("Crypto worker failed: {}", e);
            }
        }
        log::info!("Dispatcher stopped");
    }

    async fn bind(&self, address: &str) -> Result<TcpListener> {
        let invalid = || NetworkError::InvalidAddress {
            address: address.to_string(),
        };
        let addr = tokio::net::lookup_host(address)
            .await
            .map_err(|_| invalid())?
            .next()
            .ok_or_else(invalid)?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .and_then(|socket| {
            socket.set_reuseaddr(true)?;
            socket.set_nodelay(true)?;
            socket.bind(addr)?;
            Ok(socket)
        })
        .map_err(|e| NetworkError::ConnectionFailed {
            peer: addr.to_string(),
            reason: format!("bind failed: {}", e),
        })?;

        Ok(socket
            .listen(self.shared.limits.accept_backlog)
            .map_err(|e| NetworkError::ConnectionFailed {
                peer: addr.to_string(),
                reason: format!("listen failed: {}", e),
            })?)
    }
}

async fn run_accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let max_handlers = shared.limits.max_handlers.max(1);
    let permits = Arc::new(Semaphore::new(max_handlers));

    loop {
        let permit = tokio::select! {
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        };

        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Accept failed: {}", e);
                    continue;
                }
            },
            _ = shutdown.changed() => break,
        };

        shared.stats.accepted.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = shared.handle_connection(stream, peer).await {
                if matches!(e, MessengerError::Protocol(ProtocolError::QueueSaturated { .. })) {
                    log::warn!("Dropped frame from {}: {}", peer, e);
                } else {
                    log::debug!("Connection from {} failed: {}", peer, e);
                }
            }
        });
    }

    drop(listener);

    // Every handler holds a permit until its frame is queued or dropped
    let in_flight = max_handlers - permits.available_permits();
    if in_flight > 0 {
        log::debug!("Waiting for {} connection handlers", in_flight);
    }
    let all = u32::try_from(max_handlers).unwrap_or(u32::MAX);
    if permits.acquire_many(all).await.is_err() {
        log::warn!("Handler permits closed before shutdown");
    }

    log::debug!("Accept loop stopped");
}

async fn run_worker(
    id: usize,
    shared: Arc<Shared>,
    receiver: Arc<Mutex<mpsc::Receiver<QueuedFrame>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    log::debug!("Crypto worker {} started", id);

    loop {
        let next = tokio::select! {
            frame = async { receiver.lock().await.recv().await } => frame,
            _ = shutdown.changed() => None,
        };
        match next {
            Some(frame) => shared.deliver(frame).await,
            None => break,
        }
    }

    // Drain whatever was queued before shutdown
    loop {
        let frame = receiver.lock().await.try_recv();
        match frame {
            Ok(frame) => shared.deliver(frame).await,
            Err(_) => break,
        }
    }

    log::debug!("Crypto worker {} stopped", id);
}
