// Broadcast server: single-writer backlog plus non-blocking fan-out to
// per-subscriber bounded queues.
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use plume_backlog::{Backlog, BacklogConfig, BacklogError};
use plume_transport::FeedListener;
use plume_wire::FeedMessage;
use slab::Slab;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

mod codec;
mod connection;

/// Tuning for the broadcast endpoint.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Per-subscriber outbound queue depth; a subscriber that falls this
    // far behind is forcibly disconnected.
    pub queue_depth: usize,
    // Live-delivery coalescing limits.
    pub batch_max_messages: usize,
    pub batch_max_bytes: usize,
    pub batch_max_delay: Duration,
    // Budget for the Resume/Hello exchange on a new connection.
    pub handshake_timeout: Duration,
    // Max frame size accepted from subscribers.
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            queue_depth: 256,
            batch_max_messages: 64,
            batch_max_bytes: 256 * 1024,
            batch_max_delay: Duration::from_micros(250),
            handshake_timeout: Duration::from_secs(5),
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

// One queued fan-out item. Messages are shared, never copied per
// subscriber.
#[derive(Debug, Clone)]
pub(crate) enum Outbound {
    Message(Arc<FeedMessage>),
    Confirmed(u64),
}

#[derive(Debug)]
struct SubscriberSlot {
    // Slab slots are reused; the serial disambiguates a stale removal
    // from the slot's next occupant.
    serial: u64,
    sender: mpsc::Sender<Outbound>,
    cancel: Arc<watch::Sender<bool>>,
}

// Snapshot used by the broadcast hot path: lock-free read, no per-send
// allocation.
#[derive(Debug, Clone)]
struct SubscriberEntry {
    id: usize,
    serial: u64,
    sender: mpsc::Sender<Outbound>,
    cancel: Arc<watch::Sender<bool>>,
}

/// RAII handle that unregisters a subscriber on drop.
#[derive(Debug)]
pub(crate) struct SubscriberGuard {
    server: Weak<BroadcastServer>,
    id: usize,
    serial: u64,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        if let Some(server) = self.server.upgrade() {
            server.remove_subscribers(&[(self.id, self.serial)]);
        }
    }
}

pub(crate) struct Registration {
    pub(crate) guard: SubscriberGuard,
    pub(crate) queue: mpsc::Receiver<Outbound>,
    pub(crate) cancel: watch::Receiver<bool>,
}

/// Push endpoint for one feed.
///
/// Owns the backlog exclusively: `broadcast` is the only append path, and
/// new connections replay from it before switching to live delivery. Fan
/// out never blocks on a subscriber; a full queue evicts that subscriber
/// instead of stalling the producer or skipping a sequence.
///
/// ```
/// use bytes::Bytes;
/// use plume_backlog::BacklogConfig;
/// use plume_server::{BroadcastServer, ServerConfig};
/// use plume_wire::FeedMessage;
///
/// let server = BroadcastServer::new(ServerConfig::default(), BacklogConfig::default());
/// server
///     .broadcast(FeedMessage::new(1, Bytes::from_static(b"tx"), None))
///     .expect("broadcast");
/// assert_eq!(server.head(), Some(1));
/// ```
#[derive(Debug)]
pub struct BroadcastServer {
    config: ServerConfig,
    backlog: Backlog,
    subscribers_snapshot: ArcSwap<Vec<SubscriberEntry>>,
    subscribers: Mutex<Slab<SubscriberSlot>>,
    next_serial: std::sync::atomic::AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl BroadcastServer {
    pub fn new(config: ServerConfig, backlog: BacklogConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            backlog: Backlog::new(backlog),
            subscribers_snapshot: ArcSwap::from_pointee(Vec::new()),
            subscribers: Mutex::new(Slab::new()),
            next_serial: std::sync::atomic::AtomicU64::new(0),
            shutdown,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Newest sequence this feed has broadcast, if any.
    pub fn head(&self) -> Option<u64> {
        self.backlog.head()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Append to the backlog and fan out to every live subscriber.
    ///
    /// A non-contiguous sequence is an upstream sequencing fault: nothing
    /// is delivered and the error must be treated as fatal by the caller.
    /// Returns the number of subscribers the message was queued for.
    pub fn broadcast(&self, message: FeedMessage) -> Result<usize, BacklogError> {
        // Append first so a concurrent catch-up never misses this message.
        self.backlog.append(message.clone())?;
        let sent = self.fan_out(Outbound::Message(Arc::new(message)));
        metrics::counter!("plume_server_broadcast_total").increment(1);
        Ok(sent)
    }

    /// Record parent-chain settlement through `seq`: prune the backlog
    /// prefix and notify subscribers.
    pub fn confirm(&self, seq: u64) {
        self.backlog.confirm(seq);
        self.fan_out(Outbound::Confirmed(seq));
    }

    fn fan_out(&self, item: Outbound) -> usize {
        let snapshot = self.subscribers_snapshot.load_full();
        let mut sent = 0usize;
        let mut stale = Vec::new();
        for subscriber in snapshot.iter() {
            match subscriber.sender.try_send(item.clone()) {
                Ok(()) => sent += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // This feed may never gap, so an overflowing
                    // subscriber is evicted rather than skipped past.
                    tracing::warn!(subscriber = subscriber.id, "evicting slow feed subscriber");
                    metrics::counter!("plume_server_slow_evictions_total").increment(1);
                    let _ = subscriber.cancel.send(true);
                    stale.push((subscriber.id, subscriber.serial));
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    stale.push((subscriber.id, subscriber.serial));
                }
            }
        }
        if !stale.is_empty() {
            self.remove_subscribers(&stale);
        }
        sent
    }

    pub(crate) fn register_subscriber(self: &Arc<Self>) -> Registration {
        let (sender, queue) = mpsc::channel(self.config.queue_depth);
        let (cancel_tx, cancel) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);
        let serial = self
            .next_serial
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let id = {
            let mut subscribers = self.subscribers.lock();
            let id = subscribers.insert(SubscriberSlot {
                serial,
                sender,
                cancel: Arc::clone(&cancel_tx),
            });
            self.rebuild_snapshot(&subscribers);
            id
        };
        metrics::gauge!("plume_server_subscribers").set(self.subscriber_count() as f64);
        Registration {
            guard: SubscriberGuard {
                server: Arc::downgrade(self),
                id,
                serial,
            },
            queue,
            cancel,
        }
    }

    fn remove_subscribers(&self, targets: &[(usize, u64)]) {
        let mut subscribers = self.subscribers.lock();
        let mut removed = false;
        for &(id, serial) in targets {
            // Only remove the occupant the caller actually meant.
            if subscribers.get(id).map_or(false, |slot| slot.serial == serial) {
                subscribers.remove(id);
                removed = true;
            }
        }
        if removed {
            self.rebuild_snapshot(&subscribers);
            metrics::gauge!("plume_server_subscribers").set(subscribers.len() as f64);
        }
    }

    fn rebuild_snapshot(&self, subscribers: &Slab<SubscriberSlot>) {
        let mut snapshot = Vec::with_capacity(subscribers.len());
        for (id, slot) in subscribers.iter() {
            snapshot.push(SubscriberEntry {
                id,
                serial: slot.serial,
                sender: slot.sender.clone(),
                cancel: Arc::clone(&slot.cancel),
            });
        }
        self.subscribers_snapshot.store(Arc::new(snapshot));
    }

    pub(crate) fn range(&self, from: u64) -> Result<Vec<FeedMessage>, BacklogError> {
        self.backlog.range(from)
    }

    /// Accept subscriber connections until `shutdown` is called.
    pub async fn serve(self: Arc<Self>, listener: FeedListener) -> anyhow::Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        // `subscribe` marks the current value as seen; handle a shutdown
        // that raced the accept loop's start.
        if *shutdown.borrow() {
            listener.close();
            return Ok(());
        }
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    listener.close();
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let conn = accepted?;
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(err) = connection::handle_connection(server, conn).await {
                            tracing::warn!(error = %err, "feed connection handler failed");
                        }
                    });
                }
            }
        }
    }

    /// Stop the accept loop and close every subscriber connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let snapshot = self.subscribers_snapshot.load_full();
        for subscriber in snapshot.iter() {
            let _ = subscriber.cancel.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn message(seq: u64) -> FeedMessage {
        FeedMessage::new(seq, Bytes::from_static(b"payload"), None)
    }

    fn server() -> Arc<BroadcastServer> {
        Arc::new(BroadcastServer::new(
            ServerConfig::default(),
            BacklogConfig::default(),
        ))
    }

    #[tokio::test]
    async fn broadcast_appends_and_fans_out() {
        let server = server();
        let mut registration = server.register_subscriber();
        let sent = server.broadcast(message(1)).expect("broadcast");
        assert_eq!(sent, 1);
        assert_eq!(server.head(), Some(1));
        match registration.queue.recv().await.expect("item") {
            Outbound::Message(delivered) => assert_eq!(delivered.sequence_number, 1),
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_contiguous_broadcast_is_fatal_and_delivers_nothing() {
        let server = server();
        let mut registration = server.register_subscriber();
        server.broadcast(message(1)).expect("broadcast");
        let err = server.broadcast(message(3)).expect_err("gap");
        assert_eq!(err, BacklogError::NonContiguous { expected: 2, got: 3 });
        // Only the valid message reached the subscriber.
        let first = registration.queue.recv().await.expect("item");
        assert!(matches!(first, Outbound::Message(m) if m.sequence_number == 1));
        assert!(registration.queue.try_recv().is_err());
        assert_eq!(server.head(), Some(1));
    }

    #[tokio::test]
    async fn slow_subscriber_is_evicted_not_skipped() {
        let config = ServerConfig {
            queue_depth: 1,
            ..ServerConfig::default()
        };
        let server = Arc::new(BroadcastServer::new(config, BacklogConfig::default()));
        let slow = server.register_subscriber();
        let mut healthy = server.register_subscriber();

        server.broadcast(message(1)).expect("broadcast");
        // Healthy keeps draining its queue; the slow one never does.
        let first = healthy.queue.recv().await.expect("item");
        assert!(matches!(first, Outbound::Message(m) if m.sequence_number == 1));

        // The slow subscriber's queue (depth 1) is still full; the next
        // broadcast must evict it while the healthy one keeps receiving.
        let sent = server.broadcast(message(2)).expect("broadcast");
        assert_eq!(sent, 1);
        assert!(*slow.cancel.borrow());
        assert_eq!(server.subscriber_count(), 1);

        let second = healthy.queue.recv().await.expect("item");
        assert!(matches!(second, Outbound::Message(m) if m.sequence_number == 2));
        drop(slow);
    }

    #[tokio::test]
    async fn confirm_prunes_backlog_and_notifies() {
        let server = server();
        let mut registration = server.register_subscriber();
        for seq in 1..=3 {
            server.broadcast(message(seq)).expect("broadcast");
        }
        server.confirm(2);
        let mut items = Vec::new();
        while let Ok(item) = registration.queue.try_recv() {
            items.push(item);
        }
        assert_eq!(items.len(), 4);
        assert!(matches!(items[3], Outbound::Confirmed(2)));
        // Replay below the confirmation is no longer served.
        assert!(server.range(1).is_err());
        assert_eq!(server.range(3).expect("range").len(), 1);
    }

    #[tokio::test]
    async fn dropping_registration_unregisters() {
        let server = server();
        let registration = server.register_subscriber();
        assert_eq!(server.subscriber_count(), 1);
        drop(registration);
        assert_eq!(server.subscriber_count(), 0);
        // Fan-out after disconnect reaches nobody and does not error.
        let sent = server.broadcast(message(1)).expect("broadcast");
        assert_eq!(sent, 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_subscribers() {
        let server = server();
        let registration = server.register_subscriber();
        server.shutdown();
        assert!(*registration.cancel.borrow());
    }
}
