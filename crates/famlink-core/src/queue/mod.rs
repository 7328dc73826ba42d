//! Offline-durable message delivery queue.
//!
//! Accepts outbound messages, persists them, and drains them against the
//! peer manager's broadcast capability until delivered or permanently
//! failed. Callers never block on the network: `enqueue` persists the
//! entry and returns, and a background pass running on a fixed cadence
//! (while online) does the rest with exponential backoff plus jitter.
//!
//! Delivery means "handed to the transport for every currently verified
//! peer" — there is no per-peer acknowledgment, deliberately. An entry
//! that exhausts its retry budget stays inspectable in `failed` state and
//! is only retried by explicit [`DeliveryQueue::retry`].

mod store;

pub use store::{QueueStore, SqliteQueueStore};

use crate::error::Result;
use crate::protocol::{hex_id, now_millis, DataMessage};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the queue's event broadcast channel.
const EVENT_BUFFER: usize = 100;

/// The delivery path the queue drains into.
///
/// Implemented by the peer manager: broadcast fans out to every currently
/// verified peer, and the peer count gates whether a drain attempt has any
/// network path at all.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Number of peers a broadcast would currently reach.
    async fn verified_peer_count(&self) -> usize;

    /// Fan a message out to every verified peer.
    async fn broadcast(&self, message: &DataMessage) -> Result<usize>;
}

/// Host connectivity signal.
pub trait Connectivity: Send + Sync {
    /// Whether the host currently considers itself online.
    fn is_online(&self) -> bool;

    /// Watch for online/offline transitions.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// A settable [`Connectivity`] implementation.
///
/// The embedding application flips this from whatever connectivity signal
/// the host environment exposes.
#[derive(Clone)]
pub struct ConnectivityFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityFlag {
    /// Create with an initial state.
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Update the connectivity state.
    pub fn set_online(&self, online: bool) {
        self.tx.send_replace(online);
    }
}

impl Connectivity for ConnectivityFlag {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Unique identifier for a queue entry, distinct from the message's own id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryId(#[serde(with = "hex_id")] pub [u8; 16]);

impl EntryId {
    /// Generate a random entry id.
    pub fn random() -> Self {
        Self(crate::crypto::random_bytes())
    }
}

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryId({})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Queue entry status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum EntryStatus {
    /// Awaiting its next delivery attempt.
    Pending = 0,
    /// A delivery attempt is in flight.
    Sending = 1,
    /// Retry budget exhausted; only explicit retry revives it.
    Failed = 2,
}

impl From<i32> for EntryStatus {
    fn from(value: i32) -> Self {
        match value {
            1 => Self::Sending,
            2 => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// One outbound message awaiting confirmed delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    /// Queue entry id.
    pub id: EntryId,
    /// The application message to deliver.
    pub message: DataMessage,
    /// Delivery attempts so far.
    pub attempts: u32,
    /// Milliseconds since the Unix epoch of the last attempt; 0 if none.
    pub last_attempt: i64,
    /// Earliest time of the next eligible attempt, ms since the epoch.
    pub next_retry: i64,
    /// Current status.
    pub status: EntryStatus,
}

/// Counts of entries by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Entries awaiting an attempt.
    pub pending: usize,
    /// Entries with an attempt in flight.
    pub sending: usize,
    /// Permanently failed entries.
    pub failed: usize,
}

/// Configuration for a [`DeliveryQueue`].
#[derive(Debug, Clone)]
pub struct DeliveryQueueConfig {
    /// Attempts before an entry is marked failed.
    pub max_retries: u32,
    /// Backoff unit; attempt `n` waits `min(base * 2^n, max_delay)`.
    pub base_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
    /// Jitter fraction added on top of the delay (0.3 = up to +30%).
    pub jitter: f64,
    /// Cadence of the background drain pass.
    pub drain_interval: Duration,
}

impl Default for DeliveryQueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(60_000),
            jitter: 0.3,
            drain_interval: Duration::from_millis(1000),
        }
    }
}

/// Backoff delay for the given attempt number, without jitter.
pub fn backoff_delay(config: &DeliveryQueueConfig, attempt: u32) -> Duration {
    let base = config.base_delay.as_millis() as u64;
    let delay = base.saturating_mul(2u64.saturating_pow(attempt.min(32)));
    Duration::from_millis(delay.min(config.max_delay.as_millis() as u64))
}

/// Events emitted by the queue.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// An entry was added.
    Queued {
        /// The entry's id.
        entry_id: EntryId,
    },
    /// An entry was broadcast and removed.
    Sent {
        /// The entry's id.
        entry_id: EntryId,
    },
    /// One delivery attempt failed; the entry will be retried unless its
    /// budget is exhausted.
    AttemptFailed {
        /// The entry's id.
        entry_id: EntryId,
        /// The attempt number that failed.
        attempt: u32,
        /// Why the attempt failed.
        reason: String,
    },
    /// An entry exhausted its retry budget.
    Failed {
        /// The entry's id.
        entry_id: EntryId,
    },
    /// A successful delivery left the queue empty.
    QueueEmpty,
}

struct QueueInner {
    config: DeliveryQueueConfig,
    sink: Arc<dyn Broadcaster>,
    store: Arc<dyn QueueStore>,
    connectivity: Arc<dyn Connectivity>,
    entries: Mutex<HashMap<EntryId, QueuedMessage>>,
    event_tx: broadcast::Sender<QueueEvent>,
    notify: Notify,
    drain_task: Mutex<Option<JoinHandle<()>>>,
}

/// The offline-durable delivery queue.
///
/// Cheap to clone; all clones share the same entry set.
#[derive(Clone)]
pub struct DeliveryQueue {
    inner: Arc<QueueInner>,
}

impl DeliveryQueue {
    /// Create a queue, reloading any persisted entries.
    ///
    /// Entries persisted mid-attempt (`sending`) are reset to `pending`
    /// so an interrupted process resumes them. A store that fails to load
    /// yields an empty queue rather than an error; the queue then runs
    /// memory-only until persistence recovers.
    pub fn new(
        config: DeliveryQueueConfig,
        sink: Arc<dyn Broadcaster>,
        store: Arc<dyn QueueStore>,
        connectivity: Arc<dyn Connectivity>,
    ) -> (Self, broadcast::Receiver<QueueEvent>) {
        let (event_tx, event_rx) = broadcast::channel(EVENT_BUFFER);

        let mut entries = HashMap::new();
        match store.load() {
            Ok(loaded) => {
                for mut entry in loaded {
                    if entry.status == EntryStatus::Sending {
                        entry.status = EntryStatus::Pending;
                        entry.next_retry = now_millis();
                    }
                    entries.insert(entry.id, entry);
                }
            }
            Err(e) => warn!(error = %e, "failed to load queue, starting empty"),
        }
        info!(count = entries.len(), "delivery queue loaded");

        let queue = Self {
            inner: Arc::new(QueueInner {
                config,
                sink,
                store,
                connectivity,
                entries: Mutex::new(entries),
                event_tx,
                notify: Notify::new(),
                drain_task: Mutex::new(None),
            }),
        };

        (queue, event_rx)
    }

    /// Subscribe to queue events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Start the background drain loop. Idempotent.
    pub async fn start(&self) {
        let mut task = self.inner.drain_task.lock().await;
        if task.is_some() {
            return;
        }
        *task = Some(tokio::spawn(Self::drain_loop(self.inner.clone())));
    }

    /// Stop the drain loop. Entries stay persisted and in memory.
    pub async fn shutdown(&self) {
        if let Some(task) = self.inner.drain_task.lock().await.take() {
            task.abort();
        }
    }

    /// Persist a message as `pending` and trigger a drain if online.
    ///
    /// Never blocks on the network.
    pub async fn enqueue(&self, message: DataMessage) -> EntryId {
        let entry = QueuedMessage {
            id: EntryId::random(),
            message,
            attempts: 0,
            last_attempt: 0,
            next_retry: now_millis(),
            status: EntryStatus::Pending,
        };
        let entry_id = entry.id;

        {
            let mut entries = self.inner.entries.lock().await;
            entries.insert(entry_id, entry);
            Self::persist(&self.inner, &entries);
        }

        debug!(entry = %entry_id, "message enqueued");
        let _ = self.inner.event_tx.send(QueueEvent::Queued { entry_id });

        if self.inner.connectivity.is_online() {
            self.inner.notify.notify_one();
        }
        entry_id
    }

    /// Remove an entry unconditionally. Returns whether one existed.
    pub async fn dequeue(&self, entry_id: EntryId) -> bool {
        let mut entries = self.inner.entries.lock().await;
        let removed = entries.remove(&entry_id).is_some();
        if removed {
            Self::persist(&self.inner, &entries);
        }
        removed
    }

    /// Reset an entry (including a `failed` one) for immediate retry.
    pub async fn retry(&self, entry_id: EntryId) -> bool {
        let reset = {
            let mut entries = self.inner.entries.lock().await;
            match entries.get_mut(&entry_id) {
                Some(entry) => {
                    entry.attempts = 0;
                    entry.next_retry = now_millis();
                    entry.status = EntryStatus::Pending;
                    Self::persist(&self.inner, &entries);
                    true
                }
                None => false,
            }
        };

        if reset && self.inner.connectivity.is_online() {
            self.inner.notify.notify_one();
        }
        reset
    }

    /// Reset every `failed` entry for immediate retry.
    pub async fn retry_all(&self) {
        {
            let mut entries = self.inner.entries.lock().await;
            for entry in entries.values_mut() {
                if entry.status == EntryStatus::Failed {
                    entry.attempts = 0;
                    entry.next_retry = now_millis();
                    entry.status = EntryStatus::Pending;
                }
            }
            Self::persist(&self.inner, &entries);
        }

        if self.inner.connectivity.is_online() {
            self.inner.notify.notify_one();
        }
    }

    /// Number of entries, in any status.
    pub async fn len(&self) -> usize {
        self.inner.entries.lock().await.len()
    }

    /// Whether the queue holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.inner.entries.lock().await.is_empty()
    }

    /// Snapshot of every entry.
    pub async fn entries(&self) -> Vec<QueuedMessage> {
        self.inner.entries.lock().await.values().cloned().collect()
    }

    /// Snapshot of one entry.
    pub async fn entry(&self, entry_id: EntryId) -> Option<QueuedMessage> {
        self.inner.entries.lock().await.get(&entry_id).cloned()
    }

    /// Counts by status.
    pub async fn stats(&self) -> QueueStats {
        let entries = self.inner.entries.lock().await;
        let mut stats = QueueStats::default();
        for entry in entries.values() {
            match entry.status {
                EntryStatus::Pending => stats.pending += 1,
                EntryStatus::Sending => stats.sending += 1,
                EntryStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Drop every entry, in memory and in the store.
    pub async fn clear(&self) {
        let mut entries = self.inner.entries.lock().await;
        entries.clear();
        if let Err(e) = self.inner.store.clear() {
            warn!(error = %e, "failed to clear queue store");
        }
    }

    /// Whether the host currently considers itself online.
    pub fn is_online(&self) -> bool {
        self.inner.connectivity.is_online()
    }

    async fn drain_loop(inner: Arc<QueueInner>) {
        let mut online_rx = inner.connectivity.subscribe();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(inner.config.drain_interval) => {}
                _ = inner.notify.notified() => {}
                changed = online_rx.changed() => {
                    match changed {
                        Ok(()) if inner.connectivity.is_online() => {
                            info!("connectivity restored, draining");
                        }
                        Ok(()) => {
                            info!("connectivity lost, drain suspended");
                            continue;
                        }
                        Err(_) => {
                            // Signal source gone; fall back to the cadence.
                            tokio::time::sleep(inner.config.drain_interval).await;
                        }
                    }
                }
            }

            if !inner.connectivity.is_online() {
                continue;
            }
            Self::drain_once(&inner).await;
        }
    }

    /// One drain pass: attempt every eligible entry.
    async fn drain_once(inner: &Arc<QueueInner>) {
        let now = now_millis();

        // Snapshot eligible entries before touching their status, so the
        // pass never mutates the map it is iterating.
        let eligible: Vec<QueuedMessage> = {
            let mut entries = inner.entries.lock().await;
            let ids: Vec<EntryId> = entries
                .values()
                .filter(|e| e.status == EntryStatus::Pending && e.next_retry <= now)
                .map(|e| e.id)
                .collect();
            if ids.is_empty() {
                return;
            }

            let mut snapshot = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(entry) = entries.get_mut(&id) {
                    entry.status = EntryStatus::Sending;
                    entry.last_attempt = now;
                    snapshot.push(entry.clone());
                }
            }
            Self::persist(inner, &entries);
            snapshot
        };

        for entry in eligible {
            if inner.sink.verified_peer_count().await == 0 {
                debug!(entry = %entry.id, "no verified peers, rescheduling");
                Self::schedule_retry(inner, entry.id, "no verified peers").await;
                continue;
            }

            match inner.sink.broadcast(&entry.message).await {
                Ok(count) => {
                    debug!(entry = %entry.id, peers = count, "entry delivered");
                    let emptied = {
                        let mut entries = inner.entries.lock().await;
                        entries.remove(&entry.id);
                        Self::persist(inner, &entries);
                        entries.is_empty()
                    };
                    let _ = inner.event_tx.send(QueueEvent::Sent { entry_id: entry.id });
                    if emptied {
                        let _ = inner.event_tx.send(QueueEvent::QueueEmpty);
                    }
                }
                Err(e) => {
                    Self::schedule_retry(inner, entry.id, &e.to_string()).await;
                }
            }
        }
    }

    /// Count a failed attempt: back off, or mark the entry failed once
    /// the budget is spent.
    async fn schedule_retry(inner: &Arc<QueueInner>, entry_id: EntryId, reason: &str) {
        let mut entries = inner.entries.lock().await;
        if let Some(entry) = entries.get_mut(&entry_id) {
            entry.attempts += 1;
            let attempt = entry.attempts;

            let _ = inner.event_tx.send(QueueEvent::AttemptFailed {
                entry_id,
                attempt,
                reason: reason.to_string(),
            });

            if attempt >= inner.config.max_retries {
                warn!(entry = %entry_id, attempts = attempt, "delivery failed permanently");
                entry.status = EntryStatus::Failed;
                let _ = inner.event_tx.send(QueueEvent::Failed { entry_id });
            } else {
                let delay = backoff_delay(&inner.config, attempt);
                let jitter = Self::jitter_for(&inner.config, delay);
                entry.next_retry = now_millis() + delay.as_millis() as i64 + jitter;
                entry.status = EntryStatus::Pending;
                debug!(
                    entry = %entry_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retry scheduled"
                );
            }
            Self::persist(inner, &entries);
        }
    }

    fn jitter_for(config: &DeliveryQueueConfig, delay: Duration) -> i64 {
        let max = (delay.as_millis() as f64 * config.jitter) as i64;
        if max <= 0 {
            0
        } else {
            rand::rngs::OsRng.gen_range(0..=max)
        }
    }

    /// Mirror the in-memory entry set to the store. Persistence is
    /// best-effort: on failure the in-memory queue stays authoritative.
    fn persist(inner: &QueueInner, entries: &HashMap<EntryId, QueuedMessage>) {
        let all: Vec<QueuedMessage> = entries.values().cloned().collect();
        if let Err(e) = inner.store.save_all(&all) {
            warn!(error = %e, "failed to persist queue");
        }
    }
}

impl fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryQueue").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = DeliveryQueueConfig::default();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.base_delay, Duration::from_millis(1000));
        assert_eq!(config.max_delay, Duration::from_millis(60_000));
        assert_eq!(config.drain_interval, Duration::from_millis(1000));
    }

    #[test]
    fn test_backoff_monotonic_and_bounded() {
        let config = DeliveryQueueConfig::default();
        let mut previous = Duration::ZERO;
        for attempt in 1..=5 {
            let delay = backoff_delay(&config, attempt);
            assert!(delay >= previous, "attempt {} regressed", attempt);
            assert!(delay <= config.max_delay);
            previous = delay;
        }
        // 1s * 2^1 = 2s for the first retry, doubling thereafter.
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(&config, 5), Duration::from_secs(32));
    }

    #[test]
    fn test_backoff_hits_ceiling() {
        let config = DeliveryQueueConfig::default();
        assert_eq!(backoff_delay(&config, 10), config.max_delay);
        assert_eq!(backoff_delay(&config, 63), config.max_delay);
    }

    #[test]
    fn test_status_from_i32() {
        assert_eq!(EntryStatus::from(0), EntryStatus::Pending);
        assert_eq!(EntryStatus::from(1), EntryStatus::Sending);
        assert_eq!(EntryStatus::from(2), EntryStatus::Failed);
        assert_eq!(EntryStatus::from(99), EntryStatus::Pending);
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&EntryStatus::Pending).unwrap(),
            "\"pending\""
        );
        assert_eq!(
            serde_json::to_string(&EntryStatus::Failed).unwrap(),
            "\"failed\""
        );
    }
}
