//! Write-behind: the cache is written now, the source later.
//!
//! Source writes go through a bounded queue drained by one background
//! worker. A full queue applies the write synchronously instead
//! (back-pressure, never a silent drop). Writes to one key reach the source
//! in the order they were issued: a queued write that a newer write to the
//! same key has overtaken is skipped. Worker failures are logged with the
//! key and not retried; the reload subsystem is the place to repair the
//! source.

use super::{CacheStrategy, StrategyCore, StrategyKind};
use crate::backend::CacheBackend;
use crate::client::CacheClient;
use crate::error::Result;
use crate::observability::StrategyStats;
use crate::repository::WritableDataSource;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// Queue capacity when none is configured.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

enum PendingWrite<V> {
    Store { key: String, value: V },
    Remove { key: String },
}

impl<V> PendingWrite<V> {
    fn key(&self) -> &str {
        match self {
            PendingWrite::Store { key, .. } | PendingWrite::Remove { key } => key,
        }
    }
}

/// A source write tagged with its issue sequence number.
type Queued<V> = (u64, PendingWrite<V>);

type Worker<V> = JoinHandle<mpsc::Receiver<Queued<V>>>;

struct KeySlot {
    latest: u64,
    outstanding: usize,
}

/// Issue order of source writes, per key.
///
/// A slot lives while any write to its key is queued or being applied.
#[derive(Default)]
struct KeyOrder {
    slots: DashMap<String, KeySlot>,
    next: AtomicU64,
    // Held around every source write, worker and fallback alike.
    applying: Mutex<()>,
}

impl KeyOrder {
    fn issue(&self, key: &str) -> u64 {
        let mut slot = self.slots.entry(key.to_string()).or_insert(KeySlot {
            latest: 0,
            outstanding: 0,
        });
        let seq = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        slot.latest = seq;
        slot.outstanding += 1;
        seq
    }

    fn is_latest(&self, key: &str, seq: u64) -> bool {
        self.slots.get(key).map_or(true, |slot| slot.latest == seq)
    }

    fn finish(&self, key: &str) {
        if let MapEntry::Occupied(mut slot) = self.slots.entry(key.to_string()) {
            let outstanding = slot.get().outstanding.saturating_sub(1);
            if outstanding == 0 {
                slot.remove();
            } else {
                slot.get_mut().outstanding = outstanding;
            }
        }
    }

    /// Apply `op` unless a newer write to its key was issued. Returns
    /// whether it was applied.
    async fn apply_latest<S: WritableDataSource>(
        &self,
        source: &S,
        seq: u64,
        op: PendingWrite<S::Value>,
    ) -> Result<bool> {
        let key = op.key().to_string();
        let result = {
            let _applying = self.applying.lock().await;
            if self.is_latest(&key, seq) {
                apply(source, op).await.map(|()| true)
            } else {
                Ok(false)
            }
        };
        self.finish(&key);
        result
    }
}

/// Cache updated synchronously, source updated by a background worker.
///
/// Must be created inside a Tokio runtime. Call
/// [`WriteBehindStrategy::shutdown`] before dropping it to flush or
/// account for queued writes.
pub struct WriteBehindStrategy<B: CacheBackend, S: WritableDataSource> {
    core: StrategyCore<B, S>,
    queue: Mutex<Option<mpsc::Sender<Queued<S::Value>>>>,
    worker: Mutex<Option<Worker<S::Value>>>,
    stop: watch::Sender<bool>,
    pending: Arc<AtomicUsize>,
    order: Arc<KeyOrder>,
    capacity: usize,
}

impl<B: CacheBackend, S: WritableDataSource> WriteBehindStrategy<B, S> {
    pub fn new(client: CacheClient<B>, source: Arc<S>, capacity: usize) -> Self {
        Self::from_core(StrategyCore::new(client, source), capacity)
    }

    pub(crate) fn from_core(core: StrategyCore<B, S>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (stop, stop_rx) = watch::channel(false);
        let pending = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(KeyOrder::default());

        let worker = tokio::spawn(drain(
            Arc::clone(&core.source),
            rx,
            stop_rx,
            Arc::clone(&pending),
            Arc::clone(&order),
        ));
        info!("✓ Write-behind worker started (queue capacity {})", capacity);

        WriteBehindStrategy {
            core,
            queue: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            stop,
            pending,
            order,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Source writes queued or in flight.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Stop the worker.
    ///
    /// With `flush`, every queued write is applied to the source before
    /// this returns. Without it, queued writes are discarded and the count
    /// is logged. Returns how many writes were flushed or dropped. Later
    /// writes go to the source synchronously.
    pub async fn shutdown(&self, flush: bool) -> usize {
        let sender = self.queue.lock().await.take();
        let worker = self.worker.lock().await.take();
        let Some(worker) = worker else {
            return 0;
        };

        let queued = self.pending();
        if flush {
            // Closing the channel lets the worker drain everything and exit.
            drop(sender);
        } else {
            let _ = self.stop.send(true);
            drop(sender);
        }

        let mut rx = match worker.await {
            Ok(rx) => rx,
            Err(e) => {
                error!("✗ Write-behind worker panicked: {}", e);
                return queued;
            }
        };

        if flush {
            info!("✓ Write-behind worker stopped after flushing {} writes", queued);
            return queued;
        }

        let mut dropped = 0;
        while let Ok((_, op)) = rx.try_recv() {
            debug!("Dropping queued source write for {}", op.key());
            self.order.finish(op.key());
            dropped += 1;
        }
        self.pending.fetch_sub(dropped, Ordering::SeqCst);
        if dropped > 0 {
            warn!("⚠ Write-behind stopped without flush: dropped {} queued source writes", dropped);
        } else {
            info!("✓ Write-behind worker stopped with an empty queue");
        }
        dropped
    }

    async fn enqueue(&self, op: PendingWrite<S::Value>) -> Result<()> {
        let seq = self.order.issue(op.key());
        let op = {
            let queue = self.queue.lock().await;
            match queue.as_ref() {
                Some(tx) => {
                    self.pending.fetch_add(1, Ordering::SeqCst);
                    match tx.try_send((seq, op)) {
                        Ok(()) => return Ok(()),
                        Err(TrySendError::Full((_, op))) => {
                            self.pending.fetch_sub(1, Ordering::SeqCst);
                            warn!(
                                "⚠ Write-behind queue full, writing {} to source synchronously",
                                op.key()
                            );
                            op
                        }
                        Err(TrySendError::Closed((_, op))) => {
                            self.pending.fetch_sub(1, Ordering::SeqCst);
                            op
                        }
                    }
                }
                None => op,
            }
        };
        self.order
            .apply_latest(self.core.source.as_ref(), seq, op)
            .await
            .map(|_| ())
    }
}

async fn apply<S: WritableDataSource>(source: &S, op: PendingWrite<S::Value>) -> Result<()> {
    match op {
        PendingWrite::Store { key, value } => source.store(&key, &value).await,
        PendingWrite::Remove { key } => source.remove(&key).await,
    }
}

async fn drain<S: WritableDataSource>(
    source: Arc<S>,
    mut rx: mpsc::Receiver<Queued<S::Value>>,
    mut stop: watch::Receiver<bool>,
    pending: Arc<AtomicUsize>,
    order: Arc<KeyOrder>,
) -> mpsc::Receiver<Queued<S::Value>> {
    loop {
        let (seq, op) = tokio::select! {
            biased;
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
                continue;
            }
            op = rx.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };

        let key = op.key().to_string();
        match order.apply_latest(source.as_ref(), seq, op).await {
            Ok(true) => debug!("✓ Write-behind applied {}", key),
            Ok(false) => debug!("Write-behind skipped {}, superseded by a newer write", key),
            Err(e) => error!("✗ Write-behind source write failed for {}: {}", key, e),
        }
        pending.fetch_sub(1, Ordering::SeqCst);
    }
    rx
}

impl<B: CacheBackend, S: WritableDataSource> CacheStrategy for WriteBehindStrategy<B, S> {
    type Value = S::Value;

    fn kind(&self) -> StrategyKind {
        StrategyKind::WriteBehind
    }

    async fn read(&self, key: &str) -> Result<S::Value> {
        self.core.read_or_load(key).await
    }

    async fn write(&self, key: &str, value: &S::Value, ttl: Option<Duration>) -> Result<()> {
        let start = Instant::now();
        let result = async {
            self.core.cache_write(key, value, ttl).await?;
            self.enqueue(PendingWrite::Store {
                key: key.to_string(),
                value: value.clone(),
            })
            .await
        }
        .await;
        self.core.finish_write(key, start, result).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let start = Instant::now();
        let result = async {
            self.core.cache_delete(key).await?;
            self.enqueue(PendingWrite::Remove {
                key: key.to_string(),
            })
            .await
        }
        .await;
        self.core.finish_delete(key, start, result).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.core.exists(key).await
    }

    async fn clear(&self) -> Result<()> {
        self.core.clear().await
    }

    async fn stats(&self) -> StrategyStats {
        self.core.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::repository::InMemorySource;

    async fn wait_for_drain<B: CacheBackend, S: WritableDataSource>(
        strategy: &WriteBehindStrategy<B, S>,
    ) {
        for _ in 0..200 {
            if strategy.pending() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("write-behind queue did not drain");
    }

    #[tokio::test]
    async fn test_write_is_readable_immediately_and_reaches_source() {
        let source = Arc::new(InMemorySource::new());
        let strategy = WriteBehindStrategy::new(
            CacheClient::new(InMemoryBackend::new()),
            Arc::clone(&source),
            DEFAULT_QUEUE_CAPACITY,
        );

        strategy.write("k", &"v".to_string(), None).await.expect("write");
        assert_eq!(strategy.read("k").await.expect("read"), "v");

        wait_for_drain(&strategy).await;
        assert_eq!(source.get("k"), Some("v".to_string()));
        strategy.shutdown(true).await;
    }

    #[tokio::test]
    async fn test_delete_is_queued_for_source() {
        let source = Arc::new(InMemorySource::with_entries([("k", 1u32)]));
        let strategy = WriteBehindStrategy::new(
            CacheClient::new(InMemoryBackend::new()),
            Arc::clone(&source),
            DEFAULT_QUEUE_CAPACITY,
        );
        strategy.delete("k").await.expect("delete");
        wait_for_drain(&strategy).await;
        assert!(source.is_empty());
        strategy.shutdown(true).await;
    }

    #[tokio::test]
    async fn test_shutdown_with_flush_applies_everything() {
        let source = Arc::new(InMemorySource::new());
        let strategy = WriteBehindStrategy::new(
            CacheClient::new(InMemoryBackend::new()),
            Arc::clone(&source),
            DEFAULT_QUEUE_CAPACITY,
        );
        for i in 0..50u32 {
            strategy
                .write(&format!("k{}", i), &i, None)
                .await
                .expect("write");
        }
        strategy.shutdown(true).await;
        assert_eq!(source.len(), 50);
        assert_eq!(strategy.pending(), 0);
    }

    #[tokio::test]
    async fn test_writes_after_shutdown_are_synchronous() {
        let source = Arc::new(InMemorySource::new());
        let strategy = WriteBehindStrategy::new(
            CacheClient::new(InMemoryBackend::new()),
            Arc::clone(&source),
            DEFAULT_QUEUE_CAPACITY,
        );
        strategy.shutdown(false).await;
        strategy.write("k", &1u32, None).await.expect("write");
        assert_eq!(source.get("k"), Some(1));
        assert_eq!(strategy.shutdown(true).await, 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_full_queue_falls_back_to_synchronous_write() {
        let source = Arc::new(InMemorySource::new());
        let strategy = WriteBehindStrategy::new(
            CacheClient::new(InMemoryBackend::new()),
            Arc::clone(&source),
            1,
        );

        // The current-thread worker cannot run between these writes, so the
        // second finds the single slot taken.
        strategy.write("a", &1u32, None).await.expect("write");
        strategy.write("b", &2u32, None).await.expect("write");
        assert_eq!(source.get("b"), Some(2));
        assert_eq!(source.get("a"), None);

        strategy.shutdown(true).await;
        assert_eq!(source.get("a"), Some(1));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_overflow_write_is_not_overwritten_by_older_queued_write() {
        let source = Arc::new(InMemorySource::new());
        let strategy = WriteBehindStrategy::new(
            CacheClient::new(InMemoryBackend::new()),
            Arc::clone(&source),
            1,
        );

        strategy.write("k", &1u32, None).await.expect("write");
        strategy.write("k", &2u32, None).await.expect("write");
        assert_eq!(source.get("k"), Some(2));

        strategy.shutdown(true).await;
        assert_eq!(source.get("k"), Some(2));
        assert_eq!(strategy.read("k").await.expect("read"), 2);
        assert_eq!(strategy.pending(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_overflow_delete_is_not_undone_by_queued_write() {
        let source = Arc::new(InMemorySource::new());
        let strategy = WriteBehindStrategy::new(
            CacheClient::new(InMemoryBackend::new()),
            Arc::clone(&source),
            1,
        );

        strategy.write("k", &1u32, None).await.expect("write");
        strategy.delete("k").await.expect("delete");
        strategy.shutdown(true).await;
        assert_eq!(source.get("k"), None);
        assert!(!strategy.exists("k").await.expect("exists"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_shutdown_without_flush_drops_queued_writes() {
        let source = Arc::new(InMemorySource::new());
        let strategy = WriteBehindStrategy::new(
            CacheClient::new(InMemoryBackend::new()),
            Arc::clone(&source),
            10,
        );

        // The worker has not run yet, so all three stay queued.
        for i in 0..3u32 {
            strategy
                .write(&format!("k{}", i), &i, None)
                .await
                .expect("write");
        }
        assert_eq!(strategy.pending(), 3);

        assert_eq!(strategy.shutdown(false).await, 3);
        assert!(source.is_empty());
        assert_eq!(strategy.pending(), 0);
        assert_eq!(strategy.read("k1").await.expect("read"), 1);
    }

    #[tokio::test]
    async fn test_synchronous_fallback_error_is_returned() {
        let source = Arc::new(InMemorySource::new());
        let strategy = WriteBehindStrategy::new(
            CacheClient::new(InMemoryBackend::new()),
            Arc::clone(&source),
            DEFAULT_QUEUE_CAPACITY,
        );
        strategy.shutdown(true).await;
        source.fail_writes(true);
        assert!(strategy.write("k", &1u32, None).await.is_err());
        assert_eq!(strategy.stats().await.errors, 1);
    }
}
