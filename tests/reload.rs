//! Reload behaviour through the service and the reloader.

use cache_engine::backend::InMemoryBackend;
use cache_engine::client::CacheClient;
use cache_engine::repository::InMemorySource;
use cache_engine::{
    CacheReloader, CacheService, DataSource, EngineConfig, Error, ReloadConfig, ReloadHook,
    ReloadStrategy, Result,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn keys(range: std::ops::RangeInclusive<u32>) -> Vec<String> {
    range.map(|i| format!("order:{}", i)).collect()
}

fn orders() -> Arc<InMemorySource<u32>> {
    Arc::new(InMemorySource::with_entries(
        (1..=5).map(|i| (format!("order:{}", i), i * 100)),
    ))
}

#[tokio::test]
async fn test_batch_isolates_invalid_key() {
    let source = orders();
    source.mark_invalid("order:3");
    let service = CacheService::new(
        InMemoryBackend::new(),
        Arc::clone(&source),
        EngineConfig::default().with_reload(ReloadConfig::default().with_batch_size(2)),
    )
    .await
    .expect("service");

    let result = service.reload_batch(&keys(1..=5)).await.expect("batch");
    assert_eq!(result.keys_reloaded, 4);
    assert_eq!(result.keys_failed, 1);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].0, "order:3");
    assert!(matches!(result.errors[0].1, Error::ValidationError(_)));

    for i in [1u32, 2, 4, 5] {
        let key = format!("order:{}", i);
        assert_eq!(service.get::<u32>(&key).await.expect("get"), i * 100);
    }
    assert!(!service.exists("order:3").await.expect("exists"));

    let metrics = service.reload_metrics().await;
    assert_eq!(metrics.total_reloads, 1);
    assert_eq!(metrics.failed_reloads, 1);
}

#[tokio::test]
async fn test_single_reload_refreshes_stale_entry() {
    let source = orders();
    let service = CacheService::new(InMemoryBackend::new(), Arc::clone(&source), EngineConfig::default())
        .await
        .expect("service");

    service.set("order:1", &1u32, None).await.expect("set");
    service.reload("order:1").await.expect("reload");
    assert_eq!(service.get::<u32>("order:1").await.expect("get"), 100);

    assert!(matches!(
        service.reload("order:9").await,
        Err(Error::NotFound(_))
    ));
    let metrics = service.reload_metrics().await;
    assert_eq!(metrics.successful_reloads, 1);
    assert_eq!(metrics.failed_reloads, 1);
}

#[tokio::test]
async fn test_replace_reload_drops_keys_the_source_no_longer_has() {
    let source = orders();
    let service = CacheService::new(
        InMemoryBackend::new(),
        Arc::clone(&source),
        EngineConfig::default()
            .with_reload(ReloadConfig::default().with_strategy(ReloadStrategy::Replace)),
    )
    .await
    .expect("service");

    service.set("orphan", &0u32, None).await.expect("set");
    let result = service.reload_all().await.expect("reload all");

    assert_eq!(result.keys_reloaded, 5);
    assert!(!service.exists("orphan").await.expect("exists"));
    assert_eq!(service.get::<u32>("order:5").await.expect("get"), 500);
}

#[derive(Default)]
struct Journal {
    entries: Mutex<Vec<String>>,
}

struct Recorder {
    name: &'static str,
    priority: i32,
    journal: Arc<Journal>,
}

impl ReloadHook<u32> for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn before_reload(&self, key: &str) -> Result<()> {
        self.journal
            .entries
            .lock()
            .unwrap()
            .push(format!("{} before {}", self.name, key));
        Ok(())
    }

    fn after_reload(&self, key: &str, data: &u32) -> Result<()> {
        self.journal
            .entries
            .lock()
            .unwrap()
            .push(format!("{} after {}={}", self.name, key, data));
        Ok(())
    }
}

struct Veto;

impl ReloadHook<u32> for Veto {
    fn name(&self) -> &str {
        "veto"
    }

    fn priority(&self) -> i32 {
        5
    }

    fn before_reload(&self, key: &str) -> Result<()> {
        Err(Error::ValidationError(format!("{} is frozen", key)))
    }
}

#[tokio::test]
async fn test_hooks_run_in_priority_order_and_abort_on_error() {
    let journal = Arc::new(Journal::default());
    let source = orders();
    let service = CacheService::builder(InMemoryBackend::new(), Arc::clone(&source))
        .with_hook(Arc::new(Recorder {
            name: "late",
            priority: 10,
            journal: Arc::clone(&journal),
        }))
        .with_hook(Arc::new(Recorder {
            name: "early",
            priority: 1,
            journal: Arc::clone(&journal),
        }))
        .build()
        .await
        .expect("service");

    service.reload("order:2").await.expect("reload");
    assert_eq!(
        *journal.entries.lock().unwrap(),
        vec![
            "early before order:2",
            "late before order:2",
            "early after order:2=200",
            "late after order:2=200",
        ]
    );

    journal.entries.lock().unwrap().clear();
    service.add_hook(Arc::new(Veto));
    match service.reload("order:4").await {
        Err(Error::HookError { hook, .. }) => assert_eq!(hook, "veto"),
        other => panic!("expected hook error, got {other:?}"),
    }
    assert_eq!(*journal.entries.lock().unwrap(), vec!["early before order:4"]);
    assert!(!service.exists("order:4").await.expect("exists"));
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_reload_runs_until_stopped() {
    let source = orders();
    let reloader = CacheReloader::new(
        CacheClient::new(InMemoryBackend::new()),
        Arc::clone(&source),
        ReloadConfig::default().with_scheduled_reload(Duration::from_millis(50)),
    );
    assert!(reloader.is_scheduler_running().await);

    tokio::time::sleep(Duration::from_millis(120)).await;
    let before_stop = reloader.metrics().await.total_reloads;
    assert!(before_stop >= 2, "only {} reloads", before_stop);

    reloader.stop().await;
    assert!(!reloader.is_scheduler_running().await);
    let at_stop = reloader.metrics().await.total_reloads;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(reloader.metrics().await.total_reloads, at_stop);
    assert_eq!(source.calls().load_all as u64, at_stop);
}

#[tokio::test]
async fn test_transient_source_failures_are_retried() {
    struct Flaky {
        inner: InMemorySource<u32>,
        failures_left: AtomicUsize,
    }

    impl DataSource for Flaky {
        type Value = u32;

        async fn load_one(&self, key: &str) -> Result<Option<u32>> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::SourceError("connection reset".into()));
            }
            self.inner.load_one(key).await
        }

        async fn load_batch(&self, keys: &[String]) -> Result<HashMap<String, u32>> {
            self.inner.load_batch(keys).await
        }

        async fn load_all(&self) -> Result<HashMap<String, u32>> {
            self.inner.load_all().await
        }

        async fn list_keys(&self) -> Result<Vec<String>> {
            self.inner.list_keys().await
        }
    }

    let source = Arc::new(Flaky {
        inner: InMemorySource::with_entries([("order:1", 7u32)]),
        failures_left: AtomicUsize::new(2),
    });
    let client = CacheClient::new(InMemoryBackend::new());
    let reloader = CacheReloader::new(
        client.clone(),
        source,
        ReloadConfig::default().with_retries(2, Duration::from_millis(1)),
    );

    reloader.reload("order:1").await.expect("reload");
    assert_eq!(client.get::<u32>("order:1").await.expect("get"), 7);
}
