//! Read and write paths through the service's active strategy.

use cache_engine::backend::InMemoryBackend;
use cache_engine::repository::InMemorySource;
use cache_engine::strategy::StrategyKind;
use cache_engine::transformers::ValidationTransformer;
use cache_engine::{CacheService, Error};
use std::sync::Arc;
use std::time::Duration;

type Service = CacheService<InMemoryBackend, InMemorySource<String>>;

fn catalog() -> Arc<InMemorySource<String>> {
    Arc::new(InMemorySource::with_entries(
        (1..=20).map(|i| (format!("product:{}", i), format!("product #{}", i))),
    ))
}

async fn build(source: &Arc<InMemorySource<String>>, kind: StrategyKind) -> Service {
    CacheService::builder(InMemoryBackend::new(), Arc::clone(source))
        .with_strategy(kind)
        .build()
        .await
        .expect("service")
}

#[tokio::test]
async fn test_read_through_populates_cache_for_every_policy() {
    for kind in StrategyKind::ALL {
        let source = catalog();
        let service = build(&source, kind).await;

        for i in 1..=20 {
            let key = format!("product:{}", i);
            assert!(!service.exists(&key).await.expect("exists"));
            assert_eq!(
                service.read(&key).await.expect("read"),
                format!("product #{}", i)
            );
            assert!(service.exists(&key).await.expect("exists"), "{kind}: {key}");
        }

        service.read("product:1").await.expect("read");
        let stats = service.strategy_stats().await;
        assert_eq!(stats.misses, 20);
        assert_eq!(stats.hits, 1);
        assert_eq!(source.calls().load_one, 20);
        service.close().await;
    }
}

#[tokio::test]
async fn test_failed_population_still_returns_source_value() {
    let source = catalog();
    let service = CacheService::builder(InMemoryBackend::new(), Arc::clone(&source))
        .with_transformer(Arc::new(ValidationTransformer::new().with_max_size(1)))
        .build()
        .await
        .expect("service");

    assert_eq!(service.read("product:3").await.expect("read"), "product #3");
    assert!(!service.exists("product:3").await.expect("exists"));
    assert_eq!(service.strategy_stats().await.errors, 0);
}

#[tokio::test]
async fn test_missing_everywhere_is_not_found() {
    let source = catalog();
    let service = build(&source, StrategyKind::CacheAside).await;
    assert!(matches!(
        service.read("product:404").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_write_behind_is_readable_at_once_and_reaches_source() {
    let source = catalog();
    let service = build(&source, StrategyKind::WriteBehind).await;

    for i in 0..100 {
        let key = format!("new:{}", i);
        let value = format!("value {}", i);
        service.write(&key, &value, None).await.expect("write");
        assert_eq!(service.read(&key).await.expect("read"), value);
    }

    let mut drained = false;
    for _ in 0..400 {
        if (0..100).all(|i| source.get(&format!("new:{}", i)).is_some()) {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(drained, "write-behind worker did not drain the queue");
    assert_eq!(source.get("new:42"), Some("value 42".to_string()));
    service.close().await;
}

#[tokio::test]
async fn test_close_flushes_write_behind_queue() {
    let source = catalog();
    let service = build(&source, StrategyKind::WriteBehind).await;
    for i in 0..50 {
        service
            .write(&format!("queued:{}", i), &"x".to_string(), None)
            .await
            .expect("write");
    }
    service.close().await;
    assert!((0..50).all(|i| source.get(&format!("queued:{}", i)).is_some()));
}

#[tokio::test]
async fn test_write_through_failure_leaves_cache_clean() {
    let source = catalog();
    let service = build(&source, StrategyKind::WriteThrough).await;
    source.fail_writes(true);

    assert!(matches!(
        service
            .write("product:1", &"changed".to_string(), None)
            .await,
        Err(Error::SourceError(_))
    ));
    assert!(!service.exists("product:1").await.expect("exists"));
    assert_eq!(source.get("product:1"), Some("product #1".to_string()));
    assert_eq!(service.strategy_stats().await.errors, 1);
}

#[tokio::test]
async fn test_cache_aside_writes_source_first() {
    let source = catalog();
    let service = build(&source, StrategyKind::CacheAside).await;
    source.fail_writes(true);

    assert!(service
        .write("product:2", &"changed".to_string(), None)
        .await
        .is_err());
    assert!(!service.exists("product:2").await.expect("exists"));

    source.fail_writes(false);
    service
        .write("product:2", &"changed".to_string(), None)
        .await
        .expect("write");
    assert_eq!(source.get("product:2"), Some("changed".to_string()));
    assert_eq!(service.get::<String>("product:2").await.expect("get"), "changed");

    service.remove("product:2").await.expect("remove");
    assert!(source.get("product:2").is_none());
    assert!(!service.exists("product:2").await.expect("exists"));
}
