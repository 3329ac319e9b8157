//! Key, tag, pattern and dependency invalidation through the service.

use cache_engine::backend::InMemoryBackend;
use cache_engine::repository::InMemorySource;
use cache_engine::{CacheService, EngineConfig};
use std::sync::Arc;

type Service = CacheService<InMemoryBackend, InMemorySource<String>>;

async fn build() -> (Arc<InMemorySource<String>>, Service) {
    let source = Arc::new(InMemorySource::with_entries([
        ("user:1", "alice".to_string()),
        ("user:2", "bob".to_string()),
    ]));
    let service = CacheService::new(InMemoryBackend::new(), Arc::clone(&source), EngineConfig::default())
        .await
        .expect("service");
    (source, service)
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_dependency_cascade() {
    let (_, service) = build().await;
    for key in ["user:1", "profile:1", "session:1"] {
        service.set(key, "cached", None).await.expect("set");
    }
    service
        .register_dependency("user:1", &strings(&["profile:1", "session:1"]))
        .await
        .expect("dependency");

    assert_eq!(service.invalidate("user:1").await.expect("invalidate"), 3);
    for key in ["user:1", "profile:1", "session:1"] {
        assert!(!service.exists(key).await.expect("exists"), "{key} survived");
    }
}

#[tokio::test]
async fn test_dependency_cascade_is_one_level_deep() {
    let (_, service) = build().await;
    for key in ["a", "b", "c"] {
        service.set(key, &1u8, None).await.expect("set");
    }
    service.register_dependency("a", &strings(&["b"])).await.expect("dependency");
    service.register_dependency("b", &strings(&["c"])).await.expect("dependency");

    service.invalidate("a").await.expect("invalidate");
    assert!(!service.exists("b").await.expect("exists"));
    assert!(service.exists("c").await.expect("exists"));
}

#[tokio::test]
async fn test_tag_invalidation_removes_members_and_cleans_tag_sets() {
    let (_, service) = build().await;
    service
        .set_with_tags("post:1", "first", None, &strings(&["news", "front"]))
        .await
        .expect("set");
    service
        .set_with_tags("post:2", "second", None, &strings(&["news"]))
        .await
        .expect("set");
    service
        .set_with_tags("post:3", "third", None, &strings(&["front"]))
        .await
        .expect("set");

    let removed = service
        .invalidate_by_tags(&strings(&["news"]))
        .await
        .expect("invalidate");
    assert_eq!(removed, 2);

    assert!(!service.exists("post:1").await.expect("exists"));
    assert!(!service.exists("post:2").await.expect("exists"));
    assert!(service.exists("post:3").await.expect("exists"));

    assert!(service.tag_members("news").await.expect("members").is_empty());
    assert_eq!(
        service.tag_members("front").await.expect("members"),
        vec!["post:3"]
    );
}

#[tokio::test]
async fn test_pattern_invalidation_scans_matching_keys() {
    let (_, service) = build().await;
    for i in 0..250 {
        service
            .set(&format!("session:{}", i), &i, None)
            .await
            .expect("set");
    }
    service.set("user:keep", "yes", None).await.expect("set");

    assert_eq!(
        service.invalidate_pattern("session:*").await.expect("pattern"),
        250
    );
    assert!(service.exists("user:keep").await.expect("exists"));
    assert!(!service.exists("session:17").await.expect("exists"));
}

#[tokio::test]
async fn test_invalidate_and_reload_repopulates_from_source() {
    let (source, service) = build().await;
    service.set("user:1", "stale", None).await.expect("set");
    source.insert("user:1", "alice v2".to_string());

    service.invalidate_and_reload("user:1").await.expect("invalidate and reload");
    assert_eq!(
        service.get::<String>("user:1").await.expect("get"),
        "alice v2"
    );
}

#[tokio::test]
async fn test_events_are_recorded_newest_first() {
    let (_, service) = build().await;
    service.set("user:2", "bob", None).await.expect("set");
    service.invalidate("user:2").await.expect("invalidate");
    service.invalidate_pattern("nothing:*").await.expect("pattern");

    let events = service
        .recent_invalidation_events(10)
        .await
        .expect("events");
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].target, "nothing:*");
    assert_eq!(events[0].keys_invalidated, 0);
    assert_eq!(events[1].target, "user:2");
    assert_eq!(events[1].keys_invalidated, 1);
}
