//! # cache-engine
//!
//! A pluggable cache engine over a key-value cache service.
//!
//! ## Features
//!
//! - **Strategies:** read-through, write-through, write-behind and cache-aside behind one contract
//! - **Reload:** single, batch and full reload from a data source, with an optional interval loop
//! - **Invalidation:** by key, pattern or tag, with dependency cascades and retried batch deletes
//! - **Warm-up:** idempotent bulk population, remembered for 24h in the cache itself
//! - **Pipeline:** priority-ordered reload hooks and byte transformers (gzip, AES-GCM, validation)
//! - **Backend Agnostic:** in-memory and Redis backends, or your own [`CacheBackend`]
//!
//! ## Quick Start
//!
//! ```
//! use cache_engine::backend::InMemoryBackend;
//! use cache_engine::repository::InMemorySource;
//! use cache_engine::strategy::StrategyKind;
//! use cache_engine::CacheService;
//! use std::sync::Arc;
//!
//! # async fn example() -> cache_engine::Result<()> {
//! // 1. Any type implementing DataSource + WritableDataSource
//! let source = Arc::new(InMemorySource::with_entries([("user:1", 42u32)]));
//!
//! // 2. Build the service
//! let service = CacheService::builder(InMemoryBackend::new(), source)
//!     .with_strategy(StrategyKind::ReadThrough)
//!     .build()
//!     .await?;
//!
//! // 3. Use it
//! assert_eq!(service.read("user:1").await?, 42);
//! service.register_dependency("user:1", &["profile:1".to_string()]).await?;
//! service.invalidate("user:1").await?;
//! service.close().await;
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate log;

pub mod backend;
pub mod builder;
pub mod client;
pub mod config;
pub mod error;
pub mod hooks;
pub mod invalidation;
pub mod key;
pub mod observability;
pub mod reload;
pub mod repository;
pub mod serialization;
pub mod service;
pub mod strategy;
pub mod transformers;
pub mod warming;

// Re-exports for convenience
pub use backend::CacheBackend;
pub use builder::CacheServiceBuilder;
pub use client::CacheClient;
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use hooks::{DataTransformer, ReloadHook};
pub use invalidation::{CacheInvalidator, InvalidationConfig};
pub use reload::{CacheReloader, ReloadConfig, ReloadResult, ReloadStrategy};
pub use repository::{DataSource, WritableDataSource};
pub use serialization::{CacheValue, Codec};
pub use service::CacheService;
pub use strategy::{CacheStrategy, StrategyKind};
pub use warming::{CacheWarmer, WarmUpResult};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
