//! Basic usage example of the cache engine.

use cache_engine::{
    backend::InMemoryBackend, error::Result, strategy::StrategyKind,
    transformers::CompressionTransformer, CacheService, DataSource, Error, ReloadConfig,
    WritableDataSource,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Example value: Product
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
struct Product {
    id: String,
    name: String,
    price: f64,
}

/// Stand-in for a database table.
#[derive(Default)]
struct ProductCatalog {
    rows: Mutex<HashMap<String, Product>>,
}

impl ProductCatalog {
    fn seeded() -> Self {
        let catalog = ProductCatalog::default();
        {
            let mut rows = catalog.rows.lock().unwrap();
            for (id, name, price) in [
                ("product:1", "Laptop", 999.99),
                ("product:2", "Mouse", 19.99),
                ("product:3", "Keyboard", 49.50),
            ] {
                rows.insert(
                    id.to_string(),
                    Product {
                        id: id.to_string(),
                        name: name.to_string(),
                        price,
                    },
                );
            }
        }
        catalog
    }
}

impl DataSource for ProductCatalog {
    type Value = Product;

    async fn load_one(&self, key: &str) -> Result<Option<Product>> {
        println!("  [DB] Loading {}", key);
        Ok(self.rows.lock().unwrap().get(key).cloned())
    }

    async fn load_batch(&self, keys: &[String]) -> Result<HashMap<String, Product>> {
        println!("  [DB] Loading {} products", keys.len());
        let rows = self.rows.lock().unwrap();
        Ok(keys
            .iter()
            .filter_map(|k| rows.get(k).map(|p| (k.clone(), p.clone())))
            .collect())
    }

    async fn load_all(&self) -> Result<HashMap<String, Product>> {
        Ok(self.rows.lock().unwrap().clone())
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self.rows.lock().unwrap().keys().cloned().collect())
    }

    fn validate(&self, product: &Product) -> Result<()> {
        if product.price < 0.0 {
            return Err(Error::ValidationError(format!(
                "{} has a negative price",
                product.id
            )));
        }
        Ok(())
    }
}

impl WritableDataSource for ProductCatalog {
    async fn store(&self, key: &str, product: &Product) -> Result<()> {
        println!("  [DB] Storing {}", key);
        self.rows
            .lock()
            .unwrap()
            .insert(key.to_string(), product.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        println!("  [DB] Removing {}", key);
        self.rows.lock().unwrap().remove(key);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Debug)
        .try_init()
        .ok();

    println!("\n=== Cache Engine - Basic Example ===\n");

    // 1. Build the service
    println!("1. Building the cache service...");
    let catalog = Arc::new(ProductCatalog::seeded());
    let service = CacheService::builder(InMemoryBackend::new(), Arc::clone(&catalog))
        .with_strategy(StrategyKind::ReadThrough)
        .with_reload_config(ReloadConfig::default().with_batch_size(2))
        .with_transformer(Arc::new(CompressionTransformer::new()))
        .build()
        .await?;
    println!("   ✓ Service ready\n");

    // 2. Read-through: miss, then hit
    println!("2. Reading product:1 twice:");
    let product = service.read("product:1").await?;
    println!("   ✓ First read: {} (${:.2})", product.name, product.price);
    let product = service.read("product:1").await?;
    println!("   ✓ Second read from cache: {}\n", product.name);

    // 3. Write-behind: cache now, database later
    println!("3. Switching to write-behind and writing product:4:");
    service.set_strategy(StrategyKind::WriteBehind).await;
    let monitor = Product {
        id: "product:4".to_string(),
        name: "Monitor".to_string(),
        price: 249.00,
    };
    service.write("product:4", &monitor, None).await?;
    println!("   ✓ Readable immediately: {}\n", service.read("product:4").await?.name);

    // 4. Tags and dependencies
    println!("4. Tagging and invalidating:");
    service
        .set_with_tags("listing:peripherals", &vec!["product:2", "product:3"], None, &[
            "peripherals".to_string(),
        ])
        .await?;
    service
        .register_dependency("product:2", &["listing:peripherals".to_string()])
        .await?;
    let removed = service.invalidate("product:2").await?;
    println!("   ✓ Invalidated {} key(s) for product:2\n", removed);

    // 5. Batch reload
    println!("5. Reloading a batch:");
    let keys: Vec<String> = (1..=3).map(|i| format!("product:{}", i)).collect();
    let result = service.reload_batch(&keys).await?;
    println!(
        "   ✓ {} reloaded, {} failed\n",
        result.keys_reloaded, result.keys_failed
    );

    // 6. Stats
    let stats = service.strategy_stats().await;
    println!(
        "6. Write-behind stats: {} writes, {} hits, {} misses\n",
        stats.writes, stats.hits, stats.misses
    );

    service.close().await;
    println!(
        "   ✓ Database has product:4: {}",
        catalog.rows.lock().unwrap().contains_key("product:4")
    );

    println!("\n=== Example Complete ===\n");

    Ok(())
}
