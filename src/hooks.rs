//! Reload lifecycle hooks and data transformers.
//!
//! Both registries keep their entries sorted by ascending priority (lower
//! runs first) and re-sort on every registration, so registration order
//! never matters. Execution takes a snapshot of the registry, so a hook or
//! transformer can be added while another reload is running.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Lifecycle hook around a single-key reload.
///
/// Any method returning `Err` aborts the rest of the chain; the manager
/// reports the failure as [`Error::HookError`] carrying [`ReloadHook::name`].
pub trait ReloadHook<V>: Send + Sync {
    fn name(&self) -> &str;

    /// Lower runs first.
    fn priority(&self) -> i32 {
        0
    }

    fn before_reload(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    fn after_reload(&self, _key: &str, _data: &V) -> Result<()> {
        Ok(())
    }

    fn on_reload_error(&self, _key: &str, _error: &Error) -> Result<()> {
        Ok(())
    }
}

/// Transformation applied to an encoded value before it is stored.
///
/// `restore` must undo `transform`; it runs on read for every transformer
/// recorded in the stored envelope.
pub trait DataTransformer: Send + Sync {
    /// Unique name, recorded in the stored envelope.
    fn name(&self) -> &str;

    /// Lower runs first.
    fn priority(&self) -> i32 {
        0
    }

    fn should_transform(&self, _key: &str, _data: &[u8]) -> bool {
        true
    }

    fn transform(&self, key: &str, data: Vec<u8>) -> Result<Vec<u8>>;

    fn restore(&self, _key: &str, data: Vec<u8>) -> Result<Vec<u8>> {
        Ok(data)
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Priority-ordered registry of reload hooks.
pub struct HookManager<V> {
    hooks: RwLock<Vec<Arc<dyn ReloadHook<V>>>>,
}

impl<V> Default for HookManager<V> {
    fn default() -> Self {
        HookManager {
            hooks: RwLock::new(Vec::new()),
        }
    }
}

impl<V> HookManager<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, hook: Arc<dyn ReloadHook<V>>) {
        let mut hooks = write_lock(&self.hooks);
        debug!("Registering reload hook '{}' (priority {})", hook.name(), hook.priority());
        hooks.push(hook);
        hooks.sort_by_key(|h| h.priority());
    }

    /// Remove every hook registered under `name`. Returns whether any was.
    pub fn remove(&self, name: &str) -> bool {
        let mut hooks = write_lock(&self.hooks);
        let before = hooks.len();
        hooks.retain(|h| h.name() != name);
        hooks.len() != before
    }

    pub fn names(&self) -> Vec<String> {
        read_lock(&self.hooks)
            .iter()
            .map(|h| h.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        read_lock(&self.hooks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn ReloadHook<V>>> {
        read_lock(&self.hooks).clone()
    }

    fn run(
        &self,
        mut call: impl FnMut(&dyn ReloadHook<V>) -> Result<()>,
    ) -> Result<()> {
        for hook in self.snapshot() {
            call(hook.as_ref()).map_err(|e| Error::HookError {
                hook: hook.name().to_string(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }

    pub fn before_reload(&self, key: &str) -> Result<()> {
        self.run(|hook| hook.before_reload(key))
    }

    pub fn after_reload(&self, key: &str, data: &V) -> Result<()> {
        self.run(|hook| hook.after_reload(key, data))
    }

    pub fn on_reload_error(&self, key: &str, error: &Error) -> Result<()> {
        self.run(|hook| hook.on_reload_error(key, error))
    }
}

/// Priority-ordered registry of data transformers.
#[derive(Default)]
pub struct TransformerManager {
    transformers: RwLock<Vec<Arc<dyn DataTransformer>>>,
}

impl TransformerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transformer, replacing any with the same name.
    pub fn add(&self, transformer: Arc<dyn DataTransformer>) {
        let mut transformers = write_lock(&self.transformers);
        transformers.retain(|t| t.name() != transformer.name());
        debug!(
            "Registering transformer '{}' (priority {})",
            transformer.name(),
            transformer.priority()
        );
        transformers.push(transformer);
        transformers.sort_by_key(|t| t.priority());
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut transformers = write_lock(&self.transformers);
        let before = transformers.len();
        transformers.retain(|t| t.name() != name);
        transformers.len() != before
    }

    pub fn names(&self) -> Vec<String> {
        read_lock(&self.transformers)
            .iter()
            .map(|t| t.name().to_string())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        read_lock(&self.transformers).is_empty()
    }

    /// Thread `data` through every matching transformer in priority order.
    ///
    /// Each predicate sees the previous transformer's output. Returns the
    /// names of the transformers that ran, in order, and the final bytes.
    pub fn apply(&self, key: &str, data: Vec<u8>) -> Result<(Vec<String>, Vec<u8>)> {
        let transformers = read_lock(&self.transformers).clone();
        let mut applied = Vec::new();
        let mut data = data;
        for transformer in transformers {
            if !transformer.should_transform(key, &data) {
                continue;
            }
            data = transformer.transform(key, data).map_err(|e| wrap(&*transformer, e))?;
            applied.push(transformer.name().to_string());
        }
        Ok((applied, data))
    }

    /// Undo the recorded transformers in reverse order.
    pub fn restore(&self, key: &str, applied: &[String], data: Vec<u8>) -> Result<Vec<u8>> {
        let by_name: HashMap<String, Arc<dyn DataTransformer>> = read_lock(&self.transformers)
            .iter()
            .map(|t| (t.name().to_string(), Arc::clone(t)))
            .collect();

        let mut data = data;
        for name in applied.iter().rev() {
            let transformer = by_name.get(name).ok_or_else(|| Error::TransformError {
                transformer: name.clone(),
                message: "transformer not registered; cannot restore value".to_string(),
            })?;
            data = transformer
                .restore(key, data)
                .map_err(|e| wrap(transformer.as_ref(), e))?;
        }
        Ok(data)
    }
}

fn wrap(transformer: &dyn DataTransformer, error: Error) -> Error {
    match error {
        // Already attributed (e.g. a wrapped transformer).
        Error::TransformError { .. } | Error::ValidationError(_) => error,
        other => Error::TransformError {
            transformer: transformer.name().to_string(),
            message: other.to_string(),
        },
    }
}
