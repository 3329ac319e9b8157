//! Engine configuration.
//!
//! [`EngineConfig::default`] is usable as-is. [`EngineConfig::from_env`]
//! overrides defaults from `CACHE_ENGINE_*` variables:
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `CACHE_ENGINE_STRATEGY` | `read_through`, `write_through`, `write_behind`, `cache_aside` |
//! | `CACHE_ENGINE_DEFAULT_TTL_SECS` | strategy write TTL, `0` for none |
//! | `CACHE_ENGINE_WRITE_BEHIND_CAPACITY` | write-behind queue size |
//! | `CACHE_ENGINE_CODEC` | `json` or `postcard` |
//! | `CACHE_ENGINE_RELOAD_STRATEGY` | `refresh`, `replace`, `lazy`, `scheduled` |
//! | `CACHE_ENGINE_RELOAD_TTL_SECS` | reload TTL, `0` for none |
//! | `CACHE_ENGINE_RELOAD_BATCH_SIZE` | keys per reload chunk |
//! | `CACHE_ENGINE_RELOAD_MAX_RETRIES` | extra source load attempts |
//! | `CACHE_ENGINE_RELOAD_RETRY_DELAY_MS` | delay between load attempts |
//! | `CACHE_ENGINE_RELOAD_INTERVAL_SECS` | enables scheduled reload |
//! | `CACHE_ENGINE_WARM_UP` | `true` to warm on startup |
//! | `CACHE_ENGINE_WARM_UP_KEYS` | comma separated warm-up keys |
//! | `CACHE_ENGINE_INVALIDATION_BATCH_SIZE` | keys per delete command |
//! | `CACHE_ENGINE_INVALIDATION_MAX_RETRIES` | delete attempts per chunk |
//! | `CACHE_ENGINE_INVALIDATION_RETRY_DELAY_MS` | linear backoff base |
//! | `CACHE_ENGINE_MAX_EVENTS` | invalidation events kept |

use crate::error::{Error, Result};
use crate::invalidation::InvalidationConfig;
use crate::reload::ReloadConfig;
use crate::serialization::Codec;
use crate::strategy::{StrategyKind, DEFAULT_QUEUE_CAPACITY};
use std::str::FromStr;
use std::time::Duration;

const PREFIX: &str = "CACHE_ENGINE_";

/// Everything a [`crate::CacheService`] needs besides its backend and
/// data source.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    pub strategy: StrategyKind,
    /// TTL for strategy writes and read-through population.
    pub default_ttl: Option<Duration>,
    pub write_behind_capacity: usize,
    pub codec: Codec,
    pub reload: ReloadConfig,
    pub invalidation: InvalidationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            strategy: StrategyKind::default(),
            default_ttl: Some(Duration::from_secs(60 * 60)),
            write_behind_capacity: DEFAULT_QUEUE_CAPACITY,
            codec: Codec::default(),
            reload: ReloadConfig::default(),
            invalidation: InvalidationConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `CACHE_ENGINE_*` environment variables.
    ///
    /// # Errors
    ///
    /// `Error::ConfigError` if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`EngineConfig::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };
        let mut config = EngineConfig::default();

        if let Some(strategy) = vars.parse::<StrategyKind>("STRATEGY")? {
            config.strategy = strategy;
        }
        if let Some(ttl) = vars.ttl_secs("DEFAULT_TTL_SECS")? {
            config.default_ttl = ttl;
        }
        if let Some(capacity) = vars.parse::<usize>("WRITE_BEHIND_CAPACITY")? {
            config.write_behind_capacity = capacity;
        }
        if let Some(codec) = vars.parse::<Codec>("CODEC")? {
            config.codec = codec;
        }

        let reload = &mut config.reload;
        if let Some(strategy) = vars.parse("RELOAD_STRATEGY")? {
            reload.strategy = strategy;
        }
        if let Some(ttl) = vars.ttl_secs("RELOAD_TTL_SECS")? {
            reload.ttl = ttl;
        }
        if let Some(size) = vars.parse("RELOAD_BATCH_SIZE")? {
            reload.batch_size = size;
        }
        if let Some(retries) = vars.parse("RELOAD_MAX_RETRIES")? {
            reload.max_retries = retries;
        }
        if let Some(ms) = vars.parse::<u64>("RELOAD_RETRY_DELAY_MS")? {
            reload.retry_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = vars.parse::<u64>("RELOAD_INTERVAL_SECS")? {
            reload.enable_scheduled_reload = secs > 0;
            reload.reload_interval = Duration::from_secs(secs);
        }
        if let Some(enabled) = vars.parse("WARM_UP")? {
            reload.enable_warm_up = enabled;
        }
        if let Some(keys) = vars.get("WARM_UP_KEYS") {
            reload.warm_up_keys = keys
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect();
        }

        let invalidation = &mut config.invalidation;
        if let Some(size) = vars.parse("INVALIDATION_BATCH_SIZE")? {
            invalidation.batch_size = size;
        }
        if let Some(retries) = vars.parse("INVALIDATION_MAX_RETRIES")? {
            invalidation.max_retries = retries;
        }
        if let Some(ms) = vars.parse::<u64>("INVALIDATION_RETRY_DELAY_MS")? {
            invalidation.retry_delay = Duration::from_millis(ms);
        }
        if let Some(max) = vars.parse("MAX_EVENTS")? {
            invalidation.max_events = max;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_reload(mut self, reload: ReloadConfig) -> Self {
        self.reload = reload;
        self
    }

    pub fn with_invalidation(mut self, invalidation: InvalidationConfig) -> Self {
        self.invalidation = invalidation;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.write_behind_capacity == 0 {
            return Err(Error::ConfigError(
                "write_behind_capacity must be at least 1".into(),
            ));
        }
        if self.invalidation.batch_size == 0 {
            return Err(Error::ConfigError(
                "invalidation batch_size must be at least 1".into(),
            ));
        }
        self.reload.validate()
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{}{}", PREFIX, name))
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(name) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
                Error::ConfigError(format!("{}{}={:?}: {}", PREFIX, name, raw, e))
            }),
        }
    }

    /// Seconds, where `0` means no TTL.
    fn ttl_secs(&self, name: &str) -> Result<Option<Option<Duration>>> {
        Ok(self
            .parse::<u64>(name)?
            .map(|secs| (secs > 0).then(|| Duration::from_secs(secs))))
    }
}
