//! Engine configuration
//!
//! Sizes the shared worker pool and supplies loop defaults. Values come from
//! [`EngineConfig::default`] or from `UNDERTOW_*` environment variables via
//! [`EngineConfig::from_env`].

use crate::error::{Error, Result};

/// Environment variable overriding [`EngineConfig::max_threads`]
pub const ENV_MAX_THREADS: &str = "UNDERTOW_MAX_THREADS";
/// Environment variable overriding [`EngineConfig::default_workers`]
pub const ENV_WORKERS: &str = "UNDERTOW_WORKERS";
/// Environment variable overriding [`EngineConfig::max_items`]
pub const ENV_MAX_ITEMS: &str = "UNDERTOW_MAX_ITEMS";
/// Environment variable overriding [`EngineConfig::debug`]
pub const ENV_DEBUG: &str = "UNDERTOW_DEBUG";

/// Upper bound on materialized loop input unless configured otherwise
pub const DEFAULT_MAX_ITEMS: usize = 10_000_000;

/// Configuration for flows and loops
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Threads in the shared pool; the global cap on concurrently running work
    pub max_threads: usize,
    /// Loop workers when a loop does not set its own count
    pub default_workers: usize,
    /// Largest input a loop will materialize before reporting unbounded input
    pub max_items: usize,
    /// Enable the debug reporter for flows and loops that do not choose
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cpus = num_cpus::get();
        Self {
            // Items are assumed to block, so oversubscribe the cores a little
            max_threads: (cpus + 4).min(32),
            default_workers: cpus.max(1),
            max_items: DEFAULT_MAX_ITEMS,
            debug: false,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by any `UNDERTOW_*` variables that parse
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_threads: env_usize(ENV_MAX_THREADS).unwrap_or(defaults.max_threads),
            default_workers: env_usize(ENV_WORKERS).unwrap_or(defaults.default_workers),
            max_items: env_usize(ENV_MAX_ITEMS).unwrap_or(defaults.max_items),
            debug: env_bool(ENV_DEBUG).unwrap_or(defaults.debug),
        }
    }

    /// Set the pool thread cap
    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    /// Set the default loop worker count
    pub fn with_default_workers(mut self, workers: usize) -> Self {
        self.default_workers = workers;
        self
    }

    /// Set the loop input limit
    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items;
        self
    }

    /// Set the default debug flag
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Reject zero-sized pools and worker counts
    pub fn validate(&self) -> Result<()> {
        if self.max_threads == 0 {
            return Err(Error::InvalidWorkers { workers: 0 });
        }
        if self.default_workers == 0 {
            return Err(Error::InvalidWorkers { workers: 0 });
        }
        Ok(())
    }
}

fn env_usize(key: &str) -> Option<usize> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<usize>() {
        Ok(0) | Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring invalid engine setting");
            None
        }
        Ok(n) => Some(n),
    }
}

fn env_bool(key: &str) -> Option<bool> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!(key, value = %raw, "ignoring invalid engine setting");
            None
        }
    }
}
