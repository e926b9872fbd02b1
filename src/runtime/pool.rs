//! Bounded worker pool shared by flows and loops
//!
//! One process-wide pool is built lazily from [`EngineConfig::from_env`]; its
//! thread count is the global cap on concurrently running work, however deeply
//! flows and loops nest. Callers needing isolation can build their own pool.

use std::fmt;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::{Error, Result};

lazy_static::lazy_static! {
    /// Shared pool used when a flow or loop does not name one
    static ref GLOBAL_POOL: Result<Arc<WorkerPool>> =
        WorkerPool::new(EngineConfig::from_env()).map(Arc::new);
}

/// Fixed-size pool of OS threads
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    config: EngineConfig,
}

impl WorkerPool {
    /// Builds a pool with `config.max_threads` threads
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.max_threads)
            .thread_name(|i| format!("undertow-worker-{}", i))
            .build()
            .map_err(|e| Error::PoolBuild(e.to_string()))?;
        tracing::debug!(threads = config.max_threads, "worker pool started");
        Ok(WorkerPool { pool, config })
    }

    /// The process-wide pool
    pub fn global() -> Result<Arc<WorkerPool>> {
        GLOBAL_POOL.clone()
    }

    /// Configuration the pool was built with
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of worker threads
    pub fn max_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// True when called from one of this pool's worker threads
    pub fn is_worker_thread(&self) -> bool {
        self.pool.current_thread_index().is_some()
    }

    /// Queues a job; returns immediately
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.spawn(job);
    }

    /// Runs `op` inside the pool, blocking the caller until it returns
    ///
    /// Called from a worker of this pool, `op` runs in place.
    pub fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.max_threads())
            .field("config", &self.config)
            .finish()
    }
}
