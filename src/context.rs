//! Per-run configuration and resources.

use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::info;

use crate::compositor::Compositor;
use crate::error::Result;
use crate::resample::Resampling;
use crate::terrain_rgb::{Encoding, NodataPolicy};

/// Upper bound on workers picked automatically. Each worker holds its own
/// read connections to every source.
pub const MAX_AUTO_WORKERS: usize = 8;

/// Everything a run needs to know, as plain data.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Scheme of every tile written.
    pub encoding: Encoding,
    pub nodata: NodataPolicy,
    pub resampling: Resampling,
    /// Worker count; `None` picks from available parallelism.
    pub threads: Option<usize>,
}

impl Default for RunConfig {
    fn default() -> Self {
        let encoding = Encoding::default();
        Self {
            encoding,
            nodata: NodataPolicy::for_encoding(&encoding),
            resampling: Resampling::default(),
            threads: None,
        }
    }
}

impl RunConfig {
    pub fn worker_count(&self) -> usize {
        match self.threads {
            Some(n) => n.max(1),
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .min(MAX_AUTO_WORKERS),
        }
    }
}

/// Created once at start-up and passed to every pipeline.
///
/// Owns a dedicated thread pool, so runs never touch rayon's global pool.
pub struct RunContext {
    config: RunConfig,
    pool: ThreadPool,
}

impl RunContext {
    pub fn new(config: RunConfig) -> Result<Self> {
        let workers = config.worker_count();
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("terrain-merge-{}", i))
            .build()?;
        info!(
            "Run context: {} workers, encoding {}, resampling {}",
            workers, config.encoding, config.resampling
        );
        Ok(Self { config, pool })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn compositor(&self) -> Compositor {
        Compositor::new(self.config.resampling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_threads() {
        let ctx = RunContext::new(RunConfig {
            threads: Some(3),
            ..RunConfig::default()
        })
        .unwrap();
        assert_eq!(ctx.workers(), 3);
    }

    #[test]
    fn test_auto_threads_are_capped() {
        let config = RunConfig::default();
        let n = config.worker_count();
        assert!((1..=MAX_AUTO_WORKERS).contains(&n));
        assert_eq!(RunConfig { threads: Some(0), ..config }.worker_count(), 1);
    }
}
