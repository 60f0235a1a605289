//! Bounded worker pool.
//!
//! Every phase of a tick runs inside one `rayon` scope; the scope returning is
//! the phase barrier.

use std::num::NonZeroUsize;

use log::info;

use crate::sd_error::{Result, SimError};

pub struct WorkerPool {
    pool: rayon::ThreadPool,
    size: usize,
}

impl WorkerPool {
    /// `workers == 0` means hardware parallelism times `multiplier`
    pub fn resolve_size(workers: usize, multiplier: usize) -> usize {
        if workers > 0 {
            return workers;
        }
        let cores = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        cores * multiplier.max(1)
    }

    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(SimError::Config("worker pool size must be positive".into()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(|i| format!("sim-worker-{}", i))
            .build()
            .map_err(|e| SimError::Pool(e.to_string()))?;
        info!("worker pool ready with {} threads", size);
        Ok(Self { pool, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `op` with a scope; returns once every job spawned on it finished
    pub fn phase<'scope, OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce(&rayon::Scope<'scope>) -> R + Send,
        R: Send,
    {
        self.pool.scope(op)
    }

    /// Apply `f` to every index in parallel and wait for all of them
    pub fn for_each_index<F>(&self, indices: &[usize], f: F)
    where
        F: Fn(usize) + Sync,
    {
        let f = &f;
        self.pool.scope(|s| {
            for &index in indices {
                s.spawn(move |_| f(index));
            }
        });
    }
}
