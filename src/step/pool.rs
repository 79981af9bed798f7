use std::future::Future;

use tokio::runtime::{Builder, Handle, Runtime};
use tracing::debug;

use super::AsyncStep;
use crate::{Error, Result};

/// Fixed-size worker pool that runs step computations.
///
/// Owns a multi-thread tokio runtime, so it must be created and dropped
/// outside of any async context.
pub struct StepPool {
    runtime: Runtime,
    workers: usize,
}

impl StepPool {
    pub const DEFAULT_WORKERS: usize = 4;

    pub fn new(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(Error::Config("step pool needs at least one worker".to_string()));
        }
        let runtime = Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name("layerbake-step")
            .enable_all()
            .build()?;
        debug!(workers, "started step pool");
        Ok(Self { runtime, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn handle(&self) -> &Handle {
        self.runtime.handle()
    }

    /// Shorthand for [`AsyncStep::new`].
    pub fn step<T, F, Fut>(&self, name: impl Into<String>, computation: F) -> AsyncStep<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        AsyncStep::new(self, name, computation)
    }
}

impl std::fmt::Debug for StepPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepPool").field("workers", &self.workers).finish()
    }
}
