//! Task Graph Scheduler
//!
//! An [`AsyncStep`] is one deferred computation plus the steps it waits on.
//! Forcing a step schedules it on its [`StepPool`] exactly once. It starts
//! only after every dependency has completed, and a failed dependency fails
//! the step without running its computation.
//!
//! Computations read their inputs by capturing the dependency handles and
//! calling [`AsyncStep::result`], which is always populated by the time a
//! dependent starts.

mod pool;

pub use pool::StepPool;

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Instant;

use futures_util::future::{try_join_all, BoxFuture, Shared};
use futures_util::FutureExt;
use tokio::runtime::Handle;
use tracing::{debug, warn, Instrument};

use crate::{Error, Result};

static NEXT_STEP_ID: AtomicU64 = AtomicU64::new(1);

/// Serializes edge insertion so the cycle check and the insert are atomic.
static EDGE_LOCK: Mutex<()> = Mutex::new(());

type Computation<T> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T>> + Send>;

type Completion = Shared<BoxFuture<'static, std::result::Result<(), StepFailure>>>;

/// The step that failed first, shared by every dependent that observes it.
#[derive(Clone)]
struct StepFailure {
    step: String,
    error: Arc<Error>,
}

impl StepFailure {
    fn new(step: &str, error: Error) -> Self {
        Self {
            step: step.to_string(),
            error: Arc::new(error),
        }
    }
}

impl From<StepFailure> for Error {
    fn from(failure: StepFailure) -> Self {
        Error::StepFailed {
            step: failure.step,
            source: failure.error,
        }
    }
}

/// Type-erased view of a step, independent of its result type.
trait Node: Send + Sync {
    fn id(&self) -> u64;
    fn name(&self) -> &str;
    fn dependencies(&self) -> Vec<StepHandle>;
    fn completion(&self) -> Completion;
}

/// Reference to a step of any result type, used as a dependency edge.
#[derive(Clone)]
pub struct StepHandle(Arc<dyn Node>);

impl StepHandle {
    pub fn name(&self) -> &str {
        self.0.name()
    }

    fn id(&self) -> u64 {
        self.0.id()
    }

    /// Whether the step with id `target` is this step or one of its
    /// transitive dependencies.
    fn reaches(&self, target: u64) -> bool {
        let mut stack = vec![self.clone()];
        let mut seen = HashSet::new();
        while let Some(node) = stack.pop() {
            if node.id() == target {
                return true;
            }
            if seen.insert(node.id()) {
                stack.extend(node.0.dependencies());
            }
        }
        false
    }
}

impl fmt::Debug for StepHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StepHandle").field(&self.name()).finish()
    }
}

/// Something a step can wait on.
pub trait Dependency {
    fn handle(&self) -> StepHandle;
}

impl Dependency for StepHandle {
    fn handle(&self) -> StepHandle {
        self.clone()
    }
}

struct Edges {
    dependencies: Vec<StepHandle>,
    sealed: bool,
}

struct StepInner<T> {
    id: u64,
    name: String,
    runtime: Handle,
    edges: Mutex<Edges>,
    computation: Mutex<Option<Computation<T>>>,
    completion: OnceLock<Completion>,
    result: Arc<OnceLock<Arc<T>>>,
}

impl<T: Send + Sync + 'static> StepInner<T> {
    fn schedule(&self) -> Completion {
        let dependencies = {
            let mut edges = self.edges.lock().unwrap_or_else(PoisonError::into_inner);
            edges.sealed = true;
            edges.dependencies.clone()
        };
        debug!(step = %self.name, dependencies = dependencies.len(), "scheduling step");

        let waits: Vec<Completion> = dependencies.iter().map(|d| d.0.completion()).collect();
        let computation = self
            .computation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let span = tracing::debug_span!("step", step = %self.name);
        let task = self.runtime.spawn(
            run_step(self.name.clone(), waits, computation, Arc::clone(&self.result)).instrument(span),
        );

        let name = self.name.clone();
        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(StepFailure::new(
                    &name,
                    Error::Runtime(format!("step task did not complete: {e}")),
                )),
            }
        }
        .boxed()
        .shared()
    }
}

async fn run_step<T>(
    name: String,
    waits: Vec<Completion>,
    computation: Option<Computation<T>>,
    result: Arc<OnceLock<Arc<T>>>,
) -> std::result::Result<(), StepFailure> {
    try_join_all(waits).await?;

    let Some(computation) = computation else {
        return Err(StepFailure::new(
            &name,
            Error::Runtime(format!("step '{name}' has no computation")),
        ));
    };

    let started = Instant::now();
    debug!("step started");
    match computation().await {
        Ok(value) => {
            let _ = result.set(Arc::new(value));
            debug!(elapsed_ms = started.elapsed().as_millis() as u64, "step finished");
            Ok(())
        }
        Err(error) => {
            warn!(%error, "step failed");
            Err(StepFailure::new(&name, error))
        }
    }
}

impl<T: Send + Sync + 'static> Node for StepInner<T> {
    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<StepHandle> {
        self.edges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .dependencies
            .clone()
    }

    fn completion(&self) -> Completion {
        self.completion.get_or_init(|| self.schedule()).clone()
    }
}

/// A deferred computation producing `T`, run at most once.
///
/// Cloning yields another handle to the same step.
pub struct AsyncStep<T> {
    inner: Arc<StepInner<T>>,
}

impl<T> Clone for AsyncStep<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> AsyncStep<T> {
    pub fn new<F, Fut>(pool: &StepPool, name: impl Into<String>, computation: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let computation: Computation<T> = Box::new(move || computation().boxed());
        Self {
            inner: Arc::new(StepInner {
                id: NEXT_STEP_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                runtime: pool.handle().clone(),
                edges: Mutex::new(Edges {
                    dependencies: Vec::new(),
                    sealed: false,
                }),
                computation: Mutex::new(Some(computation)),
                completion: OnceLock::new(),
                result: Arc::new(OnceLock::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Add edges to `dependencies`. Duplicates are ignored.
    ///
    /// Fails if an edge would point at this step or close a cycle, or if the
    /// step has already been forced.
    pub fn depends_on(&self, dependencies: &[&dyn Dependency]) -> Result<()> {
        let _guard = EDGE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        for dependency in dependencies {
            let handle = dependency.handle();
            if self.is_scheduled() {
                return Err(Error::AlreadyScheduled(self.inner.name.clone()));
            }
            if handle.id() == self.inner.id {
                return Err(Error::SelfDependency(self.inner.name.clone()));
            }
            if handle.reaches(self.inner.id) {
                return Err(Error::DependencyCycle {
                    step: self.inner.name.clone(),
                    dependency: handle.name().to_string(),
                });
            }

            let mut edges = self.inner.edges.lock().unwrap_or_else(PoisonError::into_inner);
            if edges.sealed {
                return Err(Error::AlreadyScheduled(self.inner.name.clone()));
            }
            if !edges.dependencies.iter().any(|d| d.id() == handle.id()) {
                edges.dependencies.push(handle);
            }
        }
        Ok(())
    }

    pub fn dependencies(&self) -> Vec<StepHandle> {
        self.inner.dependencies()
    }

    /// Schedule the step if it is not scheduled yet. The returned future
    /// resolves when the step completes; every call observes the same run.
    pub fn force(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        let completion = self.inner.completion();
        async move { completion.await.map_err(Error::from) }
    }

    /// Force the step and wait for its result without blocking a thread.
    pub async fn complete(&self) -> Result<Arc<T>> {
        self.force().await?;
        self.result()
    }

    /// Force the step and block the calling thread until it completes.
    ///
    /// Must be called from outside the async runtime; inside it, await
    /// [`AsyncStep::complete`] instead.
    pub fn run(&self) -> Result<()> {
        if Handle::try_current().is_ok() {
            return Err(Error::Runtime(format!(
                "step '{}' cannot block inside an async context",
                self.inner.name
            )));
        }
        let completion = self.inner.completion();
        self.inner.runtime.block_on(completion).map_err(Error::from)
    }

    /// The finished value, or [`Error::StepNotFinished`].
    pub fn result(&self) -> Result<Arc<T>> {
        self.inner
            .result
            .get()
            .cloned()
            .ok_or_else(|| Error::StepNotFinished(self.inner.name.clone()))
    }

    pub fn is_finished(&self) -> bool {
        self.inner.result.get().is_some()
    }

    fn is_scheduled(&self) -> bool {
        self.inner.completion.get().is_some()
    }
}

impl<T: Send + Sync + 'static> Dependency for AsyncStep<T> {
    fn handle(&self) -> StepHandle {
        StepHandle(self.inner.clone())
    }
}

impl<T> fmt::Debug for AsyncStep<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncStep")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(pool: &StepPool, name: &str, value: u32) -> AsyncStep<u32> {
        pool.step(name, move || async move { Ok(value) })
    }

    #[test]
    fn reaches_follows_transitive_edges() {
        let pool = StepPool::new(1).unwrap();
        let a = constant(&pool, "a", 1);
        let b = constant(&pool, "b", 2);
        let c = constant(&pool, "c", 3);
        b.depends_on(&[&a]).unwrap();
        c.depends_on(&[&b]).unwrap();

        assert!(c.handle().reaches(a.inner.id));
        assert!(c.handle().reaches(c.inner.id));
        assert!(!a.handle().reaches(c.inner.id));
    }

    #[test]
    fn duplicate_edges_are_ignored() {
        let pool = StepPool::new(1).unwrap();
        let a = constant(&pool, "a", 1);
        let b = constant(&pool, "b", 2);
        b.depends_on(&[&a, &a]).unwrap();
        b.depends_on(&[&a.handle()]).unwrap();
        assert_eq!(b.dependencies().len(), 1);
        assert_eq!(b.dependencies()[0].name(), "a");
    }

    #[test]
    fn zero_workers_is_rejected() {
        assert!(matches!(StepPool::new(0), Err(Error::Config(_))));
    }

    #[test]
    fn failure_error_names_origin_step() {
        let err: Error = StepFailure::new("pull", Error::Runtime("boom".into())).into();
        assert_eq!(err.to_string(), "step 'pull' failed: Runtime error: boom");
        assert!(matches!(err.root_cause(), Error::Runtime(_)));
    }
}
