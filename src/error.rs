//! Error types for layerbake

use std::sync::Arc;

use thiserror::Error;

/// Result type alias using layerbake Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while scheduling and running a build
#[derive(Error, Debug)]
pub enum Error {
    /// Image, cache or registry errors
    #[error("OCI error: {0}")]
    Oci(#[from] layerbake_oci::OciError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Worker pool or task failures
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// A step named itself as a dependency
    #[error("step '{0}' cannot depend on itself")]
    SelfDependency(String),

    /// An edge would close a dependency cycle
    #[error("dependency of '{step}' on '{dependency}' would create a cycle")]
    DependencyCycle { step: String, dependency: String },

    /// Edges can only be added before a step is first forced
    #[error("step '{0}' is already scheduled")]
    AlreadyScheduled(String),

    /// Result requested before the step completed
    #[error("step '{0}' has not finished")]
    StepNotFinished(String),

    /// A step, or one of its dependencies, failed
    #[error("step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: Arc<Error>,
    },
}

impl Error {
    /// The error that started a chain of step failures.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::StepFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
