use std::path::PathBuf;

use crate::registry::ErrorEntry;

/// Errors produced by the image, cache and registry layers.
#[derive(Debug, thiserror::Error)]
pub enum OciError {
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("layer property not available: {0}")]
    LayerPropertyNotFound(&'static str),

    #[error("duplicate layer: {0}")]
    DuplicateLayer(String),

    #[error("cache path is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("container configuration must be built before the manifest")]
    ConfigurationNotBuilt,

    #[error("invalid image reference: {0}")]
    InvalidImageReference(String),

    #[error("invalid registry URL: {0}")]
    InvalidUrl(String),

    #[error("unknown manifest format: {0}")]
    UnknownManifestFormat(String),

    #[error("{action} failed: {}", format_entries(.errors))]
    RegistryErrorResponse {
        action: String,
        errors: Vec<ErrorEntry>,
    },

    #[error("{action} is unauthorized (HTTP {status})")]
    Unauthorized { action: String, status: u16 },

    #[error("authentication with {realm} failed: {source}")]
    AuthenticationFailed {
        realm: String,
        #[source]
        source: Box<OciError>,
    },

    #[error("{action} failed: {reason}")]
    UnexpectedResponse { action: String, reason: String },

    #[error("{action} returned HTTP {status}: {body}")]
    HttpStatus {
        action: String,
        status: u16,
        body: String,
    },

    #[error("cache metadata lock poisoned")]
    LockPoisoned,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OciError {
    /// True for 401/403 responses, after which a caller may re-authenticate
    /// once and retry.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, OciError::Unauthorized { .. })
    }
}

fn format_entries(errors: &[ErrorEntry]) -> String {
    if errors.is_empty() {
        return "registry returned no error details".to_string();
    }
    errors
        .iter()
        .map(|e| format!("{}: {}", e.code, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OciError>;
