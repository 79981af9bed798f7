//! Docker Registry HTTP API V2 client.
//!
//! Every exchange is described by a [`RegistryEndpoint`] built for that one
//! call and driven by [`RegistryClient::call`], which owns the shared status
//! handling.

mod auth;
mod blob_puller;
mod blob_pusher;
mod endpoint;
mod manifest_puller;
mod manifest_pusher;

pub use auth::{Authorization, RegistryAuthenticator};
pub use blob_puller::BlobPuller;
pub use blob_pusher::{extract_location, BlobCommitter, BlobInitializer, BlobPusher, BlobWriter};
pub use endpoint::{RegistryContext, RegistryEndpoint};
pub use manifest_puller::ManifestPuller;
pub use manifest_pusher::ManifestPusher;

use reqwest::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::blob::Blob;
use crate::digest::DescriptorDigest;
use crate::manifest::{ManifestTemplate, V22ManifestTemplate};
use crate::{OciError, Result};

const DEFAULT_REGISTRY: &str = "registry-1.docker.io";
const DEFAULT_TAG: &str = "latest";

// ---------------------------------------------------------------------------
// ImageReference
// ---------------------------------------------------------------------------

/// A parsed `registry/repository:tag` (or `@digest`) reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    /// Tag or digest.
    pub tag: String,
}

impl ImageReference {
    /// Accepts `busybox`, `library/busybox:1.36`, `localhost:5000/app:1.0`
    /// and `gcr.io/org/app@sha256:<hex>`.  The registry component is only
    /// recognised when it contains a `.` or `:` or is `localhost`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw.chars().any(char::is_whitespace) {
            return Err(OciError::InvalidImageReference(raw.to_string()));
        }

        let (name, tag) = match raw.split_once('@') {
            Some((name, digest)) => (name, digest.to_string()),
            None => {
                let last_slash = raw.rfind('/').map(|p| p + 1).unwrap_or(0);
                match raw[last_slash..].rfind(':') {
                    Some(colon) => {
                        let colon = last_slash + colon;
                        (&raw[..colon], raw[colon + 1..].to_string())
                    }
                    None => (raw, DEFAULT_TAG.to_string()),
                }
            }
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest)) if first.contains('.') || first.contains(':') || first == "localhost" => {
                (first.to_string(), rest.to_string())
            }
            _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        };
        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };

        if repository.is_empty() || tag.is_empty() {
            return Err(OciError::InvalidImageReference(raw.to_string()));
        }
        Ok(Self {
            registry,
            repository,
            tag,
        })
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sep = if self.tag.contains(':') { '@' } else { ':' };
        write!(f, "{}/{}{}{}", self.registry, self.repository, sep, self.tag)
    }
}

// ---------------------------------------------------------------------------
// Error bodies
// ---------------------------------------------------------------------------

/// One entry of a registry `{"errors": [...]}` body, kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub code: String,

    #[serde(default)]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl ErrorEntry {
    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::from_code(&self.code)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ErrorResponseTemplate {
    pub errors: Vec<ErrorEntry>,
}

/// Error codes defined by the registry API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BlobUnknown,
    BlobUploadInvalid,
    BlobUploadUnknown,
    DigestInvalid,
    ManifestBlobUnknown,
    ManifestInvalid,
    ManifestUnknown,
    ManifestUnverified,
    NameInvalid,
    NameUnknown,
    SizeInvalid,
    TagInvalid,
    Unauthorized,
    Denied,
    Unsupported,
    Unknown,
}

impl ErrorCode {
    pub fn from_code(code: &str) -> Self {
        match code {
            "BLOB_UNKNOWN" => ErrorCode::BlobUnknown,
            "BLOB_UPLOAD_INVALID" => ErrorCode::BlobUploadInvalid,
            "BLOB_UPLOAD_UNKNOWN" => ErrorCode::BlobUploadUnknown,
            "DIGEST_INVALID" => ErrorCode::DigestInvalid,
            "MANIFEST_BLOB_UNKNOWN" => ErrorCode::ManifestBlobUnknown,
            "MANIFEST_INVALID" => ErrorCode::ManifestInvalid,
            "MANIFEST_UNKNOWN" => ErrorCode::ManifestUnknown,
            "MANIFEST_UNVERIFIED" => ErrorCode::ManifestUnverified,
            "NAME_INVALID" => ErrorCode::NameInvalid,
            "NAME_UNKNOWN" => ErrorCode::NameUnknown,
            "SIZE_INVALID" => ErrorCode::SizeInvalid,
            "TAG_INVALID" => ErrorCode::TagInvalid,
            "UNAUTHORIZED" => ErrorCode::Unauthorized,
            "DENIED" => ErrorCode::Denied,
            "UNSUPPORTED" => ErrorCode::Unsupported,
            _ => ErrorCode::Unknown,
        }
    }
}

// ---------------------------------------------------------------------------
// RegistryClient
// ---------------------------------------------------------------------------

/// Client for one repository on one registry.  Holds no connection or
/// credential state beyond the optional `Authorization` it was given.
pub struct RegistryClient {
    http: reqwest::Client,
    context: RegistryContext,
    authorization: Option<Authorization>,
}

/// Localhost and loopback registries default to HTTP; everything else to HTTPS.
fn registry_scheme(registry: &str) -> &'static str {
    let host = match registry.strip_prefix('[') {
        Some(rest) => rest.split(']').next().unwrap_or(rest),
        None => registry.split(':').next().unwrap_or(registry),
    };
    if host == "localhost" || host == "127.0.0.1" || host == "::1" {
        "http"
    } else {
        "https"
    }
}

impl RegistryClient {
    pub fn new(registry: &str, repository: &str) -> Result<Self> {
        let base = format!("{}://{}/", registry_scheme(registry), registry);
        let base_url = Url::parse(&base).map_err(|e| OciError::InvalidUrl(format!("{base}: {e}")))?;
        let http = reqwest::Client::builder()
            .user_agent(concat!("layerbake/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            context: RegistryContext::new(base_url, repository),
            authorization: None,
        })
    }

    pub fn for_image(image: &ImageReference) -> Result<Self> {
        Self::new(&image.registry, &image.repository)
    }

    pub fn with_authorization(mut self, authorization: Option<Authorization>) -> Self {
        self.authorization = authorization;
        self
    }

    pub fn context(&self) -> &RegistryContext {
        &self.context
    }

    // -- public API ---------------------------------------------------------

    pub async fn pull_manifest(&self, tag: &str) -> Result<ManifestTemplate> {
        self.call(ManifestPuller::new(tag)).await
    }

    /// Download and verify a blob.
    pub async fn pull_blob(&self, digest: &DescriptorDigest) -> Result<Vec<u8>> {
        self.call(BlobPuller::new(digest.clone())).await
    }

    /// Upload a blob.  Returns `true` if the registry already had it.
    pub async fn push_blob(&self, digest: &DescriptorDigest, blob: Blob) -> Result<bool> {
        let mut pusher = BlobPusher::new(digest.clone(), blob);
        let Some(location) = self.call(pusher.initializer()).await? else {
            info!(%digest, "blob already exists on registry");
            return Ok(true);
        };
        let location = self.call(pusher.writer(location)?).await?;
        self.call(pusher.committer(location)).await?;
        info!(%digest, "pushed blob");
        Ok(false)
    }

    pub async fn push_manifest(&self, manifest: &V22ManifestTemplate, tag: &str) -> Result<()> {
        self.call(ManifestPusher::new(manifest, tag)?).await
    }

    /// Push a manifest exactly as serialized by the translator.
    pub async fn push_manifest_bytes(&self, manifest: Vec<u8>, tag: &str) -> Result<()> {
        self.call(ManifestPusher::from_bytes(manifest, tag)).await?;
        info!(repository = %self.context.repository, tag, "pushed manifest");
        Ok(())
    }

    /// Probe `GET /v2/` for a bearer challenge.  Returns `None` when the
    /// registry allows anonymous access.
    pub async fn discover_authenticator(&self) -> Result<Option<RegistryAuthenticator>> {
        let url = self.context.url("/v2/")?;
        let response = self.http.get(url).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        RegistryAuthenticator::from_challenge(&challenge, &self.context.repository).map(Some)
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Perform one exchange.  2xx responses go to the endpoint; 401/403 map
    /// to [`OciError::Unauthorized`]; 400/404 with a structured body map to
    /// [`OciError::RegistryErrorResponse`].
    pub async fn call<E: RegistryEndpoint>(&self, mut endpoint: E) -> Result<E::Output> {
        let action = endpoint.action_description(&self.context);
        let url = endpoint.url(&self.context)?;
        let method = endpoint.method();
        debug!(%method, %url, "registry request");

        let mut request = self.http.request(method, url);
        if let Some(auth) = &self.authorization {
            request = request.header(AUTHORIZATION, auth.header_value());
        }
        for accept in endpoint.accept() {
            request = request.header(reqwest::header::ACCEPT, accept);
        }
        let request = endpoint.build_request(request)?;
        let response = request.send().await?;

        let status = response.status();
        if status.is_success() {
            return endpoint.handle_response(response, &self.context).await;
        }

        debug!(status = status.as_u16(), action = %action, "registry call failed");
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(OciError::Unauthorized {
                action,
                status: status.as_u16(),
            }),
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => {
                let body = response.bytes().await?;
                match serde_json::from_slice::<ErrorResponseTemplate>(&body) {
                    Ok(template) => Err(OciError::RegistryErrorResponse {
                        action,
                        errors: template.errors,
                    }),
                    Err(_) => Err(OciError::HttpStatus {
                        action,
                        status: status.as_u16(),
                        body: String::from_utf8_lossy(&body).into_owned(),
                    }),
                }
            }
            _ => Err(OciError::HttpStatus {
                action,
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
