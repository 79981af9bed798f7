use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, Url};

use crate::{OciError, Result};

/// Where a client's calls are routed: the registry base URL and the
/// repository every endpoint addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryContext {
    pub base_url: Url,
    pub repository: String,
}

impl RegistryContext {
    pub fn new(base_url: Url, repository: impl Into<String>) -> Self {
        Self {
            base_url,
            repository: repository.into(),
        }
    }

    /// Resolve `reference` against the base URL.  Absolute URLs are returned
    /// as-is, so upload `Location`s may point at another host.
    pub fn url(&self, reference: &str) -> Result<Url> {
        self.base_url
            .join(reference)
            .map_err(|e| OciError::InvalidUrl(format!("{reference}: {e}")))
    }

    /// `/v2/<repository>/<suffix>` on this registry.
    pub fn api_url(&self, suffix: &str) -> Result<Url> {
        self.url(&format!("/v2/{}/{}", self.repository, suffix))
    }
}

/// One HTTP exchange with the registry.
#[async_trait]
pub trait RegistryEndpoint: Send {
    type Output: Send;

    fn method(&self) -> Method;

    fn url(&self, context: &RegistryContext) -> Result<Url>;

    /// Media types to list in `Accept`.
    fn accept(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Attach a body or extra headers.
    fn build_request(&mut self, request: RequestBuilder) -> Result<RequestBuilder> {
        Ok(request)
    }

    /// Interpret a 2xx response.
    async fn handle_response(&mut self, response: Response, context: &RegistryContext) -> Result<Self::Output>;

    /// Human-readable description used in errors, e.g. "pull manifest for
    /// library/busybox:latest".
    fn action_description(&self, context: &RegistryContext) -> String;
}
