use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, RequestBuilder, Response, Url};

use super::endpoint::{RegistryContext, RegistryEndpoint};
use crate::manifest::{V22ManifestTemplate, MEDIA_TYPE_DOCKER_MANIFEST};
use crate::Result;

/// `PUT /v2/<name>/manifests/<tag>` with a V2.2 manifest body.
pub struct ManifestPusher {
    body: Vec<u8>,
    tag: String,
}

impl ManifestPusher {
    pub fn new(manifest: &V22ManifestTemplate, tag: impl Into<String>) -> Result<Self> {
        Ok(Self::from_bytes(serde_json::to_vec(manifest)?, tag))
    }

    /// Push already-serialized manifest bytes, so the pushed document is
    /// exactly the one whose digest was computed.
    pub fn from_bytes(body: Vec<u8>, tag: impl Into<String>) -> Self {
        Self {
            body,
            tag: tag.into(),
        }
    }
}

#[async_trait]
impl RegistryEndpoint for ManifestPusher {
    type Output = ();

    fn method(&self) -> Method {
        Method::PUT
    }

    fn url(&self, context: &RegistryContext) -> Result<Url> {
        context.api_url(&format!("manifests/{}", self.tag))
    }

    fn build_request(&mut self, request: RequestBuilder) -> Result<RequestBuilder> {
        Ok(request
            .header(CONTENT_TYPE, MEDIA_TYPE_DOCKER_MANIFEST)
            .body(std::mem::take(&mut self.body)))
    }

    async fn handle_response(&mut self, _response: Response, _context: &RegistryContext) -> Result<()> {
        Ok(())
    }

    fn action_description(&self, context: &RegistryContext) -> String {
        format!("push image manifest for {}:{}", context.repository, self.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::client_for;
    use crate::OciError;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn pushes_exact_bytes() {
        let body = br#"{"schemaVersion":2}"#.to_vec();
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/v2/test/app/manifests/v1")
                    .body(r#"{"schemaVersion":2}"#);
                then.status(201);
            })
            .await;

        client_for(&server)
            .call(ManifestPusher::from_bytes(body, "v1"))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn invalid_manifest_is_registry_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path("/v2/test/app/manifests/v1");
                then.status(400)
                    .body(r#"{"errors":[{"code":"MANIFEST_INVALID","message":"manifest invalid"}]}"#);
            })
            .await;

        let err = client_for(&server)
            .call(ManifestPusher::from_bytes(b"{}".to_vec(), "v1"))
            .await
            .unwrap_err();
        match err {
            OciError::RegistryErrorResponse { errors, .. } => {
                assert_eq!(errors[0].code, "MANIFEST_INVALID");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
