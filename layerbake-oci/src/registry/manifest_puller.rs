use async_trait::async_trait;
use reqwest::{Method, Response, Url};

use super::endpoint::{RegistryContext, RegistryEndpoint};
use crate::manifest::{ManifestTemplate, MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST_V1};
use crate::Result;

/// `GET /v2/<name>/manifests/<reference>`.
pub struct ManifestPuller {
    tag: String,
}

impl ManifestPuller {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

#[async_trait]
impl RegistryEndpoint for ManifestPuller {
    type Output = ManifestTemplate;

    fn method(&self) -> Method {
        Method::GET
    }

    fn url(&self, context: &RegistryContext) -> Result<Url> {
        context.api_url(&format!("manifests/{}", self.tag))
    }

    fn accept(&self) -> Vec<&'static str> {
        vec![MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST_V1]
    }

    async fn handle_response(&mut self, response: Response, _context: &RegistryContext) -> Result<ManifestTemplate> {
        let body = response.bytes().await?;
        ManifestTemplate::from_json(&body)
    }

    fn action_description(&self, context: &RegistryContext) -> String {
        format!("pull image manifest for {}:{}", context.repository, self.tag)
    }
}
