use async_trait::async_trait;
use reqwest::{Method, Response, Url};

use super::endpoint::{RegistryContext, RegistryEndpoint};
use crate::digest::DescriptorDigest;
use crate::{OciError, Result};

/// `GET /v2/<name>/blobs/<digest>`.  The body must hash to the requested
/// digest.
pub struct BlobPuller {
    digest: DescriptorDigest,
}

impl BlobPuller {
    pub fn new(digest: DescriptorDigest) -> Self {
        Self { digest }
    }
}

#[async_trait]
impl RegistryEndpoint for BlobPuller {
    type Output = Vec<u8>;

    fn method(&self) -> Method {
        Method::GET
    }

    fn url(&self, context: &RegistryContext) -> Result<Url> {
        context.api_url(&format!("blobs/{}", self.digest))
    }

    async fn handle_response(&mut self, response: Response, _context: &RegistryContext) -> Result<Vec<u8>> {
        let body = response.bytes().await?.to_vec();
        let actual = DescriptorDigest::of_bytes(&body);
        if actual != self.digest {
            return Err(OciError::DigestMismatch {
                expected: self.digest.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(body)
    }

    fn action_description(&self, context: &RegistryContext) -> String {
        format!("pull blob {} from {}", self.digest, context.repository)
    }
}
