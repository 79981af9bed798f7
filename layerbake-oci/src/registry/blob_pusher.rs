use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_TYPE, LOCATION};
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};

use super::endpoint::{RegistryContext, RegistryEndpoint};
use crate::blob::Blob;
use crate::digest::DescriptorDigest;
use crate::{OciError, Result};

/// Pushes one blob in three exchanges:
///
/// 1. `POST /v2/<name>/blobs/uploads/?mount=<digest>`: 201 means the blob
///    already exists, 202 returns the upload `Location`.
/// 2. `PATCH <location>` with the content.
/// 3. `PUT <location>?digest=<digest>` to commit.
pub struct BlobPusher {
    digest: DescriptorDigest,
    blob: Option<Blob>,
}

impl BlobPusher {
    pub fn new(digest: DescriptorDigest, blob: Blob) -> Self {
        Self {
            digest,
            blob: Some(blob),
        }
    }

    pub fn initializer(&self) -> BlobInitializer {
        BlobInitializer {
            digest: self.digest.clone(),
        }
    }

    /// The content can only be sent once.
    pub fn writer(&mut self, location: Url) -> Result<BlobWriter> {
        let blob = self.blob.take().ok_or_else(|| OciError::UnexpectedResponse {
            action: format!("push blob {}", self.digest),
            reason: "blob content already sent".to_string(),
        })?;
        Ok(BlobWriter {
            digest: self.digest.clone(),
            location,
            blob: Some(blob),
        })
    }

    pub fn committer(&self, location: Url) -> BlobCommitter {
        BlobCommitter {
            digest: self.digest.clone(),
            location,
        }
    }
}

/// The single `Location` header of a response.  Fails on zero or several.
pub fn extract_location(headers: &HeaderMap) -> std::result::Result<String, String> {
    let values: Vec<_> = headers.get_all(LOCATION).iter().collect();
    match values.as_slice() {
        [value] => value
            .to_str()
            .map(str::to_string)
            .map_err(|_| "Location header is not valid UTF-8".to_string()),
        other => Err(format!(
            "expected exactly one Location header, got {}",
            other.len()
        )),
    }
}

fn location_url(response: &Response, context: &RegistryContext, action: String) -> Result<Url> {
    let location = extract_location(response.headers())
        .map_err(|reason| OciError::UnexpectedResponse { action, reason })?;
    context.url(&location)
}

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

pub struct BlobInitializer {
    digest: DescriptorDigest,
}

#[async_trait]
impl RegistryEndpoint for BlobInitializer {
    /// `None` when the blob already exists.
    type Output = Option<Url>;

    fn method(&self) -> Method {
        Method::POST
    }

    fn url(&self, context: &RegistryContext) -> Result<Url> {
        context.api_url(&format!("blobs/uploads/?mount={}", self.digest))
    }

    async fn handle_response(&mut self, response: Response, context: &RegistryContext) -> Result<Option<Url>> {
        match response.status() {
            StatusCode::CREATED => Ok(None),
            StatusCode::ACCEPTED => {
                location_url(&response, context, self.action_description(context)).map(Some)
            }
            status => Err(OciError::UnexpectedResponse {
                action: self.action_description(context),
                reason: format!("unexpected status {status}"),
            }),
        }
    }

    fn action_description(&self, context: &RegistryContext) -> String {
        format!("initiate blob upload of {} to {}", self.digest, context.repository)
    }
}

pub struct BlobWriter {
    digest: DescriptorDigest,
    location: Url,
    blob: Option<Blob>,
}

#[async_trait]
impl RegistryEndpoint for BlobWriter {
    /// Location to commit to.
    type Output = Url;

    fn method(&self) -> Method {
        Method::PATCH
    }

    fn url(&self, _context: &RegistryContext) -> Result<Url> {
        Ok(self.location.clone())
    }

    fn build_request(&mut self, request: RequestBuilder) -> Result<RequestBuilder> {
        let body = match self.blob.take() {
            Some(blob) => blob.into_bytes()?,
            None => Vec::new(),
        };
        Ok(request
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body))
    }

    async fn handle_response(&mut self, response: Response, context: &RegistryContext) -> Result<Url> {
        location_url(&response, context, self.action_description(context))
    }

    fn action_description(&self, context: &RegistryContext) -> String {
        format!("upload blob {} to {}", self.digest, context.repository)
    }
}

pub struct BlobCommitter {
    digest: DescriptorDigest,
    location: Url,
}

#[async_trait]
impl RegistryEndpoint for BlobCommitter {
    type Output = ();

    fn method(&self) -> Method {
        Method::PUT
    }

    fn url(&self, _context: &RegistryContext) -> Result<Url> {
        let mut url = self.location.clone();
        url.query_pairs_mut()
            .append_pair("digest", &self.digest.to_string());
        Ok(url)
    }

    async fn handle_response(&mut self, _response: Response, _context: &RegistryContext) -> Result<()> {
        Ok(())
    }

    fn action_description(&self, context: &RegistryContext) -> String {
        format!("commit blob {} to {}", self.digest, context.repository)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::client_for;
    use httpmock::prelude::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn location_must_be_unique() {
        let mut headers = HeaderMap::new();
        assert!(extract_location(&headers).is_err());

        headers.insert(LOCATION, HeaderValue::from_static("/v2/a/blobs/uploads/1"));
        assert_eq!(extract_location(&headers).unwrap(), "/v2/a/blobs/uploads/1");

        headers.append(LOCATION, HeaderValue::from_static("/v2/a/blobs/uploads/2"));
        assert_eq!(
            extract_location(&headers).unwrap_err(),
            "expected exactly one Location header, got 2"
        );
    }

    #[tokio::test]
    async fn initiate_created_means_nothing_to_do() {
        let digest = DescriptorDigest::of_bytes(b"blob");
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v2/test/app/blobs/uploads/")
                    .query_param("mount", digest.to_string());
                then.status(201);
            })
            .await;

        let pusher = BlobPusher::new(digest.clone(), Blob::from_bytes(b"blob".to_vec()));
        let location = client_for(&server).call(pusher.initializer()).await.unwrap();
        assert!(location.is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn initiate_accepted_returns_location() {
        let digest = DescriptorDigest::of_bytes(b"blob");
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v2/test/app/blobs/uploads/");
                then.status(202).header("Location", "/v2/test/app/blobs/uploads/session-1");
            })
            .await;

        let pusher = BlobPusher::new(digest, Blob::from_bytes(b"blob".to_vec()));
        let location = client_for(&server)
            .call(pusher.initializer())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(location.as_str(), server.url("/v2/test/app/blobs/uploads/session-1"));
    }

    #[tokio::test]
    async fn initiate_accepted_without_location_fails() {
        let digest = DescriptorDigest::of_bytes(b"blob");
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v2/test/app/blobs/uploads/");
                then.status(202);
            })
            .await;

        let pusher = BlobPusher::new(digest, Blob::from_bytes(b"blob".to_vec()));
        let err = client_for(&server).call(pusher.initializer()).await.unwrap_err();
        assert!(matches!(err, OciError::UnexpectedResponse { .. }));
    }

    #[tokio::test]
    async fn full_push_runs_all_phases() {
        let content = b"some layer content".to_vec();
        let digest = DescriptorDigest::of_bytes(&content);
        let server = MockServer::start_async().await;
        let initiate = server
            .mock_async(|when, then| {
                when.method(POST).path("/v2/test/app/blobs/uploads/");
                then.status(202).header("Location", "/upload/abc?_state=s1");
            })
            .await;
        let patch = server
            .mock_async(|when, then| {
                when.method(PATCH)
                    .path("/upload/abc")
                    .query_param("_state", "s1")
                    .header("content-type", "application/octet-stream")
                    .body("some layer content");
                then.status(202).header("Location", "/upload/abc?_state=s2");
            })
            .await;
        let commit = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/upload/abc")
                    .query_param("_state", "s2")
                    .query_param("digest", digest.to_string());
                then.status(201);
            })
            .await;

        let existed = client_for(&server)
            .push_blob(&digest, Blob::from_bytes(content))
            .await
            .unwrap();
        assert!(!existed);
        initiate.assert_async().await;
        patch.assert_async().await;
        commit.assert_async().await;
    }

    #[tokio::test]
    async fn existing_blob_skips_upload() {
        let digest = DescriptorDigest::of_bytes(b"blob");
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v2/test/app/blobs/uploads/");
                then.status(201);
            })
            .await;
        let patch = server
            .mock_async(|when, then| {
                when.method(PATCH);
                then.status(202);
            })
            .await;

        let existed = client_for(&server)
            .push_blob(&digest, Blob::from_bytes(b"blob".to_vec()))
            .await
            .unwrap();
        assert!(existed);
        patch.assert_hits_async(0).await;
    }

    #[test]
    fn content_is_sent_once() {
        let digest = DescriptorDigest::of_bytes(b"blob");
        let mut pusher = BlobPusher::new(digest, Blob::from_bytes(b"blob".to_vec()));
        let url = Url::parse("http://localhost/upload").unwrap();
        assert!(pusher.writer(url.clone()).is_ok());
        assert!(pusher.writer(url).is_err());
    }
}
