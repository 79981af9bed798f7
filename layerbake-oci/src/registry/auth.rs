use serde::Deserialize;
use tracing::debug;

use super::RegistryClient;
use crate::{OciError, Result};

/// Credential presented on registry calls.
#[derive(Clone, PartialEq, Eq)]
pub enum Authorization {
    Bearer(String),
}

impl Authorization {
    pub fn bearer(token: impl Into<String>) -> Self {
        Authorization::Bearer(token.into())
    }

    pub fn header_value(&self) -> String {
        match self {
            Authorization::Bearer(token) => format!("Bearer {token}"),
        }
    }
}

impl std::fmt::Debug for Authorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Authorization::Bearer(_) => f.write_str("Bearer(..)"),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Fetches bearer tokens from a registry's auth realm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuthenticator {
    realm: String,
    service: String,
    repository: String,
}

impl RegistryAuthenticator {
    pub fn new(realm: impl Into<String>, service: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            service: service.into(),
            repository: repository.into(),
        }
    }

    /// Parse a `WWW-Authenticate: Bearer realm="…",service="…"` challenge.
    pub fn from_challenge(challenge: &str, repository: &str) -> Result<Self> {
        let fail = |reason: &str| OciError::UnexpectedResponse {
            action: format!("authenticate for {repository}"),
            reason: format!("{reason}: {challenge:?}"),
        };
        let params = challenge
            .trim()
            .strip_prefix("Bearer ")
            .ok_or_else(|| fail("unsupported authentication challenge"))?;
        let realm = extract_param(params, "realm").ok_or_else(|| fail("challenge has no realm"))?;
        let service = extract_param(params, "service").unwrap_or_default();
        Ok(Self::new(realm, service, repository))
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub async fn authenticate_pull(&self, client: &RegistryClient) -> Result<Authorization> {
        self.authenticate(client, "pull").await
    }

    pub async fn authenticate_push(&self, client: &RegistryClient) -> Result<Authorization> {
        self.authenticate(client, "pull,push").await
    }

    /// `GET <realm>?service=<service>&scope=repository:<repo>:<actions>`.
    /// Every failure is wrapped in [`OciError::AuthenticationFailed`].
    async fn authenticate(&self, client: &RegistryClient, actions: &str) -> Result<Authorization> {
        self.fetch_token(client, actions)
            .await
            .map(Authorization::Bearer)
            .map_err(|e| OciError::AuthenticationFailed {
                realm: self.realm.clone(),
                source: Box::new(e),
            })
    }

    async fn fetch_token(&self, client: &RegistryClient, actions: &str) -> Result<String> {
        let scope = format!("repository:{}:{}", self.repository, actions);
        debug!(realm = %self.realm, service = %self.service, %scope, "fetching bearer token");

        let response = client
            .http()
            .get(&self.realm)
            .query(&[("service", self.service.as_str()), ("scope", scope.as_str())])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(OciError::HttpStatus {
                action: format!("fetch token from {}", self.realm),
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let body: TokenResponse = serde_json::from_slice(&response.bytes().await?)?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| OciError::UnexpectedResponse {
                action: format!("fetch token from {}", self.realm),
                reason: "response has no token".to_string(),
            })
    }
}

/// Value of `param="…"` in a challenge's parameter list. Commas inside
/// quoted values do not separate parameters.
fn extract_param(params: &str, param: &str) -> Option<String> {
    split_params(params).into_iter().find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key.trim() == param).then(|| value.trim().trim_matches('"').to_string())
    })
}

fn split_params(params: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    for (i, c) in params.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                parts.push(&params[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&params[start..]);
    parts
}
