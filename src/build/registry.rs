use std::future::Future;
use std::sync::Arc;

use layerbake_oci::registry::{ImageReference, RegistryClient};
use tracing::{debug, info, warn};

use crate::Result;

/// Access requested from a registry's token service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scope {
    Pull,
    Push,
}

/// Client for `reference`. When `GET /v2/` answers with a bearer challenge
/// the client carries a token for `scope`; otherwise it stays anonymous.
pub(crate) async fn authenticated_client(reference: &ImageReference, scope: Scope) -> Result<RegistryClient> {
    let client = RegistryClient::for_image(reference)?;
    let Some(authenticator) = client.discover_authenticator().await? else {
        debug!(registry = %reference.registry, "registry allows anonymous access");
        return Ok(client);
    };

    let authorization = match scope {
        Scope::Pull => authenticator.authenticate_pull(&client).await?,
        Scope::Push => authenticator.authenticate_push(&client).await?,
    };
    info!(
        registry = %reference.registry,
        repository = %reference.repository,
        realm = authenticator.realm(),
        ?scope,
        "authenticated"
    );
    Ok(client.with_authorization(Some(authorization)))
}

/// Run a push against `client`. A 401/403 triggers one re-authentication
/// with push scope and one more attempt.
pub(crate) async fn push_with_reauth<T, F, Fut>(
    client: Arc<RegistryClient>,
    target: &ImageReference,
    op: F,
) -> Result<T>
where
    F: Fn(Arc<RegistryClient>) -> Fut,
    Fut: Future<Output = layerbake_oci::Result<T>>,
{
    match op(client).await {
        Err(e) if e.is_unauthorized() => {
            warn!(image = %target, error = %e, "push rejected, re-authenticating");
            let fresh = authenticated_client(target, Scope::Push).await?;
            Ok(op(Arc::new(fresh)).await?)
        }
        outcome => Ok(outcome?),
    }
}
