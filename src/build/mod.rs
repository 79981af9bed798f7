//! Image build driver
//!
//! [`ImageBuild`] turns a [`BuildSpec`] into a graph of [`AsyncStep`]s on one
//! [`StepPool`]:
//!
//! ```text
//! authenticate-pull ─► pull-base-manifest ─► pull-base-configuration ─► cache-base-layers ─► push-base-layers ─┐
//! build-{dependencies,resources,classes} ─────────────────────────────────────────────────► push-*-layer ─────┤
//! authenticate-push ─► push-container-configuration ─────────────────────────────────────► push-manifest ─────┤
//! flush-cache ─────────────────────────────────────────────────────────────────────────────────────────────────┴─► finish
//! ```
//!
//! Nothing runs until [`ImageBuild::run`] forces `finish`. Layer builds and
//! pushes with no edge between them run concurrently.

mod layers;
mod registry;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::try_join_all;
use layerbake_oci::cache::{ApplicationLayerType, Cache};
use layerbake_oci::image::{Image, ImageLayers};
use layerbake_oci::layer::{CachedLayer, ReferenceLayer};
use layerbake_oci::manifest::{ContainerConfigurationTemplate, ManifestTemplate, V22ManifestTemplate};
use layerbake_oci::registry::{ImageReference, RegistryClient};
use layerbake_oci::translator::{ImageToJsonTranslator, JsonBlob};
use layerbake_oci::{DescriptorDigest, OciError};
use serde::Serialize;
use tracing::{debug, info, info_span};
use uuid::Uuid;

use crate::spec::{validate_spec, BuildSpec};
use crate::step::{AsyncStep, StepPool};
use crate::{Error, Result};

use layers::{ApplicationLayer, BaseLayers};
use registry::{authenticated_client, push_with_reauth, Scope};

/// Outcome of a successful build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub build_id: String,
    pub image: String,
    pub manifest_digest: DescriptorDigest,
    pub layers: usize,
    pub base_layers_pulled: bool,
    pub rebuilt_layers: Vec<String>,
    pub blobs_pushed: usize,
    pub blobs_existing: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct PushCount {
    pushed: usize,
    existing: usize,
}

impl PushCount {
    fn from_results(existed: &[bool]) -> Self {
        let existing = existed.iter().filter(|e| **e).count();
        Self {
            pushed: existed.len() - existing,
            existing,
        }
    }

    fn add(self, other: PushCount) -> Self {
        Self {
            pushed: self.pushed + other.pushed,
            existing: self.existing + other.existing,
        }
    }
}

/// Container configuration already pushed, manifest ready to publish.
struct PreparedImage {
    manifest: JsonBlob,
    layers: usize,
    configuration: PushCount,
}

/// One configured build: a cache directory, a worker pool and the two image
/// references.
pub struct ImageBuild {
    spec: BuildSpec,
    base: ImageReference,
    target: ImageReference,
    cache: Arc<Cache>,
    pool: StepPool,
}

impl ImageBuild {
    /// Validate `spec`, open (creating if needed) its cache directory and
    /// start the worker pool. Must be called outside an async context.
    pub fn new(spec: BuildSpec) -> Result<Self> {
        validate_spec(&spec)?;
        let base = spec.base_reference()?;
        let target = spec.target_reference()?;
        std::fs::create_dir_all(&spec.cache_dir)?;
        let cache = Arc::new(Cache::init(spec.cache_dir.clone())?);
        let pool = StepPool::new(spec.workers)?;
        Ok(Self {
            spec,
            base,
            target,
            cache,
            pool,
        })
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Build and publish the image, blocking until every step has finished.
    pub fn run(&self) -> Result<BuildReport> {
        let build_id = Uuid::now_v7();
        let span = info_span!("build", %build_id, image = %self.target);
        let _enter = span.enter();
        info!(base = %self.base, workers = self.pool.workers(), "starting build");

        let finish = self.plan(build_id)?;
        finish.run()?;
        let report = finish.result()?;

        info!(
            digest = %report.manifest_digest,
            layers = report.layers,
            pushed = report.blobs_pushed,
            elapsed = %humantime::format_duration(Duration::from_millis(report.elapsed_ms)),
            "build complete"
        );
        Ok(BuildReport::clone(&report))
    }

    fn plan(&self, build_id: Uuid) -> Result<AsyncStep<BuildReport>> {
        let pool = &self.pool;
        let started = Instant::now();

        let base = self.base.clone();
        let pull_client = pool.step("authenticate-pull", move || async move {
            authenticated_client(&base, Scope::Pull).await
        });

        let base_manifest = {
            let (client, base) = (pull_client.clone(), self.base.clone());
            pool.step("pull-base-manifest", move || pull_base_manifest(client, base))
        };
        base_manifest.depends_on(&[&pull_client])?;

        let base_layers = {
            let (client, manifest) = (pull_client.clone(), base_manifest.clone());
            pool.step("pull-base-configuration", move || {
                pull_base_configuration(client, manifest)
            })
        };
        base_layers.depends_on(&[&base_manifest])?;

        let cached_base = {
            let cache = Arc::clone(&self.cache);
            let (client, reference_layers) = (pull_client.clone(), base_layers.clone());
            pool.step("cache-base-layers", move || async move {
                layers::cache_base_layers(cache, client.result()?, reference_layers.result()?).await
            })
        };
        cached_base.depends_on(&[&pull_client, &base_layers])?;

        let application_layers: Vec<AsyncStep<ApplicationLayer>> = ApplicationLayerType::ALL
            .into_iter()
            .map(|layer_type| {
                let cache = Arc::clone(&self.cache);
                let sources = self.spec.sources.for_layer(layer_type).to_vec();
                let root = layers::archive_root(&self.spec.app_root, layer_type);
                pool.step(format!("build-{layer_type}"), move || {
                    layers::application_layer(cache, layer_type, sources, root)
                })
            })
            .collect();

        let target = self.target.clone();
        let push_client = pool.step("authenticate-push", move || async move {
            authenticated_client(&target, Scope::Push).await
        });

        let push_base = {
            let (client, target, base) = (push_client.clone(), self.target.clone(), cached_base.clone());
            pool.step("push-base-layers", move || push_base_layers(client, target, base))
        };
        push_base.depends_on(&[&push_client, &cached_base])?;

        let mut push_application = Vec::with_capacity(application_layers.len());
        for (layer_type, layer) in ApplicationLayerType::ALL.into_iter().zip(&application_layers) {
            let (client, target, layer_step) = (push_client.clone(), self.target.clone(), layer.clone());
            let step = pool.step(format!("push-{layer_type}-layer"), move || {
                push_application_layer(client, target, layer_step)
            });
            step.depends_on(&[&push_client, layer])?;
            push_application.push(step);
        }

        let prepared = {
            let (client, target, base) = (push_client.clone(), self.target.clone(), cached_base.clone());
            let apps = application_layers.clone();
            let environment = self.spec.environment.clone();
            let entrypoint = self.spec.entrypoint.clone();
            pool.step("push-container-configuration", move || {
                push_container_configuration(client, target, base, apps, environment, entrypoint)
            })
        };
        prepared.depends_on(&[&push_client, &cached_base])?;
        for layer in &application_layers {
            prepared.depends_on(&[layer])?;
        }

        let manifest = {
            let (client, target, prepared) = (push_client.clone(), self.target.clone(), prepared.clone());
            pool.step("push-manifest", move || push_manifest(client, target, prepared))
        };
        manifest.depends_on(&[&prepared, &push_base])?;
        for push in &push_application {
            manifest.depends_on(&[push])?;
        }

        let flush = {
            let cache = Arc::clone(&self.cache);
            pool.step("flush-cache", move || {
                layers::blocking(move || {
                    cache.flush()?;
                    debug!(dir = %cache.directory().display(), "flushed cache metadata");
                    Ok(())
                })
            })
        };
        flush.depends_on(&[&cached_base])?;
        for layer in &application_layers {
            flush.depends_on(&[layer])?;
        }

        let inputs = ReportInputs {
            build_id,
            image: self.target.to_string(),
            started,
            cached_base,
            application_layers,
            push_base,
            push_application,
            prepared,
            manifest: manifest.clone(),
        };
        let finish = pool.step("finish", move || finish_report(inputs));
        finish.depends_on(&[&manifest, &flush])?;
        Ok(finish)
    }
}

async fn pull_base_manifest(
    client: AsyncStep<RegistryClient>,
    base: ImageReference,
) -> Result<V22ManifestTemplate> {
    match client.result()?.pull_manifest(&base.tag).await? {
        ManifestTemplate::V22(manifest) => {
            info!(image = %base, layers = manifest.layers.len(), "pulled base manifest");
            Ok(manifest)
        }
        ManifestTemplate::V21(_) => Err(Error::Oci(OciError::UnknownManifestFormat(format!(
            "{base} has a schema 1 manifest; base images must use schema 2"
        )))),
    }
}

/// Pair each manifest layer with its diff ID from the container
/// configuration.
async fn pull_base_configuration(
    client: AsyncStep<RegistryClient>,
    manifest: AsyncStep<V22ManifestTemplate>,
) -> Result<ImageLayers> {
    let manifest = manifest.result()?;
    let bytes = client.result()?.pull_blob(&manifest.config.digest).await?;
    let configuration: ContainerConfigurationTemplate =
        serde_json::from_slice(&bytes).map_err(OciError::from)?;

    let diff_ids = &configuration.rootfs.diff_ids;
    if diff_ids.len() != manifest.layers.len() {
        return Err(Error::Oci(OciError::UnexpectedResponse {
            action: "read base container configuration".to_string(),
            reason: format!(
                "manifest lists {} layers but configuration lists {} diff ids",
                manifest.layers.len(),
                diff_ids.len()
            ),
        }));
    }

    let mut layers = ImageLayers::new();
    for (layer, diff_id) in manifest.layers.iter().zip(diff_ids) {
        layers.add(ReferenceLayer::new(layer.blob_descriptor(), diff_id.clone()).into())?;
    }
    Ok(layers)
}

async fn push_layer(client: Arc<RegistryClient>, target: &ImageReference, layer: &CachedLayer) -> Result<bool> {
    push_with_reauth(client, target, |client| {
        let layer = layer.clone();
        async move { client.push_blob(&layer.descriptor.digest, layer.content_blob()).await }
    })
    .await
}

async fn push_base_layers(
    client: AsyncStep<RegistryClient>,
    target: ImageReference,
    base: AsyncStep<BaseLayers>,
) -> Result<PushCount> {
    let client = client.result()?;
    let base = base.result()?;
    let pushes = base
        .layers
        .iter()
        .map(|layer| push_layer(Arc::clone(&client), &target, layer));
    Ok(PushCount::from_results(&try_join_all(pushes).await?))
}

async fn push_application_layer(
    client: AsyncStep<RegistryClient>,
    target: ImageReference,
    layer: AsyncStep<ApplicationLayer>,
) -> Result<PushCount> {
    let layer = layer.result()?;
    let existed = push_layer(client.result()?, &target, &layer.layer).await?;
    Ok(PushCount::from_results(&[existed]))
}

/// Assemble the image model, translate it and push its configuration blob.
async fn push_container_configuration(
    client: AsyncStep<RegistryClient>,
    target: ImageReference,
    base: AsyncStep<BaseLayers>,
    application_layers: Vec<AsyncStep<ApplicationLayer>>,
    environment: BTreeMap<String, String>,
    entrypoint: Vec<String>,
) -> Result<PreparedImage> {
    let base = base.result()?;
    let mut image = Image::new();
    let mut candidates: Vec<CachedLayer> = base.layers.clone();
    for step in &application_layers {
        candidates.push(step.result()?.layer.clone());
    }
    for layer in candidates {
        match image.add_layer(layer) {
            Ok(()) => {}
            Err(OciError::DuplicateLayer(digest)) => {
                debug!(%digest, "identical layer already in image");
            }
            Err(e) => return Err(e.into()),
        }
    }
    for (name, value) in environment {
        image.set_environment_variable(name, value);
    }
    image.set_entrypoint(entrypoint);

    let mut translator = ImageToJsonTranslator::new(&image);
    let configuration = translator.container_configuration()?.clone();
    let manifest = translator.manifest()?.clone();

    let digest = configuration.descriptor.digest.clone();
    let existed = push_with_reauth(client.result()?, &target, |client| {
        let (digest, blob) = (digest.clone(), configuration.to_blob());
        async move { client.push_blob(&digest, blob).await }
    })
    .await?;
    info!(%digest, "pushed container configuration");

    Ok(PreparedImage {
        manifest,
        layers: image.layers().len(),
        configuration: PushCount::from_results(&[existed]),
    })
}

async fn push_manifest(
    client: AsyncStep<RegistryClient>,
    target: ImageReference,
    prepared: AsyncStep<PreparedImage>,
) -> Result<DescriptorDigest> {
    let prepared = prepared.result()?;
    push_with_reauth(client.result()?, &target, |client| {
        let (bytes, tag) = (prepared.manifest.bytes.clone(), target.tag.clone());
        async move { client.push_manifest_bytes(bytes, &tag).await }
    })
    .await?;
    Ok(prepared.manifest.descriptor.digest.clone())
}

/// Handles the `finish` step reads once everything upstream completed.
struct ReportInputs {
    build_id: Uuid,
    image: String,
    started: Instant,
    cached_base: AsyncStep<BaseLayers>,
    application_layers: Vec<AsyncStep<ApplicationLayer>>,
    push_base: AsyncStep<PushCount>,
    push_application: Vec<AsyncStep<PushCount>>,
    prepared: AsyncStep<PreparedImage>,
    manifest: AsyncStep<DescriptorDigest>,
}

async fn finish_report(inputs: ReportInputs) -> Result<BuildReport> {
    let prepared = inputs.prepared.result()?;
    let mut pushes = *inputs.push_base.result()?;
    for step in &inputs.push_application {
        pushes = pushes.add(*step.result()?);
    }
    pushes = pushes.add(prepared.configuration);

    let mut rebuilt_layers = Vec::new();
    for step in &inputs.application_layers {
        let layer = step.result()?;
        if layer.rebuilt {
            rebuilt_layers.push(layer.layer_type.to_string());
        }
    }

    Ok(BuildReport {
        build_id: inputs.build_id.to_string(),
        image: inputs.image,
        manifest_digest: (*inputs.manifest.result()?).clone(),
        layers: prepared.layers,
        base_layers_pulled: inputs.cached_base.result()?.pulled,
        rebuilt_layers,
        blobs_pushed: pushes.pushed,
        blobs_existing: pushes.existing,
        elapsed_ms: inputs.started.elapsed().as_millis() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_counts_split_existing_blobs() {
        let count = PushCount::from_results(&[true, false, false]);
        assert_eq!((count.pushed, count.existing), (2, 1));
        let total = count.add(PushCount::from_results(&[true]));
        assert_eq!((total.pushed, total.existing), (2, 2));
    }
}
