use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use layerbake_oci::cache::ApplicationLayerType;
use layerbake_oci::registry::ImageReference;

use crate::{Error, Result};

pub const CACHE_DIR_ENV: &str = "LAYERBAKE_CACHE_DIR";
pub const WORKERS_ENV: &str = "LAYERBAKE_WORKERS";

/// One image build: what to start from, what to add, where to publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSpec {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    pub base_image: String,
    pub target_image: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub sources: SourcesSpec,
    /// Directory inside the image that receives the application layers.
    #[serde(default = "default_app_root")]
    pub app_root: String,
}

/// Source directories feeding each application layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcesSpec {
    #[serde(default)]
    pub dependencies: Vec<PathBuf>,
    #[serde(default)]
    pub resources: Vec<PathBuf>,
    #[serde(default)]
    pub classes: Vec<PathBuf>,
}

impl SourcesSpec {
    pub fn for_layer(&self, layer_type: ApplicationLayerType) -> &[PathBuf] {
        match layer_type {
            ApplicationLayerType::Dependencies => &self.dependencies,
            ApplicationLayerType::Resources => &self.resources,
            ApplicationLayerType::Classes => &self.classes,
        }
    }

    fn all_mut(&mut self) -> impl Iterator<Item = &mut PathBuf> {
        self.dependencies
            .iter_mut()
            .chain(self.resources.iter_mut())
            .chain(self.classes.iter_mut())
    }
}

impl BuildSpec {
    pub fn base_reference(&self) -> Result<ImageReference> {
        Ok(ImageReference::parse(&self.base_image)?)
    }

    pub fn target_reference(&self) -> Result<ImageReference> {
        Ok(ImageReference::parse(&self.target_image)?)
    }

    /// Resolve relative `cache_dir` and source paths against `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        resolve(&mut self.cache_dir);
        self.sources.all_mut().for_each(resolve);
    }

    /// Apply `LAYERBAKE_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(CACHE_DIR_ENV).filter(|v| !v.is_empty()) {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(workers) = lookup(WORKERS_ENV).filter(|v| !v.is_empty()) {
            self.workers = workers.trim().parse().map_err(|e| {
                Error::Config(format!("invalid {}='{}': {}", WORKERS_ENV, workers, e))
            })?;
        }
        Ok(())
    }
}

fn default_api_version() -> String {
    "v1".to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".layerbake/cache")
}

fn default_workers() -> usize {
    4
}

fn default_app_root() -> String {
    "/app".to_string()
}

pub fn load_spec(path: &Path) -> Result<BuildSpec> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;

    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
        .unwrap_or(false);

    let mut spec: BuildSpec = if is_yaml {
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid YAML spec {}: {}", path.display(), e)))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid JSON spec {}: {}", path.display(), e)))?
    };

    if let Some(dir) = path.parent() {
        spec.resolve_paths(dir);
    }
    spec.apply_overrides(|key| std::env::var(key).ok())?;

    validate_spec(&spec)?;
    Ok(spec)
}

pub fn validate_spec(spec: &BuildSpec) -> Result<()> {
    if spec.api_version != "v1" {
        return Err(Error::Config(format!(
            "unsupported api_version '{}', expected 'v1'",
            spec.api_version
        )));
    }

    ImageReference::parse(&spec.base_image)
        .map_err(|e| Error::Config(format!("base_image: {}", e)))?;
    ImageReference::parse(&spec.target_image)
        .map_err(|e| Error::Config(format!("target_image: {}", e)))?;

    if spec.workers == 0 {
        return Err(Error::Config("workers must be at least 1".into()));
    }
    if spec.entrypoint.is_empty() {
        return Err(Error::Config("entrypoint cannot be empty".into()));
    }
    if !spec.app_root.starts_with('/') {
        return Err(Error::Config(format!(
            "app_root '{}' must be an absolute path",
            spec.app_root
        )));
    }

    Ok(())
}
