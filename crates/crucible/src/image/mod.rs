//! Image provider
//!
//! Resolves a language key to a runnable [`ImageHandle`], building it from the
//! language's recipe on first use. Handles are cached per language together
//! with the recipe fingerprint they were built from, so an edited recipe is
//! rebuilt instead of served stale. Concurrent resolves of an uncached
//! language share a single build.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

pub use crate::image::builder::{DockerImageBuilder, HostImageBuilder};
use crate::config::{Backend, Config, DEFAULT_WORKDIR, Language};

mod builder;

/// Length of the fingerprint prefix used in image tags
const TAG_FINGERPRINT_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("failed to build image for {language}: {reason}")]
    BuildFailure { language: String, reason: String },
}

impl ImageError {
    pub fn build_failure(language: &str, reason: impl Into<String>) -> Self {
        ImageError::BuildFailure {
            language: language.to_owned(),
            reason: reason.into(),
        }
    }
}

/// A built, runnable image for one language
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHandle {
    pub language: String,

    /// What the backend runs: a docker image tag, or `host:<language>`
    pub reference: String,

    /// SHA-256 of the rendered recipe and the language's commands
    pub fingerprint: String,

    /// Directory the workspace is mounted at inside the image
    pub workdir: String,
}

impl ImageHandle {
    /// Handle for languages whose toolchain lives on the host
    pub fn host(language: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        let language = language.into();
        Self {
            reference: format!("host:{language}"),
            language,
            fingerprint: fingerprint.into(),
            workdir: DEFAULT_WORKDIR.to_owned(),
        }
    }

    /// The fingerprint prefix used in image tags, or all of a shorter one
    pub fn short_fingerprint(&self) -> &str {
        self.fingerprint
            .get(..TAG_FINGERPRINT_LEN)
            .unwrap_or(&self.fingerprint)
    }
}

/// Everything a builder needs to produce one image
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub language: String,
    pub fingerprint: String,

    /// Tag the image is built under
    pub tag: String,

    /// Rendered Dockerfile, if the language has a recipe
    pub dockerfile: Option<String>,

    /// Programs the compile and run commands invoke
    pub programs: Vec<String>,
}

/// Turns a [`BuildRequest`] into a runnable image reference
#[async_trait::async_trait]
pub trait ImageBuilder: Send + Sync {
    fn name(&self) -> &str;

    async fn build(&self, request: &BuildRequest) -> Result<String, ImageError>;
}

/// Builder matching an isolation backend
pub fn builder_for(config: &Config) -> Arc<dyn ImageBuilder> {
    match config.backend {
        Backend::Docker => Arc::new(DockerImageBuilder::new(config.docker_binary())),
        Backend::Isolate | Backend::Process => Arc::new(HostImageBuilder),
    }
}

struct CacheSlot {
    fingerprint: String,
    image: OnceCell<Arc<ImageHandle>>,
}

/// Cache of built images, keyed by language
pub struct ImageProvider {
    languages: HashMap<String, Language>,
    recipes_dir: Option<PathBuf>,
    build_timeout: Duration,
    builder: Arc<dyn ImageBuilder>,
    cache: Mutex<HashMap<String, Arc<CacheSlot>>>,
}

impl ImageProvider {
    pub fn new(config: &Config, builder: Arc<dyn ImageBuilder>) -> Self {
        Self {
            languages: config.languages.clone(),
            recipes_dir: config.recipes_dir.clone(),
            build_timeout: config.image_build_timeout(),
            builder,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn supports(&self, key: &str) -> bool {
        self.languages.contains_key(key)
    }

    /// Resolve `key` to a ready image, building it if needed
    #[instrument(skip(self), fields(builder = self.builder.name()))]
    pub async fn resolve(&self, key: &str) -> Result<Arc<ImageHandle>, ImageError> {
        let language = self
            .languages
            .get(key)
            .ok_or_else(|| ImageError::UnsupportedLanguage(key.to_owned()))?;
        let request = self.request(key, language).await?;

        let slot = {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            let current = cache
                .get(key)
                .filter(|slot| slot.fingerprint == request.fingerprint)
                .cloned();
            match current {
                Some(slot) => slot,
                None => {
                    if cache.contains_key(key) {
                        info!(fingerprint = %request.fingerprint, "recipe changed, rebuilding image");
                    }
                    let slot = Arc::new(CacheSlot {
                        fingerprint: request.fingerprint.clone(),
                        image: OnceCell::new(),
                    });
                    cache.insert(key.to_owned(), slot.clone());
                    slot
                }
            }
        };

        if let Some(image) = slot.image.get() {
            debug!(reference = %image.reference, "image cache hit");
            return Ok(image.clone());
        }

        let workdir = language
            .recipe
            .as_ref()
            .map_or(DEFAULT_WORKDIR, |recipe| recipe.workdir.as_str());
        slot.image
            .get_or_try_init(|| self.build(&request, workdir))
            .await
            .cloned()
    }

    async fn build(
        &self,
        request: &BuildRequest,
        workdir: &str,
    ) -> Result<Arc<ImageHandle>, ImageError> {
        info!(tag = %request.tag, fingerprint = %request.fingerprint, "building image");
        let reference = tokio::time::timeout(self.build_timeout, self.builder.build(request))
            .await
            .map_err(|_| {
                ImageError::build_failure(
                    &request.language,
                    format!("build did not finish within {:?}", self.build_timeout),
                )
            })??;

        info!(%reference, "image ready");
        Ok(Arc::new(ImageHandle {
            language: request.language.clone(),
            reference,
            fingerprint: request.fingerprint.clone(),
            workdir: workdir.to_owned(),
        }))
    }

    async fn request(&self, key: &str, language: &Language) -> Result<BuildRequest, ImageError> {
        let dockerfile = match language.recipe {
            Some(ref recipe) => Some(
                recipe
                    .render(self.recipes_dir.as_deref())
                    .await
                    .map_err(|e| ImageError::build_failure(key, format!("reading recipe: {e}")))?,
            ),
            None => None,
        };

        let compile = language.compile_argv();
        let run = language.run_argv();
        let fingerprint = fingerprint(dockerfile.as_deref(), compile.as_deref(), &run);
        let programs = compile
            .iter()
            .chain(std::iter::once(&run))
            .filter_map(|argv| argv.first().cloned())
            .collect();

        Ok(BuildRequest {
            language: key.to_owned(),
            tag: image_tag(key, &fingerprint),
            fingerprint,
            dockerfile,
            programs,
        })
    }

    /// Build images for `keys` ahead of the first submission
    pub async fn prepare<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a str>,
    ) -> Vec<(String, Result<Arc<ImageHandle>, ImageError>)> {
        let mut results = Vec::new();
        for key in keys {
            results.push((key.to_owned(), self.resolve(key).await));
        }
        results
    }

    /// The built image for `key`, if one is cached
    pub fn cached(&self, key: &str) -> Option<Arc<ImageHandle>> {
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.get(key).and_then(|slot| slot.image.get().cloned())
    }
}

/// SHA-256 over the recipe and the commands that run inside the image
pub fn fingerprint(dockerfile: Option<&str>, compile: Option<&[String]>, run: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(dockerfile.unwrap_or_default().as_bytes());
    for (label, argv) in [("compile", compile.unwrap_or_default()), ("run", run)] {
        hasher.update([0]);
        hasher.update(label.as_bytes());
        for arg in argv {
            hasher.update([0x1f]);
            hasher.update(arg.as_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}

/// `crucible/<language>:<fingerprint prefix>`
pub fn image_tag(key: &str, fingerprint: &str) -> String {
    let repository: String = key
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '.' | '_' | '-') => c,
            _ => '-',
        })
        .collect();
    let prefix = fingerprint.get(..TAG_FINGERPRINT_LEN).unwrap_or(fingerprint);
    format!("crucible/{repository}:{prefix}")
}
