use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::backend::{ExecutionPath, LoadedModel, ModelLoader};

/// Ordered set of model loaders.
///
/// Selection prefers accelerated loaders when asked to, and falls back to CPU loaders
/// when acceleration is unavailable or fails. Lack of acceleration alone is never fatal.
#[derive(Clone, Default)]
pub struct LoaderRegistry {
    loaders: Vec<Arc<dyn ModelLoader>>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the loaders compiled into this build.
    pub fn with_default_loaders() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "backend-tract")]
        registry.register(super::backends::TractLoader);
        registry
    }

    /// Register a loader. Registration order is the tie-break within an execution path.
    pub fn register<L: ModelLoader + 'static>(&mut self, loader: L) {
        self.loaders.push(Arc::new(loader));
    }

    /// List registered loaders.
    pub fn list(&self) -> Vec<&'static str> {
        self.loaders.iter().map(|l| l.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }

    /// Loaders in the order they should be attempted.
    fn candidates(&self, prefer_accelerated: bool) -> Vec<Arc<dyn ModelLoader>> {
        let mut accelerated = Vec::new();
        let mut cpu = Vec::new();
        for loader in &self.loaders {
            match loader.execution() {
                ExecutionPath::Accelerated => accelerated.push(loader.clone()),
                ExecutionPath::Cpu => cpu.push(loader.clone()),
            }
        }
        if prefer_accelerated {
            accelerated.extend(cpu);
            accelerated
        } else {
            cpu
        }
    }

    /// Load `model_path` with the first loader that succeeds.
    ///
    /// Accelerated failures are logged and skipped. The last error is returned only when
    /// every candidate fails.
    pub fn load(&self, model_path: &Path, prefer_accelerated: bool) -> Result<LoadedModel> {
        let candidates = self.candidates(prefer_accelerated);
        if candidates.is_empty() {
            return Err(anyhow!(
                "no model loader available for {} (enable the backend-tract feature)",
                model_path.display()
            ));
        }

        let mut last_error = None;
        for loader in candidates {
            if !loader.is_available() {
                log::info!(
                    "LoaderRegistry: {} ({:?}) unavailable on this machine",
                    loader.name(),
                    loader.execution()
                );
                continue;
            }
            match loader.load(model_path) {
                Ok(model) => {
                    log::info!(
                        "LoaderRegistry: loaded {} with {} ({:?})",
                        model_path.display(),
                        loader.name(),
                        model.execution
                    );
                    return Ok(model);
                }
                Err(err) => {
                    match loader.execution() {
                        ExecutionPath::Cpu => {
                            log::error!("LoaderRegistry: {} failed: {:#}", loader.name(), err)
                        }
                        ExecutionPath::Accelerated => log::warn!(
                            "LoaderRegistry: accelerated loader {} failed, falling back: {:#}",
                            loader.name(),
                            err
                        ),
                    }
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            anyhow!(
                "no usable model loader for {} (accelerated unavailable and no CPU loader registered)",
                model_path.display()
            )
        }))
    }
}
