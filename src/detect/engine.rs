//! Single-flight inference engine.
//!
//! Owns the loaded model and turns frames into detections: preprocess, forward pass,
//! decode, non-maximum suppression. At most one pass executes at a time; a caller that
//! arrives while a pass is running is told "skipped" (`None`) immediately and is never
//! queued.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use super::backend::{ExecutionPath, InferenceBackend};
use super::decode::decode_candidates;
use super::labels::{default_labels_path, load_labels};
use super::nms::{non_max_suppression, DEFAULT_IOU_THRESHOLD};
use super::preprocess::Preprocessor;
use super::registry::LoaderRegistry;
use super::result::Detection;
use crate::frame::Frame;
use crate::Lifecycle;

/// Upper bound on how long `dispose` waits for an in-flight pass.
pub const DEFAULT_DISPOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// What `load` discovered about the model.
#[derive(Clone, Debug)]
pub struct ModelInfo {
    pub model_path: PathBuf,
    pub backend: &'static str,
    pub execution: ExecutionPath,
    pub input_width: u32,
    pub input_height: u32,
    pub class_count: usize,
    pub labels: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct EngineOptions {
    pub iou_threshold: f32,
    pub max_detections: usize,
    pub dispose_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            max_detections: 300,
            dispose_timeout: DEFAULT_DISPOSE_TIMEOUT,
        }
    }
}

/// Counters since the engine was created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub runs: u64,
    pub skipped: u64,
    pub failed: u64,
}

struct ActiveModel {
    backend: Box<dyn InferenceBackend>,
    preprocessor: Preprocessor,
    info: ModelInfo,
}

struct FlightState {
    lifecycle: Lifecycle,
    in_flight: bool,
}

pub struct InferenceEngine {
    registry: LoaderRegistry,
    options: EngineOptions,
    flight: Mutex<FlightState>,
    idle: Condvar,
    model: Mutex<Option<ActiveModel>>,
    runs: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

/// Clears the in-flight flag when the pass ends, however it ends.
struct FlightGuard<'a> {
    engine: &'a InferenceEngine,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let disposed = {
            let mut flight = self.engine.lock_flight();
            flight.in_flight = false;
            flight.lifecycle == Lifecycle::Disposed
        };
        self.engine.idle.notify_all();
        if disposed {
            // dispose() gave up waiting; release the model now that the pass is over.
            if let Ok(mut model) = self.engine.model.try_lock() {
                model.take();
            }
        }
    }
}

impl InferenceEngine {
    pub fn new(registry: LoaderRegistry) -> Self {
        Self::with_options(registry, EngineOptions::default())
    }

    pub fn with_options(registry: LoaderRegistry, options: EngineOptions) -> Self {
        Self {
            registry,
            options,
            flight: Mutex::new(FlightState {
                lifecycle: Lifecycle::Uninitialized,
                in_flight: false,
            }),
            idle: Condvar::new(),
            model: Mutex::new(None),
            runs: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Load a model, with labels from the model path's `.txt` sibling.
    pub fn load(&self, model_path: &Path, prefer_accelerated: bool) -> Result<ModelInfo> {
        self.load_with_labels(model_path, None, prefer_accelerated)
    }

    /// Load a model and its label list.
    ///
    /// Discovers the input size and class count from the model. Accelerated execution is
    /// attempted when preferred and silently replaced by CPU execution when unavailable.
    /// Any other failure is fatal and leaves the previous model (if any) in place.
    pub fn load_with_labels(
        &self,
        model_path: &Path,
        labels_path: Option<&Path>,
        prefer_accelerated: bool,
    ) -> Result<ModelInfo> {
        if self.lifecycle() == Lifecycle::Disposed {
            return Err(anyhow!("inference engine has been disposed"));
        }
        if !model_path.exists() {
            return Err(anyhow!("model file {} does not exist", model_path.display()));
        }

        let started = Instant::now();
        let loaded = self.registry.load(model_path, prefer_accelerated)?;
        let mut backend = loaded.backend;

        let (input_width, input_height) = backend.input_size();
        if input_width == 0 || input_height == 0 {
            return Err(anyhow!(
                "model {} reports an empty input size {}x{}",
                model_path.display(),
                input_width,
                input_height
            ));
        }
        let class_count = backend.output_layout().class_count();
        let labels_path = labels_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_labels_path(model_path));
        let labels = load_labels(&labels_path, class_count)?;

        backend.warm_up()?;

        let info = ModelInfo {
            model_path: model_path.to_path_buf(),
            backend: backend.name(),
            execution: loaded.execution,
            input_width,
            input_height,
            class_count,
            labels,
        };
        log::info!(
            "InferenceEngine: loaded {} ({}x{}, {} classes, {} on {:?}) in {} ms",
            model_path.display(),
            input_width,
            input_height,
            class_count,
            info.backend,
            info.execution,
            started.elapsed().as_millis()
        );

        let replacement = ActiveModel {
            backend,
            preprocessor: Preprocessor::new(input_width, input_height),
            info: info.clone(),
        };
        *self.lock_model() = Some(replacement);

        let mut flight = self.lock_flight();
        if flight.lifecycle == Lifecycle::Disposed {
            drop(flight);
            self.lock_model().take();
            return Err(anyhow!("inference engine was disposed while loading"));
        }
        flight.lifecycle = Lifecycle::Running;
        Ok(info)
    }

    /// Run one inference pass.
    ///
    /// - `None`: skipped. Another pass is in flight, or no model is loaded. Try next frame.
    /// - `Some(vec![])`: the pass ran and found nothing (or failed; failures are logged).
    pub fn detect(&self, frame: &Frame, confidence_threshold: f32) -> Option<Vec<Detection>> {
        let _guard = self.try_begin()?;

        let mut model = self.lock_model();
        let Some(loaded) = model.as_mut() else {
            return None;
        };

        let started = Instant::now();
        let result = self.run_pass(loaded, frame, confidence_threshold);
        self.runs.fetch_add(1, Ordering::Relaxed);
        match result {
            Ok(detections) => {
                log::debug!(
                    "InferenceEngine: frame {} -> {} detections in {} ms",
                    frame.sequence(),
                    detections.len(),
                    started.elapsed().as_millis()
                );
                Some(detections)
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "InferenceEngine: inference failed on frame {}: {:#}",
                    frame.sequence(),
                    err
                );
                Some(Vec::new())
            }
        }
    }

    /// Stop accepting work, wait (bounded) for an in-flight pass, then release the model.
    pub fn dispose(&self) {
        let mut flight = self.lock_flight();
        if flight.lifecycle == Lifecycle::Disposed {
            return;
        }
        flight.lifecycle = Lifecycle::Disposed;
        let (flight, timeout) = self
            .idle
            .wait_timeout_while(flight, self.options.dispose_timeout, |f| f.in_flight)
            .unwrap_or_else(|e| e.into_inner());
        let still_running = flight.in_flight;
        drop(flight);

        if timeout.timed_out() && still_running {
            log::warn!(
                "InferenceEngine: inference still running after {:?}; model released when it completes",
                self.options.dispose_timeout
            );
            if let Ok(mut model) = self.model.try_lock() {
                model.take();
            }
            return;
        }
        self.lock_model().take();
        log::info!("InferenceEngine: disposed");
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lock_flight().lifecycle
    }

    pub fn is_busy(&self) -> bool {
        self.lock_flight().in_flight
    }

    pub fn model_info(&self) -> Option<ModelInfo> {
        self.lock_model().as_ref().map(|m| m.info.clone())
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            runs: self.runs.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn try_begin(&self) -> Option<FlightGuard<'_>> {
        let mut flight = self.lock_flight();
        if flight.lifecycle != Lifecycle::Running {
            log::debug!("InferenceEngine: detect called while {:?}", flight.lifecycle);
            return None;
        }
        if flight.in_flight {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        flight.in_flight = true;
        Some(FlightGuard { engine: self })
    }

    fn run_pass(
        &self,
        loaded: &mut ActiveModel,
        frame: &Frame,
        confidence_threshold: f32,
    ) -> Result<Vec<Detection>> {
        let layout = loaded.backend.output_layout();
        let (tensor, mapping) = loaded.preprocessor.prepare(frame)?;
        let output = loaded.backend.run(tensor)?;
        let candidates = decode_candidates(
            &output,
            layout,
            &loaded.info.labels,
            &mapping,
            confidence_threshold,
        )?;
        Ok(non_max_suppression(
            candidates,
            self.options.iou_threshold,
            self.options.max_detections,
        ))
    }

    fn lock_flight(&self) -> MutexGuard<'_, FlightState> {
        self.flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_model(&self) -> MutexGuard<'_, Option<ActiveModel>> {
        self.model.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for InferenceEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}
