use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::detect::backend::{ExecutionPath, InferenceBackend, LoadedModel, ModelLoader};
use crate::detect::decode::OutputLayout;

/// Scripted backend for testing.
///
/// Returns the same output for every call, built from candidates given in model input
/// coordinates. Optionally sleeps inside `run` to simulate a slow forward pass, or fails.
#[derive(Clone)]
pub struct StubBackend {
    input_width: u32,
    input_height: u32,
    layout: OutputLayout,
    output: Vec<f32>,
    next_slot: usize,
    delay: Option<Duration>,
    fail: bool,
    runs: Arc<AtomicUsize>,
}

impl StubBackend {
    /// Backend with `classes` classes and room for `candidates` scripted candidates.
    pub fn new(input_width: u32, input_height: u32, classes: usize, candidates: usize) -> Self {
        let layout = OutputLayout {
            attributes: 4 + classes.max(1),
            candidates: candidates.max(1),
        };
        Self {
            input_width,
            input_height,
            output: vec![0.0; layout.len()],
            layout,
            next_slot: 0,
            delay: None,
            fail: false,
            runs: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Script one candidate in model input coordinates. Extra candidates beyond capacity are ignored.
    pub fn with_candidate(mut self, cx: f32, cy: f32, w: f32, h: f32, class: usize, score: f32) -> Self {
        let m = self.layout.candidates;
        let i = self.next_slot;
        if i < m && class < self.layout.class_count() {
            self.output[i] = cx;
            self.output[m + i] = cy;
            self.output[2 * m + i] = w;
            self.output[3 * m + i] = h;
            self.output[(4 + class) * m + i] = score;
            self.next_slot += 1;
        }
        self
    }

    /// Sleep for `delay` inside every forward pass.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make every forward pass fail.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Shared counter of completed `run` calls.
    pub fn run_counter(&self) -> Arc<AtomicUsize> {
        self.runs.clone()
    }
}

impl InferenceBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn input_size(&self) -> (u32, u32) {
        (self.input_width, self.input_height)
    }

    fn output_layout(&self) -> OutputLayout {
        self.layout
    }

    fn run(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let expected = 3 * self.input_width as usize * self.input_height as usize;
        if input.len() != expected {
            return Err(anyhow!(
                "stub backend expected {} input values, received {}",
                expected,
                input.len()
            ));
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(anyhow!("stub backend forward pass failed"));
        }
        Ok(self.output.clone())
    }
}

/// Loader that hands out clones of a prepared `StubBackend`.
#[derive(Clone)]
pub struct StubLoader {
    backend: StubBackend,
    execution: ExecutionPath,
}

impl StubLoader {
    pub fn new(backend: StubBackend) -> Self {
        Self {
            backend,
            execution: ExecutionPath::Cpu,
        }
    }

    pub fn accelerated(mut self) -> Self {
        self.execution = ExecutionPath::Accelerated;
        self
    }
}

impl ModelLoader for StubLoader {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn execution(&self) -> ExecutionPath {
        self.execution
    }

    fn load(&self, _model_path: &Path) -> Result<LoadedModel> {
        Ok(LoadedModel {
            backend: Box::new(self.backend.clone()),
            execution: self.execution,
        })
    }
}
