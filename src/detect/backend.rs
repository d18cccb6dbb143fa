use std::path::Path;

use anyhow::Result;

use super::decode::OutputLayout;

/// Where a loaded model executes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionPath {
    /// GPU or other accelerator-backed runtime.
    Accelerated,
    Cpu,
}

/// Inference backend trait.
///
/// A backend owns one loaded model and runs a forward pass over a planar RGB tensor
/// shaped `[1, 3, H, W]`. Accelerated runtimes are generally not safe under concurrent
/// invocation; `InferenceEngine` guarantees at most one `run` at a time.
pub trait InferenceBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Fixed model input size as (width, height).
    fn input_size(&self) -> (u32, u32);

    /// Shape of the model's detection output.
    fn output_layout(&self) -> OutputLayout;

    /// Run one forward pass. Returns the flat, attribute-major output.
    ///
    /// Implementations must treat `input` as read-only and must not retain it.
    fn run(&mut self, input: &[f32]) -> Result<Vec<f32>>;

    /// Optional warm-up hook, called once after loading.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A freshly loaded model and the path it will execute on.
pub struct LoadedModel {
    pub backend: Box<dyn InferenceBackend>,
    pub execution: ExecutionPath,
}

/// Loads model files into backends.
pub trait ModelLoader: Send + Sync {
    /// Loader identifier.
    fn name(&self) -> &'static str;

    /// Execution path this loader produces.
    fn execution(&self) -> ExecutionPath;

    /// Returns true when this loader can run on the current machine.
    fn is_available(&self) -> bool {
        true
    }

    fn load(&self, model_path: &Path) -> Result<LoadedModel>;
}
