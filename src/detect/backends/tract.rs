#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::{ExecutionPath, InferenceBackend, LoadedModel, ModelLoader};
use crate::detect::decode::OutputLayout;

type TractPlan = TypedRunnableModel<TypedModel>;

/// Tract-based backend for ONNX detection models.
///
/// Loads a local model file and runs it on the CPU. The model must declare a fixed
/// `[1, 3, H, W]` input and a `[1, 4 + N, M]` output.
pub struct TractBackend {
    model: TractPlan,
    width: u32,
    height: u32,
    layout: OutputLayout,
}

impl TractBackend {
    /// Load an ONNX model from disk, discover its input/output shapes and prepare it for inference.
    pub fn load<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let model_path = model_path.as_ref();
        let typed = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .into_typed()
            .context("failed to type ONNX model")?;

        let input_shape: Vec<usize> = typed
            .input_fact(0)
            .context("model has no input")?
            .shape
            .as_concrete()
            .ok_or_else(|| anyhow!("model input shape must be fixed (export with dynamic=False)"))?
            .to_vec();
        let (width, height) = match input_shape.as_slice() {
            [1, 3, h, w] => (*w as u32, *h as u32),
            other => {
                return Err(anyhow!(
                    "unsupported model input shape {:?}; expected [1, 3, H, W]",
                    other
                ))
            }
        };

        let output_shape: Vec<usize> = typed
            .output_fact(0)
            .context("model has no output")?
            .shape
            .as_concrete()
            .ok_or_else(|| anyhow!("model output shape must be fixed"))?
            .to_vec();
        let layout = match output_shape.as_slice() {
            [1, attributes, candidates] => OutputLayout::new(*attributes, *candidates)?,
            other => {
                return Err(anyhow!(
                    "unsupported model output shape {:?}; expected [1, 4 + classes, candidates]",
                    other
                ))
            }
        };

        let model = typed
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width,
            height,
            layout,
        })
    }
}

impl InferenceBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn input_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn output_layout(&self) -> OutputLayout {
        self.layout
    }

    fn run(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let shape = [1, 3, self.height as usize, self.width as usize];
        let tensor = Tensor::from_shape(&shape, input).context("failed to build input tensor")?;
        let outputs = self
            .model
            .run(tvec!(tensor.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let values = output
            .as_slice::<f32>()
            .context("model output tensor was not f32")?;
        Ok(values.to_vec())
    }

    fn warm_up(&mut self) -> Result<()> {
        let zeros = vec![0.0f32; 3 * self.width as usize * self.height as usize];
        self.run(&zeros).map(|_| ())
    }
}

/// CPU loader for ONNX models via tract.
pub struct TractLoader;

impl ModelLoader for TractLoader {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn execution(&self) -> ExecutionPath {
        ExecutionPath::Cpu
    }

    fn load(&self, model_path: &Path) -> Result<LoadedModel> {
        Ok(LoadedModel {
            backend: Box::new(TractBackend::load(model_path)?),
            execution: ExecutionPath::Cpu,
        })
    }
}
