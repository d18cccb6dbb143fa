//! Raw model output → detections.
//!
//! The output tensor is logically `[4 + N] x [M]`, attribute-major: row 0..4 holds
//! center-x, center-y, width, height for every candidate, rows 4.. hold per-class scores.

use anyhow::{anyhow, Result};

use super::preprocess::CoordinateMapping;
use super::result::{BoundingBox, Detection};

/// Shape of a detection head's output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputLayout {
    /// Attributes per candidate: 4 box parameters plus one score per class.
    pub attributes: usize,
    /// Number of candidate boxes.
    pub candidates: usize,
}

impl OutputLayout {
    pub fn new(attributes: usize, candidates: usize) -> Result<Self> {
        if attributes <= 4 {
            return Err(anyhow!(
                "model output has {} attributes per candidate; expected 4 box values plus class scores",
                attributes
            ));
        }
        if candidates == 0 {
            return Err(anyhow!("model output has no candidate boxes"));
        }
        Ok(Self {
            attributes,
            candidates,
        })
    }

    pub fn class_count(&self) -> usize {
        self.attributes - 4
    }

    pub fn len(&self) -> usize {
        self.attributes * self.candidates
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decode candidates at or above `confidence_threshold` into frame-space detections.
///
/// No suppression is applied; see `non_max_suppression`.
pub fn decode_candidates(
    output: &[f32],
    layout: OutputLayout,
    labels: &[String],
    mapping: &CoordinateMapping,
    confidence_threshold: f32,
) -> Result<Vec<Detection>> {
    if output.len() < layout.len() {
        return Err(anyhow!(
            "model output has {} values, layout {}x{} needs {}",
            output.len(),
            layout.attributes,
            layout.candidates,
            layout.len()
        ));
    }

    let m = layout.candidates;
    let at = |attr: usize, i: usize| output[attr * m + i];
    let mut detections = Vec::new();

    for i in 0..m {
        let mut best_class = 0usize;
        let mut best_score = f32::NEG_INFINITY;
        for class in 0..layout.class_count() {
            let score = at(4 + class, i);
            if score > best_score {
                best_score = score;
                best_class = class;
            }
        }
        if !best_score.is_finite() || best_score < confidence_threshold {
            continue;
        }

        let model_box = BoundingBox::from_center(at(0, i), at(1, i), at(2, i), at(3, i));
        let bbox = model_box
            .scaled(mapping.scale_x, mapping.scale_y)
            .clamped(mapping.frame_width, mapping.frame_height);
        let label = labels
            .get(best_class)
            .cloned()
            .unwrap_or_else(|| best_class.to_string());

        detections.push(Detection::new(
            label,
            best_class,
            best_score.min(1.0),
            bbox,
        ));
    }

    Ok(detections)
}
