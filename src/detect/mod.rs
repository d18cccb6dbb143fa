//! Object detection: model loading, preprocessing, forward pass, decode and suppression.

mod backend;
pub mod backends;
mod decode;
mod engine;
mod labels;
mod nms;
mod preprocess;
mod registry;
mod result;

pub use backend::{ExecutionPath, InferenceBackend, LoadedModel, ModelLoader};
pub use backends::{StubBackend, StubLoader};
pub use decode::{decode_candidates, OutputLayout};
pub use engine::{EngineOptions, EngineStats, InferenceEngine, ModelInfo, DEFAULT_DISPOSE_TIMEOUT};
pub use labels::{default_labels_path, load_labels};
pub use nms::{non_max_suppression, sort_by_confidence, DEFAULT_IOU_THRESHOLD};
pub use preprocess::{CoordinateMapping, Preprocessor};
pub use registry::LoaderRegistry;
pub use result::{BoundingBox, Detection};
