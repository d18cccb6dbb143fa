//! Sightline: capture-to-detection pipeline.
//!
//! Captures a target window or monitor, runs an object-detection model over
//! each frame and turns the raw detections into prioritized, tier-classified
//! results for downstream consumers (speech, overlay rendering).
//!
//! # Module Structure
//!
//! - `frame`: shared immutable pixel buffers and the latest-frame slot
//! - `events`: non-blocking observer fan-out
//! - `capture`: window resolution, capture backends with fallback, liveness, `FrameSource`
//! - `detect`: model loading, preprocessing, decode, NMS, single-flight `InferenceEngine`
//! - `coordinator`: tiers, change detection with cooldown, label tracking
//! - `pipeline`: session wiring and status reporting
//! - `config`: profile configuration

pub mod capture;
pub mod config;
pub mod coordinator;
pub mod detect;
pub mod events;
pub mod frame;
pub mod pipeline;
pub mod ui;

pub use capture::{
    BoundState, CaptureBackend, CaptureChain, CaptureKind, CaptureMode, CaptureTargetState,
    FrameSource, FrameSourceOptions, TargetEvent, WindowQuery, WindowSystem,
};
pub use config::ProfileConfig;
pub use coordinator::{
    CoordinatorConfig, DetectionCoordinator, LabelDisappeared, LabelTiers, PrimaryChanged, Tier,
    TierSnapshot,
};
pub use detect::{BoundingBox, Detection, InferenceEngine, LoaderRegistry, ModelInfo};
pub use events::{EventHub, SubscriptionId};
pub use frame::{Frame, FrameSlot, PixelFormat};
pub use pipeline::{OverlayUpdate, Pipeline, PipelineStats, PipelineStatus};

/// Lifecycle of a long-lived component, checked at every public entry point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    /// Constructed, not yet started or loaded.
    Uninitialized,
    Running,
    /// Stopped; may be started again.
    Stopped,
    /// Resources released. Terminal.
    Disposed,
}
