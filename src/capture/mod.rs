//! Frame acquisition.
//!
//! This module provides `FrameSource` for capturing a window or monitor at a
//! fixed interval.
//!
//! The capture side is responsible for:
//! - Resolving the target through a `WindowSystem`
//! - Choosing the fastest working `CaptureBackend` and falling back on failure
//! - Detecting lost targets and rebinding when they return
//! - Producing shared, immutable `Frame`s

mod backend;
pub mod backends;
mod chain;
mod liveness;
mod source;
mod target;

pub use backend::{CaptureBackend, CaptureKind, CaptureMode, RawCapture};
pub use chain::{CaptureChain, MAX_CONSECUTIVE_FAILURES};
pub use liveness::{
    verify_window, CheckReason, LivenessMonitor, WindowCheck, DEFAULT_CHECK_INTERVAL,
    DEFAULT_STALL_THRESHOLD,
};
pub use source::{
    FrameSource, FrameSourceOptions, FrameSourceStats, DEFAULT_CAPTURE_INTERVAL, FRAME_QUEUE_DEPTH,
    MIN_CAPTURE_INTERVAL,
};
pub use target::{
    BoundState, CaptureTargetState, MonitorInfo, ResolvedTarget, TargetEvent, WindowId,
    WindowInfo, WindowQuery, WindowSystem,
};
