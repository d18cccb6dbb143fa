use anyhow::Result;

use super::target::ResolvedTarget;
use crate::frame::PixelFormat;

/// Capture technology class, fastest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CaptureKind {
    /// Low-latency compositor-level capture.
    Compositor,
    /// Universal pixel copy. Slower, always available.
    PixelCopy,
}

/// Which pixels a grab returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureMode {
    /// Whatever the backend normally returns (may include the desktop composition).
    Composited,
    /// Pixels sourced from the target surface itself, excluding any overlay drawn on top.
    Direct,
}

/// Pixels from one grab, before they become a `Frame`.
pub struct RawCapture {
    pub pixels: Vec<u8>,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub stride: usize,
}

/// Capture backend trait.
///
/// Backends are used from a single capture thread at a time; `Send` is enough.
pub trait CaptureBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    fn kind(&self) -> CaptureKind;

    /// Prepare to capture `target`. Failing here moves the chain to the next backend.
    fn attach(&mut self, target: &ResolvedTarget) -> Result<()>;

    /// Grab one image of the attached target.
    fn grab(&mut self, mode: CaptureMode) -> Result<RawCapture>;

    /// Release per-target resources.
    fn detach(&mut self) {}
}
