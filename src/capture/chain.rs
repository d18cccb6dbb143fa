use anyhow::{anyhow, Result};

use super::backend::{CaptureBackend, CaptureKind, CaptureMode, RawCapture};
use super::target::ResolvedTarget;

/// Consecutive grab failures after which a backend is abandoned.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Ordered capture backends with fallback.
///
/// Backends are tried fastest first. A backend that fails to attach, fails its
/// first grab, or fails `MAX_CONSECUTIVE_FAILURES` grabs in a row is abandoned
/// for the next one until a new target is attached.
pub struct CaptureChain {
    backends: Vec<Box<dyn CaptureBackend>>,
    active: Option<usize>,
    target: Option<ResolvedTarget>,
    delivered: bool,
    consecutive_failures: u32,
}

impl CaptureChain {
    pub fn new(mut backends: Vec<Box<dyn CaptureBackend>>) -> Self {
        backends.sort_by_key(|b| b.kind());
        Self {
            backends,
            active: None,
            target: None,
            delivered: false,
            consecutive_failures: 0,
        }
    }

    pub fn backend_names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Attach to `target`, starting from the fastest backend.
    ///
    /// Returns the name of the backend that accepted the target.
    pub fn attach(&mut self, target: &ResolvedTarget) -> Result<&'static str> {
        self.detach();
        self.target = Some(target.clone());
        self.activate_from(0)
            .ok_or_else(|| anyhow!("no capture backend could attach to {}", target))
    }

    pub fn detach(&mut self) {
        if let Some(index) = self.active.take() {
            if let Some(backend) = self.backends.get_mut(index) {
                backend.detach();
            }
        }
        self.target = None;
        self.delivered = false;
        self.consecutive_failures = 0;
    }

    /// Grab one image from the active backend, falling back on failure.
    ///
    /// A failing grab that does not exhaust the backend returns the error and the
    /// caller drops that frame. When a backend is abandoned the next one is tried
    /// within the same call.
    pub fn grab(&mut self, mode: CaptureMode) -> Result<RawCapture> {
        loop {
            let index = self
                .active
                .ok_or_else(|| anyhow!("no capture backend attached"))?;
            let backend = self
                .backends
                .get_mut(index)
                .ok_or_else(|| anyhow!("capture backend index {} out of range", index))?;

            match backend.grab(mode) {
                Ok(raw) => {
                    self.delivered = true;
                    self.consecutive_failures = 0;
                    return Ok(raw);
                }
                Err(err) => {
                    self.consecutive_failures += 1;
                    let abandon =
                        !self.delivered || self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES;
                    if !abandon {
                        return Err(err);
                    }
                    log::warn!(
                        "CaptureChain: abandoning {} after {} failure(s): {:#}",
                        backend.name(),
                        self.consecutive_failures,
                        err
                    );
                    backend.detach();
                    self.active = None;
                    if self.activate_from(index + 1).is_none() {
                        return Err(err.context("all capture backends failed"));
                    }
                }
            }
        }
    }

    /// True once every backend has been abandoned for the current target.
    pub fn is_exhausted(&self) -> bool {
        self.target.is_some() && self.active.is_none()
    }

    pub fn active_backend(&self) -> Option<&'static str> {
        self.active
            .and_then(|i| self.backends.get(i))
            .map(|b| b.name())
    }

    pub fn active_kind(&self) -> Option<CaptureKind> {
        self.active
            .and_then(|i| self.backends.get(i))
            .map(|b| b.kind())
    }

    fn activate_from(&mut self, start: usize) -> Option<&'static str> {
        let target = self.target.clone()?;
        for index in start..self.backends.len() {
            let backend = &mut self.backends[index];
            match backend.attach(&target) {
                Ok(()) => {
                    if start > 0 {
                        log::info!("CaptureChain: falling back to {}", backend.name());
                    } else {
                        log::info!("CaptureChain: using {} for {}", backend.name(), target);
                    }
                    self.active = Some(index);
                    self.delivered = false;
                    self.consecutive_failures = 0;
                    return Some(backend.name());
                }
                Err(err) => {
                    log::warn!(
                        "CaptureChain: {} unavailable for {}: {:#}",
                        backend.name(),
                        target,
                        err
                    );
                }
            }
        }
        None
    }
}
