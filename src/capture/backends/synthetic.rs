//! Synthetic desktop and capture backends for `stub://` targets.
//!
//! The desktop holds scripted windows and monitors that tests open, close,
//! hide and retitle. The backends render a moving test pattern for whatever
//! target they are attached to and fail on request.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};

use crate::capture::backend::{CaptureBackend, CaptureKind, CaptureMode, RawCapture};
use crate::capture::target::{
    MonitorInfo, ResolvedTarget, WindowId, WindowInfo, WindowQuery, WindowSystem,
};
use crate::frame::{PixelFormat, BYTES_PER_PIXEL};

pub const STUB_PREFIX: &str = "stub://";

// ----------------------------------------------------------------------------
// Desktop
// ----------------------------------------------------------------------------

struct DesktopState {
    windows: Vec<WindowInfo>,
    monitors: Vec<MonitorInfo>,
    next_id: u64,
}

/// Scripted window system.
pub struct SyntheticDesktop {
    state: Mutex<DesktopState>,
}

impl Default for SyntheticDesktop {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticDesktop {
    /// Desktop with a single 1280x720 primary monitor and no windows.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DesktopState {
                windows: Vec::new(),
                monitors: vec![MonitorInfo {
                    index: 0,
                    name: "stub-primary".to_string(),
                    primary: true,
                    width: 1280,
                    height: 720,
                }],
                next_id: 1,
            }),
        }
    }

    pub fn add_monitor(&self, name: &str, width: u32, height: u32) -> usize {
        let mut state = self.lock();
        let index = state.monitors.len();
        state.monitors.push(MonitorInfo {
            index,
            name: name.to_string(),
            primary: false,
            width,
            height,
        });
        index
    }

    pub fn open_window(&self, title: &str, width: u32, height: u32) -> WindowId {
        let mut state = self.lock();
        let id = WindowId(state.next_id);
        state.next_id += 1;
        state.windows.push(WindowInfo {
            id,
            title: title.to_string(),
            visible: true,
            width,
            height,
        });
        log::debug!("SyntheticDesktop: opened window {} '{}'", id.0, title);
        id
    }

    pub fn close_window(&self, id: WindowId) -> bool {
        let mut state = self.lock();
        let before = state.windows.len();
        state.windows.retain(|w| w.id != id);
        before != state.windows.len()
    }

    pub fn set_visible(&self, id: WindowId, visible: bool) {
        if let Some(window) = self.lock().windows.iter_mut().find(|w| w.id == id) {
            window.visible = visible;
        }
    }

    /// Change a window's title while keeping its handle.
    pub fn retitle(&self, id: WindowId, title: &str) {
        if let Some(window) = self.lock().windows.iter_mut().find(|w| w.id == id) {
            window.title = title.to_string();
        }
    }

    pub fn window_info(&self, id: WindowId) -> Option<WindowInfo> {
        self.lock().windows.iter().find(|w| w.id == id).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, DesktopState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl WindowSystem for SyntheticDesktop {
    fn find_window(&self, query: &WindowQuery) -> Option<WindowInfo> {
        self.lock()
            .windows
            .iter()
            .find(|w| w.visible && query.matches(w))
            .cloned()
    }

    fn window(&self, id: WindowId) -> Option<WindowInfo> {
        self.window_info(id)
    }

    fn monitors(&self) -> Vec<MonitorInfo> {
        self.lock().monitors.clone()
    }
}

// ----------------------------------------------------------------------------
// Backend
// ----------------------------------------------------------------------------

/// Shared grab counters for a synthetic backend.
#[derive(Clone, Default)]
pub struct SyntheticCounters {
    grabs: Arc<AtomicUsize>,
    direct_grabs: Arc<AtomicUsize>,
}

impl SyntheticCounters {
    pub fn grabs(&self) -> usize {
        self.grabs.load(Ordering::SeqCst)
    }

    /// Grabs made in `CaptureMode::Direct`.
    pub fn direct_grabs(&self) -> usize {
        self.direct_grabs.load(Ordering::SeqCst)
    }
}

/// Capture backend that renders a test pattern.
///
/// Window targets fail to grab once the window is closed on the desktop.
pub struct SyntheticBackend {
    name: &'static str,
    kind: CaptureKind,
    desktop: Arc<SyntheticDesktop>,
    target: Option<ResolvedTarget>,
    fail_attach: bool,
    fail_after: Option<usize>,
    frame_count: u64,
    counters: SyntheticCounters,
}

impl SyntheticBackend {
    pub fn compositor(desktop: Arc<SyntheticDesktop>) -> Self {
        Self::with_kind("synthetic-compositor", CaptureKind::Compositor, desktop)
    }

    pub fn pixel_copy(desktop: Arc<SyntheticDesktop>) -> Self {
        Self::with_kind("synthetic-pixel-copy", CaptureKind::PixelCopy, desktop)
    }

    fn with_kind(name: &'static str, kind: CaptureKind, desktop: Arc<SyntheticDesktop>) -> Self {
        Self {
            name,
            kind,
            desktop,
            target: None,
            fail_attach: false,
            fail_after: None,
            frame_count: 0,
            counters: SyntheticCounters::default(),
        }
    }

    /// Refuse every attach.
    pub fn fail_attach(mut self) -> Self {
        self.fail_attach = true;
        self
    }

    /// Succeed for the first `grabs` grabs after each attach, then fail.
    pub fn fail_grabs_after(mut self, grabs: usize) -> Self {
        self.fail_after = Some(grabs);
        self
    }

    pub fn counters(&self) -> SyntheticCounters {
        self.counters.clone()
    }

    fn dimensions(&self) -> Result<(u32, u32)> {
        match &self.target {
            Some(ResolvedTarget::Window(window)) => {
                let current = self
                    .desktop
                    .window_info(window.id)
                    .ok_or_else(|| anyhow!("window {} no longer exists", window.id.0))?;
                Ok((current.width, current.height))
            }
            Some(ResolvedTarget::Monitor(monitor)) => Ok((monitor.width, monitor.height)),
            None => bail!("{} is not attached", self.name),
        }
    }

    /// BGRA gradient with a bright square that drifts one pixel per frame.
    fn render(&self, width: u32, height: u32) -> Vec<u8> {
        let stride = width as usize * BYTES_PER_PIXEL;
        let mut pixels = vec![0u8; stride * height as usize];
        let side = (width.min(height) / 4).max(1);
        let offset = (self.frame_count % u64::from(width.max(1))) as u32;
        for y in 0..height {
            let row = &mut pixels[y as usize * stride..(y as usize + 1) * stride];
            for x in 0..width {
                let px = &mut row[x as usize * BYTES_PER_PIXEL..(x as usize + 1) * BYTES_PER_PIXEL];
                let in_square = x >= offset && x < offset + side && y < side;
                if in_square {
                    px.copy_from_slice(&[255, 255, 255, 255]);
                } else {
                    px[0] = (x % 256) as u8;
                    px[1] = (y % 256) as u8;
                    px[2] = 64;
                    px[3] = 255;
                }
            }
        }
        pixels
    }
}

impl CaptureBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    fn kind(&self) -> CaptureKind {
        self.kind
    }

    fn attach(&mut self, target: &ResolvedTarget) -> Result<()> {
        if self.fail_attach {
            bail!("{} setup failed (scripted)", self.name);
        }
        self.target = Some(target.clone());
        self.frame_count = 0;
        self.dimensions().map(|_| ())
    }

    fn grab(&mut self, mode: CaptureMode) -> Result<RawCapture> {
        if let Some(limit) = self.fail_after {
            if self.frame_count as usize >= limit {
                bail!("{} grab failed (scripted)", self.name);
            }
        }
        let (width, height) = self.dimensions()?;
        self.frame_count += 1;
        self.counters.grabs.fetch_add(1, Ordering::SeqCst);
        if mode == CaptureMode::Direct {
            self.counters.direct_grabs.fetch_add(1, Ordering::SeqCst);
        }
        Ok(RawCapture {
            pixels: self.render(width, height),
            format: PixelFormat::Bgra8,
            width,
            height,
            stride: width as usize * BYTES_PER_PIXEL,
        })
    }

    fn detach(&mut self) {
        self.target = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hidden_windows_are_not_found() {
        let desktop = SyntheticDesktop::new();
        let id = desktop.open_window("stub://game", 32, 32);
        let query = WindowQuery::Title("game".into());
        assert!(desktop.find_window(&query).is_some());
        desktop.set_visible(id, false);
        assert!(desktop.find_window(&query).is_none());
        assert!(desktop.window(id).is_some());
    }

    #[test]
    fn grab_fails_after_window_closes() -> Result<()> {
        let desktop = Arc::new(SyntheticDesktop::new());
        let id = desktop.open_window("stub://game", 16, 8);
        let info = desktop
            .window_info(id)
            .ok_or_else(|| anyhow!("missing window"))?;
        let mut backend = SyntheticBackend::pixel_copy(desktop.clone());
        backend.attach(&ResolvedTarget::Window(info))?;

        let raw = backend.grab(CaptureMode::Composited)?;
        assert_eq!(raw.pixels.len(), 16 * 8 * 4);

        assert!(desktop.close_window(id));
        assert!(backend.grab(CaptureMode::Composited).is_err());
        Ok(())
    }

    #[test]
    fn direct_grabs_are_counted() -> Result<()> {
        let desktop = Arc::new(SyntheticDesktop::new());
        let monitor = desktop.monitors().remove(0);
        let mut backend = SyntheticBackend::compositor(desktop);
        let counters = backend.counters();
        backend.attach(&ResolvedTarget::Monitor(monitor))?;
        backend.grab(CaptureMode::Direct)?;
        backend.grab(CaptureMode::Composited)?;
        assert_eq!(counters.grabs(), 2);
        assert_eq!(counters.direct_grabs(), 1);
        Ok(())
    }
}
