//! Desktop capture through `xcap`, used as the universal pixel-copy path.
#![cfg(feature = "capture-xcap")]

use anyhow::{anyhow, bail, Context, Result};

use crate::capture::backend::{CaptureBackend, CaptureKind, CaptureMode, RawCapture};
use crate::capture::target::{
    MonitorInfo, ResolvedTarget, WindowId, WindowInfo, WindowQuery, WindowSystem,
};
use crate::frame::{PixelFormat, BYTES_PER_PIXEL};

fn describe(window: &xcap::Window) -> WindowInfo {
    WindowInfo {
        id: WindowId(u64::from(window.id())),
        title: window.title().to_string(),
        visible: !window.is_minimized(),
        width: window.width(),
        height: window.height(),
    }
}

fn list_windows() -> Vec<xcap::Window> {
    match xcap::Window::all() {
        Ok(windows) => windows,
        Err(err) => {
            log::warn!("XcapWindows: window enumeration failed: {}", err);
            Vec::new()
        }
    }
}

fn list_monitors() -> Vec<xcap::Monitor> {
    match xcap::Monitor::all() {
        Ok(monitors) => monitors,
        Err(err) => {
            log::warn!("XcapWindows: monitor enumeration failed: {}", err);
            Vec::new()
        }
    }
}

/// Window system backed by the platform window list.
#[derive(Default)]
pub struct XcapWindows;

impl WindowSystem for XcapWindows {
    fn find_window(&self, query: &WindowQuery) -> Option<WindowInfo> {
        list_windows()
            .iter()
            .map(describe)
            .find(|w| w.visible && query.matches(w))
    }

    fn window(&self, id: WindowId) -> Option<WindowInfo> {
        list_windows()
            .iter()
            .map(describe)
            .find(|w| w.id == id)
    }

    fn monitors(&self) -> Vec<MonitorInfo> {
        list_monitors()
            .iter()
            .enumerate()
            .map(|(index, m)| MonitorInfo {
                index,
                name: m.name().to_string(),
                primary: m.is_primary(),
                width: m.width(),
                height: m.height(),
            })
            .collect()
    }
}

/// Pixel-copy capture of a window or monitor.
#[derive(Default)]
pub struct XcapBackend {
    target: Option<ResolvedTarget>,
}

impl XcapBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CaptureBackend for XcapBackend {
    fn name(&self) -> &'static str {
        "xcap"
    }

    fn kind(&self) -> CaptureKind {
        CaptureKind::PixelCopy
    }

    fn attach(&mut self, target: &ResolvedTarget) -> Result<()> {
        self.target = Some(target.clone());
        Ok(())
    }

    fn grab(&mut self, mode: CaptureMode) -> Result<RawCapture> {
        // Window captures read the window surface itself, so both modes exclude overlays.
        let image = match &self.target {
            Some(ResolvedTarget::Window(info)) => list_windows()
                .into_iter()
                .find(|w| u64::from(w.id()) == info.id.0)
                .ok_or_else(|| anyhow!("window {} no longer exists", info.id.0))?
                .capture_image()
                .context("window capture failed")?,
            Some(ResolvedTarget::Monitor(info)) => {
                if mode == CaptureMode::Direct {
                    log::debug!("XcapBackend: monitor capture cannot exclude overlays");
                }
                list_monitors()
                    .into_iter()
                    .nth(info.index)
                    .ok_or_else(|| anyhow!("monitor {} no longer exists", info.index))?
                    .capture_image()
                    .context("monitor capture failed")?
            }
            None => bail!("xcap backend is not attached"),
        };

        let (width, height) = (image.width(), image.height());
        Ok(RawCapture {
            pixels: image.into_raw(),
            format: PixelFormat::Rgba8,
            width,
            height,
            stride: width as usize * BYTES_PER_PIXEL,
        })
    }

    fn detach(&mut self) {
        self.target = None;
    }
}
