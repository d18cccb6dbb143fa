use std::fmt;

/// Opaque window handle from the window system.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WindowId(pub u64);

/// How to find the target window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WindowQuery {
    /// Case-insensitive substring of the window title.
    Title(String),
    /// Exact native handle.
    Handle(WindowId),
}

impl WindowQuery {
    pub fn matches(&self, window: &WindowInfo) -> bool {
        match self {
            WindowQuery::Title(title) => window
                .title
                .to_lowercase()
                .contains(&title.to_lowercase()),
            WindowQuery::Handle(id) => window.id == *id,
        }
    }
}

impl fmt::Display for WindowQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowQuery::Title(title) => write!(f, "title '{}'", title),
            WindowQuery::Handle(id) => write!(f, "handle {}", id.0),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WindowInfo {
    pub id: WindowId,
    pub title: String,
    pub visible: bool,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitorInfo {
    pub index: usize,
    pub name: String,
    pub primary: bool,
    pub width: u32,
    pub height: u32,
}

/// Window system seam: resolution, lookup and monitor enumeration.
pub trait WindowSystem: Send + Sync {
    /// First visible window matching `query`.
    fn find_window(&self, query: &WindowQuery) -> Option<WindowInfo>;

    /// Current state of a window, or `None` once it no longer exists.
    fn window(&self, id: WindowId) -> Option<WindowInfo>;

    fn monitors(&self) -> Vec<MonitorInfo>;
}

/// A surface the capture backends can read from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolvedTarget {
    Window(WindowInfo),
    Monitor(MonitorInfo),
}

impl fmt::Display for ResolvedTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedTarget::Window(w) => write!(f, "window '{}' ({})", w.title, w.id.0),
            ResolvedTarget::Monitor(m) => write!(f, "monitor {} '{}'", m.index, m.name),
        }
    }
}

/// Capture target state. Transitions switch frame production on and off.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaptureTargetState {
    /// Nothing bound yet.
    Unbound,
    BoundToWindow(WindowInfo),
    BoundToMonitor(MonitorInfo),
    /// The window is not present (yet, or any more); resolution is retried periodically.
    WaitingForWindow(WindowQuery),
    /// The target resolved but no capture backend could read it.
    Lost(String),
}

impl CaptureTargetState {
    pub fn is_bound(&self) -> bool {
        matches!(
            self,
            CaptureTargetState::BoundToWindow(_) | CaptureTargetState::BoundToMonitor(_)
        )
    }
}

/// Outcome of a bind call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BoundState {
    Window(WindowInfo),
    Monitor(MonitorInfo),
    /// Window not found; the source keeps retrying and reports "target found" later.
    Waiting(WindowQuery),
}

/// Liveness notifications.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetEvent {
    Found(ResolvedTarget),
    Lost { reason: String },
    /// All capture backends failed for a resolved target.
    CaptureFailed { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(id: u64, title: &str) -> WindowInfo {
        WindowInfo {
            id: WindowId(id),
            title: title.to_string(),
            visible: true,
            width: 800,
            height: 600,
        }
    }

    #[test]
    fn title_query_is_case_insensitive_substring() {
        let w = window(1, "Arc Raiders - DX12");
        assert!(WindowQuery::Title("arc raiders".into()).matches(&w));
        assert!(!WindowQuery::Title("no man's sky".into()).matches(&w));
    }

    #[test]
    fn handle_query_matches_id_only() {
        let w = window(9, "anything");
        assert!(WindowQuery::Handle(WindowId(9)).matches(&w));
        assert!(!WindowQuery::Handle(WindowId(8)).matches(&w));
    }
}
