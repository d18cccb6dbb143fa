//! Target liveness: when to re-check a bound window and what counts as lost.

use std::time::{Duration, Instant};

use super::target::{WindowInfo, WindowQuery, WindowSystem};

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(1500);
/// Frame silence that forces a check even if the periodic one is not due.
pub const DEFAULT_STALL_THRESHOLD: Duration = Duration::from_millis(2500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckReason {
    Periodic,
    Stalled,
}

/// Check scheduler. Also paces resolution retries while waiting for a window.
#[derive(Clone, Debug)]
pub struct LivenessMonitor {
    interval: Duration,
    stall_threshold: Duration,
    last_check: Instant,
    last_frame: Option<Instant>,
}

impl LivenessMonitor {
    pub fn new(interval: Duration, stall_threshold: Duration, now: Instant) -> Self {
        Self {
            interval,
            stall_threshold,
            last_check: now,
            last_frame: None,
        }
    }

    /// Restart both clocks, e.g. after binding a new target.
    pub fn reset(&mut self, now: Instant) {
        self.last_check = now;
        self.last_frame = None;
    }

    pub fn note_frame(&mut self, now: Instant) {
        self.last_frame = Some(now);
    }

    pub fn mark_checked(&mut self, now: Instant) {
        self.last_check = now;
    }

    /// Whether a check is due at `now`.
    ///
    /// Stall detection fires once per silent stretch: only if no check ran since
    /// the silence crossed the threshold. Before the first frame the bind time
    /// stands in for the last frame.
    pub fn check_due(&self, now: Instant) -> Option<CheckReason> {
        let since_check = now.saturating_duration_since(self.last_check);
        if since_check >= self.interval {
            return Some(CheckReason::Periodic);
        }
        let quiet_since = self.last_frame.unwrap_or(self.last_check);
        let stall_started = quiet_since + self.stall_threshold;
        if now >= stall_started && self.last_check < stall_started {
            return Some(CheckReason::Stalled);
        }
        None
    }
}

/// Result of verifying a bound window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WindowCheck {
    Alive(WindowInfo),
    Gone(String),
}

/// Verify that `bound` still exists, is visible and is still the same window.
///
/// A handle that now carries a title the query no longer accepts (or, for
/// handle queries, a different title) is treated as a different window.
pub fn verify_window(
    windows: &dyn WindowSystem,
    query: &WindowQuery,
    bound: &WindowInfo,
) -> WindowCheck {
    let Some(current) = windows.window(bound.id) else {
        return WindowCheck::Gone(format!("window {} closed", bound.id.0));
    };
    if !current.visible {
        return WindowCheck::Gone(format!("window '{}' is not visible", current.title));
    }
    let same_window = match query {
        WindowQuery::Title(_) => query.matches(&current),
        WindowQuery::Handle(_) => current.title == bound.title,
    };
    if !same_window {
        return WindowCheck::Gone(format!(
            "window {} changed from '{}' to '{}'",
            bound.id.0, bound.title, current.title
        ));
    }
    WindowCheck::Alive(current)
}
