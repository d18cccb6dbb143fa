//! Periodic frame source with push and pull access.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};

use super::backend::{CaptureBackend, CaptureMode, RawCapture};
use super::backends::{SyntheticBackend, SyntheticDesktop};
use super::chain::CaptureChain;
use super::liveness::{
    verify_window, CheckReason, LivenessMonitor, WindowCheck, DEFAULT_CHECK_INTERVAL,
    DEFAULT_STALL_THRESHOLD,
};
use super::target::{
    BoundState, CaptureTargetState, ResolvedTarget, TargetEvent, WindowInfo, WindowQuery,
    WindowSystem,
};
use crate::events::EventHub;
use crate::frame::{Frame, FrameSlot};
use crate::Lifecycle;

pub const MIN_CAPTURE_INTERVAL: Duration = Duration::from_millis(16);
pub const DEFAULT_CAPTURE_INTERVAL: Duration = Duration::from_millis(33);
/// Frames queued per `on_frame` subscriber before new frames are dropped for it.
pub const FRAME_QUEUE_DEPTH: usize = 2;

#[derive(Clone, Debug)]
pub struct FrameSourceOptions {
    /// Time between capture ticks. Clamped to `MIN_CAPTURE_INTERVAL`.
    pub interval: Duration,
    pub liveness_interval: Duration,
    pub stall_threshold: Duration,
}

impl Default for FrameSourceOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_CAPTURE_INTERVAL,
            liveness_interval: DEFAULT_CHECK_INTERVAL,
            stall_threshold: DEFAULT_STALL_THRESHOLD,
        }
    }
}

/// Statistics for a frame source.
#[derive(Clone, Debug)]
pub struct FrameSourceStats {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    /// Frames a slow `on_frame` subscriber never received.
    pub frames_undelivered: u64,
    pub backend: Option<&'static str>,
    pub target: CaptureTargetState,
}

struct SourceState {
    lifecycle: Lifecycle,
    target: CaptureTargetState,
    query: Option<WindowQuery>,
    liveness: LivenessMonitor,
}

struct Shared {
    windows: Arc<dyn WindowSystem>,
    // Lock order: `state` before `chain`.
    state: Mutex<SourceState>,
    chain: Mutex<CaptureChain>,
    wake: Condvar,
    interval: Duration,
    slot: FrameSlot,
    frames: EventHub<Frame>,
    targets: EventHub<TargetEvent>,
    sequence: AtomicU64,
    overlay_active: AtomicBool,
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Captures a bound window or monitor on its own thread.
///
/// Every frame is published to `on_frame` subscribers and stored as the latest
/// frame. A bound window is re-checked periodically; when it disappears the
/// source waits for it to come back and reports both transitions on
/// `target_events`.
pub struct FrameSource {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FrameSource {
    pub fn new(
        windows: Arc<dyn WindowSystem>,
        chain: CaptureChain,
        options: FrameSourceOptions,
    ) -> Self {
        let interval = if options.interval < MIN_CAPTURE_INTERVAL {
            log::warn!(
                "FrameSource: capture interval {:?} below minimum, using {:?}",
                options.interval,
                MIN_CAPTURE_INTERVAL
            );
            MIN_CAPTURE_INTERVAL
        } else {
            options.interval
        };

        Self {
            shared: Arc::new(Shared {
                windows,
                state: Mutex::new(SourceState {
                    lifecycle: Lifecycle::Uninitialized,
                    target: CaptureTargetState::Unbound,
                    query: None,
                    liveness: LivenessMonitor::new(
                        options.liveness_interval,
                        options.stall_threshold,
                        Instant::now(),
                    ),
                }),
                chain: Mutex::new(chain),
                wake: Condvar::new(),
                interval,
                slot: FrameSlot::new(),
                frames: EventHub::bounded("frame", FRAME_QUEUE_DEPTH),
                targets: EventHub::new("target"),
                sequence: AtomicU64::new(0),
                overlay_active: AtomicBool::new(false),
                frames_captured: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Source over a synthetic desktop with a compositor and a pixel-copy backend.
    pub fn synthetic(desktop: Arc<SyntheticDesktop>, options: FrameSourceOptions) -> Self {
        let backends: Vec<Box<dyn CaptureBackend>> = vec![
            Box::new(SyntheticBackend::compositor(desktop.clone())),
            Box::new(SyntheticBackend::pixel_copy(desktop.clone())),
        ];
        Self::new(desktop, CaptureChain::new(backends), options)
    }

    /// Bind to a window. A missing window is not an error: the source waits for it.
    pub fn bind_to_window(&self, query: WindowQuery) -> Result<BoundState> {
        let shared = &self.shared;
        let mut state = shared.lock_state();
        if state.lifecycle == Lifecycle::Disposed {
            bail!("frame source is disposed");
        }
        let now = Instant::now();
        state.query = Some(query.clone());
        state.liveness.reset(now);

        match shared.windows.find_window(&query) {
            Some(window) => {
                shared.attach(&mut state, ResolvedTarget::Window(window.clone()))?;
                log::info!(
                    "FrameSource: bound to window '{}' ({}x{})",
                    window.title,
                    window.width,
                    window.height
                );
                state.target = CaptureTargetState::BoundToWindow(window.clone());
                Ok(BoundState::Window(window))
            }
            None => {
                shared.lock_chain().detach();
                log::info!("FrameSource: no window matching {}, waiting", query);
                state.target = CaptureTargetState::WaitingForWindow(query.clone());
                Ok(BoundState::Waiting(query))
            }
        }
    }

    /// Bind to a monitor by index. An unknown index falls back to the primary monitor.
    pub fn bind_to_monitor(&self, index: usize) -> Result<BoundState> {
        let shared = &self.shared;
        let monitors = shared.windows.monitors();
        let monitor = match monitors.iter().find(|m| m.index == index) {
            Some(monitor) => monitor.clone(),
            None => {
                let fallback = monitors
                    .iter()
                    .find(|m| m.primary)
                    .or_else(|| monitors.first())
                    .cloned()
                    .ok_or_else(|| anyhow!("no monitors available"))?;
                log::warn!(
                    "FrameSource: monitor {} not found, using primary monitor {}",
                    index,
                    fallback.index
                );
                fallback
            }
        };

        let mut state = shared.lock_state();
        if state.lifecycle == Lifecycle::Disposed {
            bail!("frame source is disposed");
        }
        shared.attach(&mut state, ResolvedTarget::Monitor(monitor.clone()))?;
        log::info!("FrameSource: bound to monitor {} '{}'", monitor.index, monitor.name);
        state.target = CaptureTargetState::BoundToMonitor(monitor.clone());
        state.query = None;
        state.liveness.reset(Instant::now());
        Ok(BoundState::Monitor(monitor))
    }

    /// Start the capture loop. Starting a running source is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut worker = self
            .worker
            .lock()
            .map_err(|_| anyhow!("frame source worker lock poisoned"))?;
        {
            let mut state = self.shared.lock_state();
            match state.lifecycle {
                Lifecycle::Disposed => bail!("frame source is disposed"),
                Lifecycle::Running => return Ok(()),
                Lifecycle::Uninitialized | Lifecycle::Stopped => {}
            }
            if state.target == CaptureTargetState::Unbound {
                bail!("bind a window or monitor before starting capture");
            }
            state.lifecycle = Lifecycle::Running;
            state.liveness.reset(Instant::now());
        }

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("frame-source".to_string())
            .spawn(move || capture_loop(shared))
            .context("failed to spawn capture thread");
        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.shared.lock_state().lifecycle = Lifecycle::Stopped;
                Err(err)
            }
        }
    }

    /// Stop the capture loop and wait for its current iteration to finish.
    ///
    /// No frame is produced after this returns.
    pub fn stop(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        {
            let mut state = self.shared.lock_state();
            if state.lifecycle == Lifecycle::Running {
                state.lifecycle = Lifecycle::Stopped;
            }
        }
        self.shared.wake.notify_all();
        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                log::error!("FrameSource: capture thread panicked");
            }
        }
    }

    /// Stop and release the capture target. Terminal.
    pub fn dispose(&self) {
        self.stop();
        let mut state = self.shared.lock_state();
        if state.lifecycle == Lifecycle::Disposed {
            return;
        }
        state.lifecycle = Lifecycle::Disposed;
        self.shared.lock_chain().detach();
        self.shared.slot.clear();
    }

    /// Capture one frame now, outside the periodic loop.
    ///
    /// While an overlay is active the grab reads the target surface directly so
    /// the overlay is not captured. Returns `None` when nothing is bound or the
    /// grab fails.
    pub fn capture_one_shot(&self) -> Option<Frame> {
        let started = Instant::now();
        {
            let state = self.shared.lock_state();
            if state.lifecycle == Lifecycle::Disposed || !state.target.is_bound() {
                return None;
            }
        }
        let mode = if self.shared.overlay_active.load(Ordering::SeqCst) {
            CaptureMode::Direct
        } else {
            CaptureMode::Composited
        };
        let grabbed = self.shared.lock_chain().grab(mode);
        match grabbed.and_then(|raw| self.shared.make_frame(raw, started)) {
            Ok(frame) => Some(frame),
            Err(err) => {
                log::warn!("FrameSource: one-shot capture failed: {:#}", err);
                None
            }
        }
    }

    /// Tell the source whether an overlay is currently drawn over the target.
    pub fn set_overlay_active(&self, active: bool) {
        self.shared.overlay_active.store(active, Ordering::SeqCst);
    }

    /// Captured frames in capture order. A subscriber that falls more than
    /// `FRAME_QUEUE_DEPTH` frames behind misses frames instead of queueing them.
    pub fn on_frame(&self) -> &EventHub<Frame> {
        &self.shared.frames
    }

    /// Target lost/found notifications.
    pub fn target_events(&self) -> &EventHub<TargetEvent> {
        &self.shared.targets
    }

    pub fn latest_frame(&self) -> Option<Frame> {
        self.shared.slot.latest()
    }

    pub fn target_state(&self) -> CaptureTargetState {
        self.shared.lock_state().target.clone()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.lock_state().lifecycle
    }

    pub fn interval(&self) -> Duration {
        self.shared.interval
    }

    pub fn stats(&self) -> FrameSourceStats {
        let target = self.target_state();
        FrameSourceStats {
            frames_captured: self.shared.frames_captured.load(Ordering::Relaxed),
            frames_dropped: self.shared.frames_dropped.load(Ordering::Relaxed),
            frames_undelivered: self.shared.frames.dropped(),
            backend: self.shared.lock_chain().active_backend(),
            target,
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.dispose();
    }
}

// ----------------------------------------------------------------------------
// Capture loop
// ----------------------------------------------------------------------------

fn capture_loop(shared: Arc<Shared>) {
    log::info!(
        "FrameSource: capture loop started ({} ms interval)",
        shared.interval.as_millis()
    );
    loop {
        let tick_started = Instant::now();
        shared.tick(tick_started);

        let deadline = tick_started + shared.interval;
        let state = shared.lock_state();
        let remaining = deadline.saturating_duration_since(Instant::now());
        let (state, _) = shared
            .wake
            .wait_timeout_while(state, remaining, |s| s.lifecycle == Lifecycle::Running)
            .unwrap_or_else(|e| e.into_inner());
        if state.lifecycle != Lifecycle::Running {
            break;
        }
    }
    log::info!("FrameSource: capture loop stopped");
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_chain(&self) -> MutexGuard<'_, CaptureChain> {
        self.chain.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tick(&self, now: Instant) {
        let capture = {
            let mut state = self.lock_state();
            if state.lifecycle != Lifecycle::Running {
                return;
            }
            self.supervise(&mut state, now)
        };
        if capture {
            self.capture_frame(now);
        }
    }

    /// Run due liveness work. Returns whether this tick should capture.
    fn supervise(&self, state: &mut SourceState, now: Instant) -> bool {
        match state.target.clone() {
            CaptureTargetState::BoundToWindow(bound) => {
                let Some(reason) = state.liveness.check_due(now) else {
                    return true;
                };
                state.liveness.mark_checked(now);
                let query = state
                    .query
                    .clone()
                    .unwrap_or(WindowQuery::Handle(bound.id));
                match verify_window(self.windows.as_ref(), &query, &bound) {
                    WindowCheck::Alive(current) => {
                        if reason == CheckReason::Stalled {
                            log::debug!(
                                "FrameSource: no frames for a while but '{}' is still alive",
                                current.title
                            );
                        }
                        state.target = CaptureTargetState::BoundToWindow(current);
                        true
                    }
                    WindowCheck::Gone(why) => {
                        self.enter_waiting(state, query, why, now);
                        false
                    }
                }
            }
            CaptureTargetState::BoundToMonitor(_) => true,
            CaptureTargetState::WaitingForWindow(query) => {
                if state.liveness.check_due(now).is_none() {
                    return false;
                }
                state.liveness.mark_checked(now);
                match self.windows.find_window(&query) {
                    Some(window) => self.rebind(state, window, now),
                    None => false,
                }
            }
            CaptureTargetState::Unbound | CaptureTargetState::Lost(_) => false,
        }
    }

    fn attach(&self, state: &mut SourceState, target: ResolvedTarget) -> Result<()> {
        let attached = self.lock_chain().attach(&target);
        match attached {
            Ok(_) => Ok(()),
            Err(err) => {
                let reason = format!("{:#}", err);
                log::error!("FrameSource: {}", reason);
                state.target = CaptureTargetState::Lost(reason.clone());
                self.targets.publish(TargetEvent::CaptureFailed { reason });
                Err(err)
            }
        }
    }

    fn rebind(&self, state: &mut SourceState, window: WindowInfo, now: Instant) -> bool {
        if self
            .attach(state, ResolvedTarget::Window(window.clone()))
            .is_err()
        {
            return false;
        }
        log::info!("FrameSource: target found, window '{}'", window.title);
        state.target = CaptureTargetState::BoundToWindow(window.clone());
        state.liveness.reset(now);
        self.targets
            .publish(TargetEvent::Found(ResolvedTarget::Window(window)));
        true
    }

    fn enter_waiting(&self, state: &mut SourceState, query: WindowQuery, reason: String, now: Instant) {
        log::warn!("FrameSource: target lost ({}), waiting for {}", reason, query);
        self.lock_chain().detach();
        self.slot.clear();
        state.target = CaptureTargetState::WaitingForWindow(query);
        state.liveness.reset(now);
        self.targets.publish(TargetEvent::Lost { reason });
    }

    fn capture_frame(&self, started: Instant) {
        let grabbed = self.lock_chain().grab(CaptureMode::Composited);
        match grabbed.and_then(|raw| self.make_frame(raw, started)) {
            Ok(frame) => {
                self.slot.store(frame.clone());
                self.frames.publish(frame);
                self.frames_captured.fetch_add(1, Ordering::Relaxed);
                self.lock_state().liveness.note_frame(Instant::now());
            }
            Err(err) => {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("FrameSource: frame dropped: {:#}", err);
                let exhausted = self.lock_chain().is_exhausted();
                if exhausted {
                    self.handle_exhausted(format!("{:#}", err));
                }
            }
        }
    }

    /// Every backend failed. A vanished window goes back to waiting; anything
    /// else is a total capture failure.
    fn handle_exhausted(&self, reason: String) {
        let mut state = self.lock_state();
        let now = Instant::now();
        if let CaptureTargetState::BoundToWindow(bound) = state.target.clone() {
            let query = state
                .query
                .clone()
                .unwrap_or(WindowQuery::Handle(bound.id));
            if let WindowCheck::Gone(why) = verify_window(self.windows.as_ref(), &query, &bound) {
                self.enter_waiting(&mut state, query, why, now);
                return;
            }
        }
        if !state.target.is_bound() {
            return;
        }
        log::error!("FrameSource: capture failed on every backend: {}", reason);
        self.lock_chain().detach();
        self.slot.clear();
        state.target = CaptureTargetState::Lost(reason.clone());
        self.targets.publish(TargetEvent::CaptureFailed { reason });
    }

    fn make_frame(&self, raw: RawCapture, started: Instant) -> Result<Frame> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        Frame::new(
            raw.pixels,
            raw.format,
            raw.width,
            raw.height,
            raw.stride,
            sequence,
            started,
        )
    }
}
