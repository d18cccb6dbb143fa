//! Capture session wiring.
//!
//! Frames from the `FrameSource` are handed to the rayon pool, at most one
//! task at a time. The task runs the `InferenceEngine`, publishes the overlay
//! update and feeds the `DetectionCoordinator`. A frame that arrives while the
//! previous one is still being processed is skipped, never queued, and the
//! overlay is told to clear.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::capture::backends::{SyntheticDesktop, STUB_PREFIX};
use crate::capture::{BoundState, FrameSource, FrameSourceStats, TargetEvent, WindowQuery};
use crate::config::ProfileConfig;
use crate::coordinator::{CoordinatorStats, DetectionCoordinator, Tier};
use crate::detect::{
    Detection, EngineStats, InferenceEngine, LoaderRegistry, ModelInfo, DEFAULT_DISPOSE_TIMEOUT,
};
use crate::events::{EventHub, SubscriptionId};
use crate::frame::Frame;

const DEFAULT_OVERLAY_CONFIDENCE: f32 = 0.25;
const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// User-visible session status.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineStatus {
    Stopped,
    LoadingModel,
    WaitingForTarget,
    Running,
    Error(String),
}

impl PipelineStatus {
    /// Running or waiting for the target to appear.
    pub fn is_active(&self) -> bool {
        matches!(self, PipelineStatus::Running | PipelineStatus::WaitingForTarget)
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStatus::Stopped => f.write_str("stopped"),
            PipelineStatus::LoadingModel => f.write_str("loading model"),
            PipelineStatus::WaitingForTarget => f.write_str("waiting for target"),
            PipelineStatus::Running => f.write_str("running"),
            PipelineStatus::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

/// What the overlay renderer should show.
#[derive(Clone, Debug, PartialEq)]
pub enum OverlayUpdate {
    Detections {
        sequence: u64,
        detections: Vec<Detection>,
    },
    /// Inference skipped this frame or the target went away; drop stale boxes.
    Clear,
}

#[derive(Clone, Debug)]
pub enum CaptureTarget {
    Window(WindowQuery),
    Monitor(usize),
}

#[derive(Clone, Debug)]
pub struct PipelineOptions {
    pub model_path: PathBuf,
    pub labels_path: Option<PathBuf>,
    pub prefer_accelerated: bool,
    pub target: CaptureTarget,
    pub overlay_confidence: f32,
    pub health_interval: Duration,
    /// How long `stop` waits for the frame being processed.
    pub stop_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            labels_path: None,
            prefer_accelerated: true,
            target: CaptureTarget::Monitor(0),
            overlay_confidence: DEFAULT_OVERLAY_CONFIDENCE,
            health_interval: DEFAULT_HEALTH_INTERVAL,
            stop_timeout: DEFAULT_DISPOSE_TIMEOUT,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineStats {
    pub status: PipelineStatus,
    pub capture: FrameSourceStats,
    pub inference: EngineStats,
    pub coordinator: CoordinatorStats,
    pub frames_processed: u64,
    /// Frames dropped because the previous frame was still being processed.
    pub frames_skipped: u64,
}

struct StatusCell {
    current: Mutex<PipelineStatus>,
    hub: EventHub<PipelineStatus>,
}

impl StatusCell {
    fn get(&self) -> PipelineStatus {
        self.lock().clone()
    }

    fn set(&self, status: PipelineStatus) {
        let mut current = self.lock();
        if *current == status {
            return;
        }
        log::info!("Pipeline: status {} -> {}", *current, status);
        *current = status.clone();
        self.hub.publish(status);
    }

    /// Apply a target transition, only while the session is active.
    fn set_if_active(&self, status: PipelineStatus) {
        let mut current = self.lock();
        if !current.is_active() || *current == status {
            return;
        }
        log::info!("Pipeline: status {} -> {}", *current, status);
        *current = status.clone();
        self.hub.publish(status);
    }

    fn lock(&self) -> MutexGuard<'_, PipelineStatus> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ----------------------------------------------------------------------------
// Dispatch: single-flight gate in front of the per-frame task
// ----------------------------------------------------------------------------

struct DispatchState {
    accepting: bool,
    in_flight: bool,
}

enum Admission {
    Admitted,
    Busy,
    Closed,
}

struct Dispatch {
    state: Mutex<DispatchState>,
    idle: Condvar,
}

impl Dispatch {
    fn new() -> Self {
        Self {
            state: Mutex::new(DispatchState {
                accepting: false,
                in_flight: false,
            }),
            idle: Condvar::new(),
        }
    }

    fn open(&self) {
        self.lock().accepting = true;
    }

    fn admit(&self) -> Admission {
        let mut state = self.lock();
        if !state.accepting {
            Admission::Closed
        } else if state.in_flight {
            Admission::Busy
        } else {
            state.in_flight = true;
            Admission::Admitted
        }
    }

    fn is_accepting(&self) -> bool {
        self.lock().accepting
    }

    fn finish(&self) {
        self.lock().in_flight = false;
        self.idle.notify_all();
    }

    /// Refuse new frames and wait up to `timeout` for the admitted one.
    /// Returns false if it was still running at the deadline.
    fn close(&self, timeout: Duration) -> bool {
        let mut state = self.lock();
        state.accepting = false;
        let (state, _) = self
            .idle
            .wait_timeout_while(state, timeout, |s| s.in_flight)
            .unwrap_or_else(|e| e.into_inner());
        !state.in_flight
    }

    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Releases the dispatch slot when the frame task ends, however it ends.
struct InFlight<'a>(&'a Dispatch);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// Per-frame work shared with the rayon tasks.
struct Session {
    engine: InferenceEngine,
    coordinator: DetectionCoordinator,
    overlay: EventHub<OverlayUpdate>,
    dispatch: Dispatch,
    overlay_confidence: f32,
    coordinator_confidence: f32,
    detect_confidence: f32,
    processed: AtomicU64,
    skipped: AtomicU64,
    health_interval: Duration,
    last_health: Mutex<Instant>,
}

impl Session {
    fn dispatch(session: &Arc<Session>, frame: Frame) {
        match session.dispatch.admit() {
            Admission::Admitted => {
                let session = session.clone();
                rayon::spawn(move || {
                    let _slot = InFlight(&session.dispatch);
                    session.process_frame(frame);
                });
            }
            Admission::Busy => {
                session.skipped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Pipeline: frame {} skipped, worker busy", frame.sequence());
                session.overlay.publish(OverlayUpdate::Clear);
            }
            Admission::Closed => {}
        }
    }

    fn process_frame(&self, frame: Frame) {
        let detections = self.engine.detect(&frame, self.detect_confidence);
        // Stopped while inferring: the result belongs to a finished session.
        if !self.dispatch.is_accepting() {
            return;
        }
        let Some(detections) = detections else {
            self.overlay.publish(OverlayUpdate::Clear);
            return;
        };

        let overlay: Vec<Detection> = detections
            .iter()
            .filter(|d| d.confidence >= self.overlay_confidence)
            .cloned()
            .collect();
        self.overlay.publish(OverlayUpdate::Detections {
            sequence: frame.sequence(),
            detections: overlay,
        });

        let coordinated: Vec<Detection> = detections
            .into_iter()
            .filter(|d| d.confidence >= self.coordinator_confidence)
            .collect();
        self.coordinator.process(coordinated);

        let processed = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
        self.maybe_log_health(processed);
    }

    fn maybe_log_health(&self, processed: u64) {
        let mut last = self.last_health.lock().unwrap_or_else(|e| e.into_inner());
        if last.elapsed() < self.health_interval {
            return;
        }
        *last = Instant::now();
        let engine = self.engine.stats();
        log::info!(
            "Pipeline: health: {} frames processed, {} inferences ({} skipped, {} failed)",
            processed,
            engine.runs,
            engine.skipped,
            engine.failed
        );
    }
}

/// A capture → inference → coordination session.
pub struct Pipeline {
    source: FrameSource,
    session: Arc<Session>,
    status: Arc<StatusCell>,
    options: PipelineOptions,
    subscriptions: Mutex<Option<(SubscriptionId, SubscriptionId)>>,
}

impl Pipeline {
    pub fn new(
        source: FrameSource,
        engine: InferenceEngine,
        coordinator: DetectionCoordinator,
        options: PipelineOptions,
    ) -> Self {
        let auto = coordinator.config().auto_confidence;
        let manual = coordinator.config().manual_confidence;
        let coordinator_confidence = auto.min(manual);
        let detect_confidence = coordinator_confidence.min(options.overlay_confidence);

        Self {
            source,
            session: Arc::new(Session {
                engine,
                coordinator,
                overlay: EventHub::new("overlay"),
                dispatch: Dispatch::new(),
                overlay_confidence: options.overlay_confidence,
                coordinator_confidence,
                detect_confidence,
                processed: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
                health_interval: options.health_interval,
                last_health: Mutex::new(Instant::now()),
            }),
            status: Arc::new(StatusCell {
                current: Mutex::new(PipelineStatus::Stopped),
                hub: EventHub::new("status"),
            }),
            options,
            subscriptions: Mutex::new(None),
        }
    }

    /// Build a session for a profile.
    ///
    /// `stub://` window titles run against a synthetic desktop with that window
    /// already open; anything else needs the `capture-xcap` feature.
    pub fn from_profile(profile: &ProfileConfig) -> Result<Self> {
        let source = match &profile.capture.window_title {
            Some(title) if title.starts_with(STUB_PREFIX) => {
                let desktop = Arc::new(SyntheticDesktop::new());
                desktop.open_window(title, 1280, 720);
                FrameSource::synthetic(desktop, profile.frame_source_options())
            }
            _ => desktop_frame_source(profile)?,
        };
        let engine = InferenceEngine::new(LoaderRegistry::with_default_loaders());
        let coordinator = DetectionCoordinator::new(profile.coordinator_config());
        Ok(Self::new(
            source,
            engine,
            coordinator,
            profile.pipeline_options(),
        ))
    }

    /// Load the model, bind the target and start capturing.
    ///
    /// A model-load or bind failure leaves the status at `Error` and is returned.
    pub fn start(&self) -> Result<()> {
        if self.status.get().is_active() {
            return Ok(());
        }
        self.status.set(PipelineStatus::LoadingModel);

        let started = self.load_model().and_then(|info| {
            log::info!(
                "Pipeline: model ready ({} labels, {:?})",
                info.labels.len(),
                info.execution
            );
            self.bind_target()
        });
        let bound = match started {
            Ok(bound) => bound,
            Err(err) => {
                self.status
                    .set(PipelineStatus::Error(format!("{:#}", err)));
                return Err(err);
            }
        };

        self.session.dispatch.open();
        self.subscribe();
        // Target events only apply to an active status, so set it before capture starts.
        self.status.set(match bound {
            BoundState::Waiting(_) => PipelineStatus::WaitingForTarget,
            BoundState::Window(_) | BoundState::Monitor(_) => PipelineStatus::Running,
        });
        if let Err(err) = self.source.start() {
            self.session.dispatch.close(Duration::ZERO);
            self.unsubscribe();
            self.status
                .set(PipelineStatus::Error(format!("{:#}", err)));
            return Err(err.context("failed to start capture"));
        }
        Ok(())
    }

    /// Stop capturing. The model stays loaded for a later `start`.
    ///
    /// Waits (up to `stop_timeout`) for the frame being processed; after this
    /// returns no overlay update or coordinator input comes from the old session.
    pub fn stop(&self) {
        if !self.session.dispatch.close(self.options.stop_timeout) {
            log::warn!(
                "Pipeline: frame still processing after {:?}; its result will be discarded",
                self.options.stop_timeout
            );
        }
        self.source.stop();
        self.unsubscribe();
        self.session.coordinator.reset();
        self.session.overlay.publish(OverlayUpdate::Clear);
        self.status.set(PipelineStatus::Stopped);
    }

    /// Stop and release the capture target and the model.
    pub fn shutdown(&self) {
        self.stop();
        self.source.dispose();
        self.session.engine.dispose();
    }

    /// Best detection in `tier` right now, at the manual threshold.
    pub fn query(&self, tier: Tier) -> Option<Detection> {
        self.session.coordinator.highest_priority(tier)
    }

    pub fn status(&self) -> PipelineStatus {
        self.status.get()
    }

    pub fn on_status(&self) -> &EventHub<PipelineStatus> {
        &self.status.hub
    }

    pub fn on_overlay(&self) -> &EventHub<OverlayUpdate> {
        &self.session.overlay
    }

    pub fn source(&self) -> &FrameSource {
        &self.source
    }

    pub fn engine(&self) -> &InferenceEngine {
        &self.session.engine
    }

    pub fn coordinator(&self) -> &DetectionCoordinator {
        &self.session.coordinator
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            status: self.status.get(),
            capture: self.source.stats(),
            inference: self.session.engine.stats(),
            coordinator: self.session.coordinator.stats(),
            frames_processed: self.session.processed.load(Ordering::Relaxed),
            frames_skipped: self.session.skipped.load(Ordering::Relaxed),
        }
    }

    fn load_model(&self) -> Result<ModelInfo> {
        self.session
            .engine
            .load_with_labels(
                &self.options.model_path,
                self.options.labels_path.as_deref(),
                self.options.prefer_accelerated,
            )
            .with_context(|| format!("failed to load model {}", self.options.model_path.display()))
    }

    fn bind_target(&self) -> Result<BoundState> {
        match &self.options.target {
            CaptureTarget::Window(query) => self.source.bind_to_window(query.clone()),
            CaptureTarget::Monitor(index) => self.source.bind_to_monitor(*index),
        }
    }

    fn subscribe(&self) {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if subscriptions.is_some() {
            return;
        }

        let session = self.session.clone();
        let frames = self
            .source
            .on_frame()
            .subscribe(move |frame: Frame| Session::dispatch(&session, frame));

        let status = self.status.clone();
        let session = self.session.clone();
        let targets = self.source.target_events().subscribe(move |event: TargetEvent| {
            match event {
                TargetEvent::Found(target) => {
                    log::info!("Pipeline: target found: {}", target);
                    status.set_if_active(PipelineStatus::Running);
                }
                TargetEvent::Lost { reason } => {
                    log::warn!("Pipeline: target lost: {}", reason);
                    if session.dispatch.is_accepting() {
                        session.overlay.publish(OverlayUpdate::Clear);
                    }
                    status.set_if_active(PipelineStatus::WaitingForTarget);
                }
                TargetEvent::CaptureFailed { reason } => {
                    if session.dispatch.is_accepting() {
                        session.overlay.publish(OverlayUpdate::Clear);
                    }
                    status.set_if_active(PipelineStatus::Error(reason));
                }
            }
        });
        *subscriptions = Some((frames, targets));
    }

    fn unsubscribe(&self) {
        let taken = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some((frames, targets)) = taken {
            self.source.on_frame().unsubscribe(frames);
            self.source.target_events().unsubscribe(targets);
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(feature = "capture-xcap")]
fn desktop_frame_source(profile: &ProfileConfig) -> Result<FrameSource> {
    use crate::capture::backends::{XcapBackend, XcapWindows};
    use crate::capture::{CaptureBackend, CaptureChain};

    let backends: Vec<Box<dyn CaptureBackend>> = vec![Box::new(XcapBackend::new())];
    Ok(FrameSource::new(
        Arc::new(XcapWindows),
        CaptureChain::new(backends),
        profile.frame_source_options(),
    ))
}

#[cfg(not(feature = "capture-xcap"))]
fn desktop_frame_source(profile: &ProfileConfig) -> Result<FrameSource> {
    match &profile.capture.window_title {
        Some(title) => anyhow::bail!(
            "capturing window '{}' requires the capture-xcap feature (or a {} title)",
            title,
            STUB_PREFIX
        ),
        None => Err(anyhow::anyhow!(
            "capturing monitor {} requires the capture-xcap feature",
            profile.capture.monitor_index
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_are_published_once() -> Result<()> {
        let cell = StatusCell {
            current: Mutex::new(PipelineStatus::Stopped),
            hub: EventHub::new("status"),
        };
        let (_id, rx) = cell.hub.subscribe_channel();
        cell.set(PipelineStatus::LoadingModel);
        cell.set(PipelineStatus::LoadingModel);
        cell.set(PipelineStatus::Running);
        assert_eq!(rx.try_recv()?, PipelineStatus::LoadingModel);
        assert_eq!(rx.try_recv()?, PipelineStatus::Running);
        assert!(rx.try_recv().is_err());
        Ok(())
    }

    #[test]
    fn target_transitions_ignored_when_stopped() {
        let cell = StatusCell {
            current: Mutex::new(PipelineStatus::Stopped),
            hub: EventHub::new("status"),
        };
        cell.set_if_active(PipelineStatus::Running);
        assert_eq!(cell.get(), PipelineStatus::Stopped);

        cell.set(PipelineStatus::WaitingForTarget);
        cell.set_if_active(PipelineStatus::Running);
        assert_eq!(cell.get(), PipelineStatus::Running);
    }

    #[test]
    fn status_display() {
        assert_eq!(PipelineStatus::WaitingForTarget.to_string(), "waiting for target");
        assert_eq!(
            PipelineStatus::Error("no model".into()).to_string(),
            "error: no model"
        );
    }
}
