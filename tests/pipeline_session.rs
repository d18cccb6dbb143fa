use anyhow::{anyhow, Result};
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use sightline::capture::backends::SyntheticDesktop;
use sightline::capture::{FrameSource, FrameSourceOptions, WindowQuery, MIN_CAPTURE_INTERVAL};
use sightline::coordinator::{CoordinatorConfig, DetectionCoordinator, LabelTiers, Tier};
use sightline::detect::{InferenceEngine, LoaderRegistry, StubBackend, StubLoader};
use sightline::pipeline::{CaptureTarget, OverlayUpdate, Pipeline, PipelineOptions, PipelineStatus};

const WAIT: Duration = Duration::from_secs(3);

fn model_dir(labels: &[&str]) -> Result<TempDir> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("model.onnx"), b"stub")?;
    std::fs::write(dir.path().join("model.txt"), labels.join("\n"))?;
    Ok(dir)
}

fn source(desktop: Arc<SyntheticDesktop>) -> FrameSource {
    FrameSource::synthetic(
        desktop,
        FrameSourceOptions {
            interval: MIN_CAPTURE_INTERVAL,
            liveness_interval: Duration::from_millis(60),
            stall_threshold: Duration::from_millis(150),
        },
    )
}

fn registry(backend: StubBackend) -> LoaderRegistry {
    let mut registry = LoaderRegistry::new();
    registry.register(StubLoader::new(backend));
    registry
}

fn coordinator() -> DetectionCoordinator {
    let tiers = LabelTiers::new(vec!["door"], vec!["item"], vec!["chest"]);
    DetectionCoordinator::new(
        CoordinatorConfig::new(tiers)
            .with_cooldown(Duration::ZERO)
            .with_thresholds(0.5, 0.3),
    )
}

fn options(model: &Path) -> PipelineOptions {
    PipelineOptions {
        model_path: model.join("model.onnx"),
        target: CaptureTarget::Window(WindowQuery::Title("stub://game".into())),
        ..PipelineOptions::default()
    }
}

/// Door and item in a 100x100 model space.
fn door_and_item() -> StubBackend {
    StubBackend::new(100, 100, 3, 8)
        .with_candidate(30.0, 30.0, 40.0, 40.0, 0, 0.9)
        .with_candidate(70.0, 70.0, 20.0, 20.0, 1, 0.6)
}

fn wait_for_status(rx: &Receiver<PipelineStatus>, wanted: &PipelineStatus) -> Result<()> {
    let deadline = Instant::now() + WAIT;
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        if rx.recv_timeout(left)? == *wanted {
            return Ok(());
        }
    }
    Err(anyhow!("status {} never reached", wanted))
}

#[test]
fn frames_flow_through_to_tiers_and_overlay() -> Result<()> {
    let dir = model_dir(&["door", "item", "chest"])?;
    let desktop = Arc::new(SyntheticDesktop::new());
    desktop.open_window("stub://game", 200, 100);

    let pipeline = Pipeline::new(
        source(desktop),
        InferenceEngine::new(registry(door_and_item())),
        coordinator(),
        options(dir.path()),
    );
    let (_o, overlay) = pipeline.on_overlay().subscribe_channel();
    let (_c, changes) = pipeline.coordinator().on_primary_changed().subscribe_channel();

    pipeline.start()?;
    assert_eq!(pipeline.status(), PipelineStatus::Running);

    let change = changes.recv_timeout(WAIT)?;
    assert_eq!(change.labels, vec!["door".to_string()]);
    assert_eq!(change.detections[0].bbox.x1, 20.0);

    let deadline = Instant::now() + WAIT;
    let boxes = loop {
        match overlay.recv_timeout(WAIT)? {
            OverlayUpdate::Detections { detections, .. } => break detections,
            OverlayUpdate::Clear if Instant::now() < deadline => continue,
            OverlayUpdate::Clear => return Err(anyhow!("overlay never received detections")),
        }
    };
    let labels: Vec<&str> = boxes.iter().map(|d| d.label.as_str()).collect();
    assert_eq!(labels, vec!["door", "item"]);

    assert_eq!(
        pipeline.query(Tier::Secondary).map(|d| d.label),
        Some("item".to_string())
    );
    assert!(pipeline.query(Tier::Tertiary).is_none());

    pipeline.stop();
    assert_eq!(pipeline.status(), PipelineStatus::Stopped);
    let stats = pipeline.stats();
    assert!(stats.frames_processed >= 1);
    assert!(stats.inference.runs >= 1);
    Ok(())
}

#[test]
fn waits_for_window_then_runs() -> Result<()> {
    let dir = model_dir(&["door"])?;
    let desktop = Arc::new(SyntheticDesktop::new());
    let pipeline = Pipeline::new(
        source(desktop.clone()),
        InferenceEngine::new(registry(door_and_item())),
        coordinator(),
        options(dir.path()),
    );
    let (_s, statuses) = pipeline.on_status().subscribe_channel();

    pipeline.start()?;
    assert_eq!(pipeline.status(), PipelineStatus::WaitingForTarget);

    desktop.open_window("stub://game", 200, 100);
    wait_for_status(&statuses, &PipelineStatus::Running)?;
    pipeline.stop();
    Ok(())
}

#[test]
fn status_is_waiting_before_capture_reports_the_target() -> Result<()> {
    let dir = model_dir(&["door"])?;
    let desktop = Arc::new(SyntheticDesktop::new());
    let pipeline = Pipeline::new(
        source(desktop.clone()),
        InferenceEngine::new(registry(door_and_item())),
        coordinator(),
        options(dir.path()),
    );
    let (_s, statuses) = pipeline.on_status().subscribe_channel();

    pipeline.start()?;
    desktop.open_window("stub://game", 200, 100);

    let mut seen = Vec::new();
    while seen.last() != Some(&PipelineStatus::Running) {
        seen.push(statuses.recv_timeout(WAIT)?);
    }
    pipeline.stop();

    assert_eq!(
        seen,
        vec![
            PipelineStatus::LoadingModel,
            PipelineStatus::WaitingForTarget,
            PipelineStatus::Running,
        ]
    );
    Ok(())
}

#[test]
fn model_load_failure_is_an_error_status() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let desktop = Arc::new(SyntheticDesktop::new());
    desktop.open_window("stub://game", 64, 64);
    let pipeline = Pipeline::new(
        source(desktop),
        InferenceEngine::new(registry(door_and_item())),
        coordinator(),
        options(dir.path()),
    );

    assert!(pipeline.start().is_err());
    assert!(matches!(pipeline.status(), PipelineStatus::Error(_)));
    assert_eq!(pipeline.stats().capture.frames_captured, 0);
    Ok(())
}

#[test]
fn busy_engine_skips_frames_and_clears_overlay() -> Result<()> {
    let dir = model_dir(&["door", "item", "chest"])?;
    let desktop = Arc::new(SyntheticDesktop::new());
    desktop.open_window("stub://game", 64, 64);
    let slow = door_and_item().with_delay(Duration::from_millis(120));
    let pipeline = Pipeline::new(
        source(desktop),
        InferenceEngine::new(registry(slow)),
        coordinator(),
        options(dir.path()),
    );
    let (_o, overlay) = pipeline.on_overlay().subscribe_channel();

    pipeline.start()?;
    let deadline = Instant::now() + WAIT;
    let mut cleared = false;
    while Instant::now() < deadline {
        if overlay.recv_timeout(WAIT)? == OverlayUpdate::Clear {
            cleared = true;
            break;
        }
    }
    pipeline.stop();

    assert!(cleared, "no skipped frame cleared the overlay");
    assert!(pipeline.stats().frames_skipped >= 1);
    Ok(())
}

#[test]
fn target_loss_moves_status_back_to_waiting() -> Result<()> {
    let dir = model_dir(&["door"])?;
    let desktop = Arc::new(SyntheticDesktop::new());
    let id = desktop.open_window("stub://game", 64, 64);
    let pipeline = Pipeline::new(
        source(desktop.clone()),
        InferenceEngine::new(registry(door_and_item())),
        coordinator(),
        options(dir.path()),
    );
    let (_s, statuses) = pipeline.on_status().subscribe_channel();
    pipeline.start()?;

    desktop.close_window(id);
    wait_for_status(&statuses, &PipelineStatus::WaitingForTarget)?;
    desktop.open_window("stub://game", 64, 64);
    wait_for_status(&statuses, &PipelineStatus::Running)?;
    pipeline.shutdown();
    assert_eq!(pipeline.status(), PipelineStatus::Stopped);
    Ok(())
}

#[test]
fn nothing_is_published_after_stop_returns() -> Result<()> {
    let dir = model_dir(&["door", "item", "chest"])?;
    let desktop = Arc::new(SyntheticDesktop::new());
    desktop.open_window("stub://game", 64, 64);
    let slow = door_and_item().with_delay(Duration::from_millis(60));
    let pipeline = Pipeline::new(
        source(desktop),
        InferenceEngine::new(registry(slow)),
        coordinator(),
        options(dir.path()),
    );
    let (_o, overlay) = pipeline.on_overlay().subscribe_channel();
    let (_c, changes) = pipeline.coordinator().on_primary_changed().subscribe_channel();

    pipeline.start()?;
    changes.recv_timeout(WAIT)?;
    pipeline.stop();

    let after_stop: Vec<OverlayUpdate> = overlay.try_iter().collect();
    assert_eq!(after_stop.last(), Some(&OverlayUpdate::Clear));
    assert!(pipeline.coordinator().current().primary.is_empty());
    let processed = pipeline.stats().frames_processed;
    let _ = changes.try_iter().count();

    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(overlay.try_iter().count(), 0);
    assert_eq!(changes.try_iter().count(), 0);
    assert_eq!(pipeline.stats().frames_processed, processed);
    assert!(pipeline.coordinator().current().primary.is_empty());
    Ok(())
}
