//! Runs on a one-thread rayon pool, so it lives in its own test binary.

use anyhow::Result;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sightline::capture::backends::SyntheticDesktop;
use sightline::capture::{FrameSource, FrameSourceOptions, WindowQuery, MIN_CAPTURE_INTERVAL};
use sightline::coordinator::{CoordinatorConfig, DetectionCoordinator, LabelTiers};
use sightline::detect::{InferenceEngine, LoaderRegistry, StubBackend, StubLoader};
use sightline::pipeline::{CaptureTarget, OverlayUpdate, Pipeline, PipelineOptions};

const INFERENCE: Duration = Duration::from_millis(150);

#[test]
fn single_worker_skips_frames_instead_of_queueing() -> Result<()> {
    rayon::ThreadPoolBuilder::new().num_threads(1).build_global()?;

    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("model.onnx"), b"stub")?;
    std::fs::write(dir.path().join("model.txt"), "door\nitem")?;

    let desktop = Arc::new(SyntheticDesktop::new());
    desktop.open_window("stub://game", 64, 64);
    let backend = StubBackend::new(100, 100, 2, 4)
        .with_candidate(30.0, 30.0, 40.0, 40.0, 0, 0.9)
        .with_delay(INFERENCE);
    let runs = backend.run_counter();
    let mut registry = LoaderRegistry::new();
    registry.register(StubLoader::new(backend));

    let pipeline = Pipeline::new(
        FrameSource::synthetic(
            desktop,
            FrameSourceOptions {
                interval: MIN_CAPTURE_INTERVAL,
                ..FrameSourceOptions::default()
            },
        ),
        InferenceEngine::new(registry),
        DetectionCoordinator::new(CoordinatorConfig::new(LabelTiers::new(
            vec!["door"],
            vec!["item"],
            vec![],
        ))),
        PipelineOptions {
            model_path: dir.path().join("model.onnx"),
            target: CaptureTarget::Window(WindowQuery::Title("stub://game".into())),
            ..PipelineOptions::default()
        },
    );
    let (_o, overlay) = pipeline.on_overlay().subscribe_channel();

    pipeline.start()?;
    let started = Instant::now();
    std::thread::sleep(Duration::from_millis(700));
    pipeline.stop();
    let elapsed = started.elapsed();

    let stats = pipeline.stats();
    let ran = runs.load(Ordering::SeqCst);
    // Each pass holds the only worker, so passes cannot outnumber the time slots.
    let slots = (elapsed.as_millis() / INFERENCE.as_millis()) as usize + 1;
    assert!(ran >= 1);
    assert!(ran <= slots, "{} passes in {:?}", ran, elapsed);
    assert!(
        stats.frames_skipped >= 3,
        "only {} frames skipped out of {} captured",
        stats.frames_skipped,
        stats.capture.frames_captured
    );

    let updates: Vec<OverlayUpdate> = overlay.try_iter().collect();
    let clears = updates.iter().filter(|u| **u == OverlayUpdate::Clear).count();
    assert!(clears >= 2, "skipped frames did not clear the overlay");

    // No backlog left behind on the pool.
    std::thread::sleep(INFERENCE * 3);
    assert_eq!(runs.load(Ordering::SeqCst), ran);
    assert_eq!(pipeline.stats().frames_processed, stats.frames_processed);
    Ok(())
}
