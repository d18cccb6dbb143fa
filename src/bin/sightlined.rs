//! sightlined - capture-to-detection daemon
//!
//! This daemon:
//! 1. Loads a game profile (file, environment, command line)
//! 2. Loads the detection model and binds the capture target
//! 3. Runs capture, inference and coordination until Ctrl-C
//! 4. Logs primary-label changes and tracked-label disappearances

use anyhow::{Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use sightline::config::ProfileOverrides;
use sightline::coordinator::Tier;
use sightline::ui::{Ui, UiMode};
use sightline::{Pipeline, ProfileConfig};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Profile file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "SIGHTLINE_CONFIG")]
    config: Option<PathBuf>,
    /// Model file, overriding the profile.
    #[arg(long)]
    model: Option<PathBuf>,
    /// Window title to capture (`stub://...` for a synthetic window).
    #[arg(long, conflicts_with = "monitor")]
    window: Option<String>,
    /// Monitor index to capture.
    #[arg(long)]
    monitor: Option<usize>,
    /// Run the model on the CPU even if acceleration is available.
    #[arg(long)]
    cpu_only: bool,
    /// Terminal output style.
    #[arg(long, value_enum, default_value_t = UiMode::Auto)]
    ui: UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = Ui::new(args.ui, std::io::stderr().is_terminal());

    let overrides = ProfileOverrides {
        model_file: args.model,
        window_title: args.window,
        monitor_index: args.monitor,
        cpu_only: args.cpu_only,
    };
    let profile = {
        let _stage = ui.stage("load profile");
        ProfileConfig::load_with_overrides(args.config.as_deref(), &overrides)?
    };
    log::info!(
        "profile: model={} target={:?} cooldown={} ms",
        profile.model_file.display(),
        profile.capture_target(),
        profile.cooldown.as_millis()
    );

    let pipeline = Pipeline::from_profile(&profile)?;
    pipeline.coordinator().on_primary_changed().subscribe(|change| {
        if change.labels.is_empty() {
            log::info!("primary cleared");
            return;
        }
        log::info!(
            "primary changed: {}",
            change
                .detections
                .iter()
                .map(|d| format!("{} ({:.2})", d.label, d.confidence))
                .collect::<Vec<_>>()
                .join(", ")
        );
    });
    pipeline.coordinator().on_label_disappeared().subscribe(|event| {
        if event.gone {
            log::info!("'{}' gone for {} frame(s)", event.label, event.frames_missing);
        } else {
            log::info!("'{}' moved to another object", event.label);
        }
    });

    {
        let stage = ui.stage("start pipeline");
        if let Err(err) = pipeline.start() {
            stage.fail(&format!("{:#}", err));
            return Err(err);
        }
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("sightlined running; Ctrl-C to stop");
    let mut status_line = ui.status_line();
    loop {
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => status_line.update(&pipeline.stats()),
        }
    }

    log::info!("shutdown signal received, stopping pipeline...");
    if let Some(best) = pipeline.query(Tier::Primary) {
        log::info!("last primary: {} ({:.2})", best.label, best.confidence);
    }
    pipeline.shutdown();
    let stats = pipeline.stats();
    status_line.finish(&format!(
        "stopped after {} captured / {} processed frames",
        stats.capture.frames_captured, stats.frames_processed
    ));
    Ok(())
}
