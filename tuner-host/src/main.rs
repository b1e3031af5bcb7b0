//! # Tuner Host - Headless Scheduler Loop
//!
//! Owns the capture stream and the analysis engine and drives them at a fixed
//! render rate. Each tick produces an owned snapshot; this host only logs it,
//! a visual front end would draw it.
//!
//! ## Architecture
//! - **Main Thread**: render loop calling `TunerEngine::tick` every frame
//! - **Audio Thread**: CPAL callback filling the capture ring and level feed
//! - **Worker Thread**: HPS pitch estimation, owned by the engine

mod report;

use anyhow::{Context, Result};
use clap::Parser;
use cpal::traits::StreamTrait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tuner_core::{audio, AudioFeed, LayoutChange, TunerConfig, TunerEngine};

/// How often the status line is logged.
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(name = "tuner-host", about = "Real-time pitch and spectrum analysis from the default microphone")]
struct Args {
    /// JSON configuration file; defaults are used for anything missing.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stop after this many seconds instead of running until interrupted
    /// (Ctrl-C).
    #[arg(long)]
    seconds: Option<f32>,

    /// Render ticks per second.
    #[arg(long, default_value_t = 60)]
    fps: u32,

    /// Reference pitch for A4 in Hz, overriding the configuration.
    #[arg(long)]
    a4: Option<f32>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TunerConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => TunerConfig::default(),
    };
    if let Some(a4) = args.a4 {
        config.hps.reference_a4 = a4;
        config.bands.reference_a4 = a4;
    }
    config.validate().context("validating configuration")?;

    let window = config.analysis.fft_size.next_power_of_two();
    let feed = Arc::new(AudioFeed::new(window));

    let interrupted = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst))
        .context("installing interrupt handler")?;

    log::info!("Attempting to start audio capture...");
    let (capture, reader) = match audio::start_audio_capture(&config.capture, window, Arc::clone(&feed)) {
        Ok(started) => started,
        Err(e) => {
            log::error!("Could not start audio capture: {}", e);
            return Err(e).context("audio capture unavailable, analysis not started");
        }
    };

    let mut engine = TunerEngine::new(&config, Box::new(reader), Arc::clone(&feed));
    engine.start().context("starting analysis worker")?;

    run_render_loop(&mut engine, &args, &interrupted);

    log::info!("Stopping analysis and capture...");
    engine.stop();
    if let Err(e) = capture.stream.pause() {
        log::warn!("Error pausing stream: {}", e);
    }
    if capture.overruns() > 0 {
        log::warn!("{} captured samples were dropped because analysis fell behind", capture.overruns());
    }
    drop(capture);
    feed.clear();
    log::info!("Finished");
    Ok(())
}

fn run_render_loop(engine: &mut TunerEngine, args: &Args, interrupted: &AtomicBool) {
    let frame_interval = Duration::from_secs_f64(1.0 / args.fps.max(1) as f64);
    let started = Instant::now();
    let deadline = args
        .seconds
        .filter(|s| s.is_finite() && *s > 0.0)
        .map(|s| started + Duration::from_secs_f32(s));
    let mut next_report = started + REPORT_INTERVAL;
    let mut next_frame = started;

    loop {
        let now = Instant::now();
        if interrupted.load(Ordering::SeqCst) {
            log::info!("Interrupted");
            break;
        }
        if deadline.is_some_and(|d| now >= d) {
            break;
        }

        let snapshot = engine.tick(now);
        if let LayoutChange::Resized { previous, current } = engine.layout_change() {
            log::info!("Display bands rebuilt: {} -> {}", previous, current);
        }

        if now >= next_report {
            log::info!("{}", report::status_line(&snapshot));
            log::debug!("{}", report::stats_line(&engine.stats()));
            next_report += REPORT_INTERVAL;
        }

        next_frame += frame_interval;
        let now = Instant::now();
        if next_frame > now {
            thread::sleep(next_frame - now);
        } else {
            // Fell behind; don't try to catch up with a burst of ticks.
            next_frame = now;
        }
    }
}
