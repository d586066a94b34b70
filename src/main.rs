// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use clap::Parser;
use edgefirst_capture::{
    pipeline::Pipeline, sensor::SensorRegistry, virtual_platform::VirtualPlatform, CaptureError,
    FrameReceiver,
};
use std::{
    error::Error,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::signal;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, Layer, Registry};

mod args;

use args::Args;

fn init_tracing(args: &Args) -> Result<(), Box<dyn Error>> {
    let level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let stdout_log = tracing_subscriber::fmt::layer()
        .pretty()
        .with_filter(level);

    let journald = if args.journald {
        match tracing_journald::layer() {
            Ok(layer) => Some(layer.with_filter(level)),
            Err(e) => {
                eprintln!("journald unavailable: {e}");
                None
            }
        }
    } else {
        None
    };

    let tracy = if args.tracy {
        tracy_client::Client::start();
        Some(tracing_tracy::TracyLayer::default().with_filter(level))
    } else {
        None
    };

    let console = if args.tokio_console {
        Some(console_subscriber::spawn())
    } else {
        None
    };

    let subscriber = Registry::default()
        .with(stdout_log)
        .with(journald)
        .with(tracy)
        .with(console);
    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;

    Ok(())
}

fn update_fps(prev: &mut Instant, history: &mut [i64], index: &mut usize) -> i64 {
    let now = Instant::now();

    let elapsed = now.duration_since(*prev);
    *prev = now;

    history[*index] = 1e9 as i64 / elapsed.as_nanos().max(1) as i64;
    *index = (*index + 1) % history.len();

    (history.iter().sum::<i64>() as f64 / history.len() as f64).round() as i64
}

/// Receives frames until `limit` is reached or `running` is cleared.
fn consume(
    frames: FrameReceiver,
    limit: Option<u64>,
    timeout: Duration,
    verbose: bool,
    running: &AtomicBool,
) -> Result<u64, CaptureError> {
    let mut prev = Instant::now();
    let mut history = vec![0; 30];
    let mut index = 0;
    let mut received = 0;

    while running.load(Ordering::Acquire) && limit.map_or(true, |limit| received < limit) {
        let now = Instant::now();
        let frame = match frames.recv(timeout) {
            Ok(frame) => frame,
            Err(CaptureError::Timeout) => {
                warn!("no frame within {:?}", timeout);
                continue;
            }
            Err(e) => return Err(e),
        };
        let capture_time = now.elapsed();
        let fps = update_fps(&mut prev, &mut history, &mut index);
        received += 1;

        if verbose {
            info!("{} capture: {:?} fps: {}", frame, capture_time, fps);
        }
    }

    Ok(received)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(&args)?;

    let config = args.capture_config()?;
    let fps = args.fps.unwrap_or(config.preset.fps()).max(1);
    let platform = VirtualPlatform::with_frame_interval(Duration::from_secs(1) / fps);
    let registry = SensorRegistry::new().with(platform.sensor(&args.sensor, args.sensor_address));

    info!(
        "EdgeFirst capture: {} with {} buffers",
        config.format_name(),
        config.buffer_count
    );

    let mut pipeline = Pipeline::new(config, platform, registry);
    pipeline.init(None)?;
    if let Err(e) = pipeline.start() {
        pipeline.deinit();
        return Err(e.into());
    }

    let frames = pipeline.frames()?;
    let running = Arc::new(AtomicBool::new(true));
    let mut consumer = tokio::task::spawn_blocking({
        let running = running.clone();
        let limit = args.frames;
        let timeout = Duration::from_millis(args.timeout);
        let verbose = args.verbose;
        move || consume(frames, limit, timeout, verbose, &running)
    });

    let received = tokio::select! {
        res = &mut consumer => res?,
        _ = signal::ctrl_c() => {
            info!("interrupted, stopping capture");
            running.store(false, Ordering::Release);
            consumer.await?
        }
    };

    let stopped = pipeline.stop();
    let stats = pipeline.stats();
    pipeline.deinit();

    info!(
        "completed: {} starved: {} unresolved: {} overflows: {}",
        stats.completed, stats.starved_requests, stats.unresolved_completions, stats.channel_overflows
    );

    if let Err(e) = &stopped {
        error!("failed to stop capture: {}", e);
    }
    stopped?;
    let received = received?;
    info!("received {} frames", received);

    Ok(())
}
