//! sightline - stream a camera to a detection service
//!
//! Runs one pipeline session until Ctrl-C:
//! 1. Captures frames from the configured camera at a fixed interval
//! 2. Sends them to the detection service over a WebSocket
//! 3. Logs every new timeline entry (detections, service logs, channel state)

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sightline::{
    CameraError, Dimensions, Pipeline, PipelineConfig, SyntheticCamera, SystemCamera, WsConnector,
};

/// Upper bound on sleeping between polls, so inbound messages are picked up promptly.
const MAX_POLL_SLEEP: Duration = Duration::from_millis(20);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Stream camera frames to a detection service and log the results"
)]
struct Args {
    /// Detection service WebSocket URL.
    #[arg(long, env = "SIGHTLINE_ENDPOINT")]
    endpoint: Option<String>,

    /// Camera device id (`stub://front`, `/dev/video0`, ...).
    #[arg(long, env = "SIGHTLINE_DEVICE")]
    device: Option<String>,

    /// Capture interval in milliseconds.
    #[arg(long, env = "SIGHTLINE_CAPTURE_INTERVAL_MS")]
    interval_ms: Option<u64>,

    /// Mirror frames before sending them.
    #[arg(long)]
    flip: bool,

    /// Display surface size for the overlay, as WxH.
    #[arg(long, value_parser = parse_dimensions)]
    display: Option<Dimensions>,

    /// List camera devices and exit.
    #[arg(long)]
    list_devices: bool,
}

fn parse_dimensions(value: &str) -> Result<Dimensions, String> {
    let (width, height) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WxH, got '{value}'"))?;
    let width: u32 = width
        .trim()
        .parse()
        .map_err(|_| format!("invalid width '{width}'"))?;
    let height: u32 = height
        .trim()
        .parse()
        .map_err(|_| format!("invalid height '{height}'"))?;
    Ok(Dimensions::new(width, height))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = PipelineConfig::load()?;
    if let Some(endpoint) = args.endpoint.as_deref() {
        cfg.channel.endpoint = endpoint
            .parse()
            .with_context(|| format!("invalid endpoint {endpoint}"))?;
    }
    if let Some(device) = args.device {
        cfg.device = device;
    }
    if let Some(ms) = args.interval_ms {
        cfg.capture.interval = Duration::from_millis(ms);
    }
    if args.flip {
        cfg.capture.flip_horizontal = true;
    }
    if let Some(display) = args.display {
        cfg.display = display;
    }
    cfg.validate()?;

    let camera = SystemCamera::new(SyntheticCamera::new());
    let mut pipeline = Pipeline::new(cfg, camera, WsConnector::new());

    if args.list_devices {
        for device in pipeline.enumerate_devices()? {
            println!("{}\t{}", device.id, device.label);
        }
        return Ok(());
    }

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        flag.store(false, Ordering::SeqCst);
    })
    .context("error setting Ctrl-C handler")?;

    match pipeline.init(Instant::now()) {
        Ok(()) => {}
        Err(CameraError::PermissionDenied) => {
            return Err(anyhow!("camera permission denied"));
        }
        Err(err) => log::warn!("camera not started: {}", err),
    }
    log::info!(
        "sightline running. device={} endpoint={}",
        pipeline.device(),
        pipeline.channel().endpoint()
    );

    let mut last_seen = None;
    while running.load(Ordering::SeqCst) {
        for event in pipeline.poll(Instant::now()) {
            log::debug!("{:?}", event);
        }
        for entry in pipeline.timeline_after(last_seen) {
            log::info!("{}", entry);
            last_seen = Some(last_seen.map_or(entry.seq, |seen: u64| seen.max(entry.seq)));
        }

        let sleep = pipeline
            .next_wakeup()
            .map(|due| due.saturating_duration_since(Instant::now()))
            .unwrap_or(MAX_POLL_SLEEP)
            .min(MAX_POLL_SLEEP);
        std::thread::sleep(sleep);
    }

    log::info!("shutdown signal received, stopping pipeline...");
    let stats = pipeline.scheduler().stats();
    pipeline.teardown();
    log::info!(
        "frames submitted={} answered={} dropped={} timed_out={}",
        stats.submitted,
        stats.resolved,
        stats.dropped,
        stats.timed_out
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_display_sizes() {
        assert_eq!(parse_dimensions("640x360"), Ok(Dimensions::new(640, 360)));
        assert_eq!(parse_dimensions("1280X720"), Ok(Dimensions::new(1280, 720)));
        assert!(parse_dimensions("640").is_err());
        assert!(parse_dimensions("wide x 2").is_err());
    }
}
