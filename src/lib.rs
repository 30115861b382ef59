//! Sightline
//!
//! Streams live camera frames to a remote detection service and turns the
//! asynchronous answers into an overlay and an event timeline.
//!
//! # Architecture
//!
//! Everything runs cooperatively on one thread, driven by explicit `Instant`s:
//!
//! 1. **Capture**: `ingest::FrameSource` owns the camera track and recovers
//!    from track loss with a bounded number of restarts.
//! 2. **Schedule**: `scheduler::FrameScheduler` grabs, flips and JPEG-encodes a
//!    frame per tick, with at most one frame awaiting its answer.
//! 3. **Transport**: `transport::DetectionChannel` keeps a JSON duplex
//!    connection open, reconnecting with linear backoff up to a cap.
//! 4. **Present**: `overlay` maps detections into display space and
//!    `timeline` merges the bounded histories into one feed.
//!
//! `pipeline::Pipeline` wires these together with an explicit
//! `init` / `poll` / `teardown` lifecycle.
//!
//! # Module Structure
//!
//! - `frame`: captured frame container and data-URL codec
//! - `history`: bounded ring buffer
//! - `detect`: detection types and the detection store
//! - `config`: file + environment configuration

use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod detect;
pub mod frame;
pub mod history;
pub mod ingest;
pub mod overlay;
pub mod pipeline;
pub mod scheduler;
pub mod timeline;
pub mod transport;

pub use config::PipelineConfig;
pub use detect::{
    BoundingBox, DetectionFrame, DetectionStore, HistoryCaps, LogEntry, ObjectDetection, Point,
    Severity, TextDetection,
};
pub use frame::{decode_data_url, encode_data_url, VideoFrame};
pub use history::BoundedHistory;
pub use ingest::{
    CameraBackend, CameraDevice, CameraError, CameraTrack, FrameSource, Resolution,
    SessionState, SourceEvent, SyntheticCamera, SyntheticControl, SystemCamera,
};
pub use overlay::{render, Dimensions, OverlayInput, OverlayRenderer, OverlayScene, OverlayShape};
pub use pipeline::{Pipeline, PipelineEvent};
pub use scheduler::{CaptureSettings, FrameScheduler, FrameSink, TickOutcome};
pub use timeline::{EventTimeline, TimelineEntry, TimelineEvent};
pub use transport::{
    ChannelConfig, ChannelEvent, ChannelState, DetectionChannel, LoopbackEndpoint,
    ReconnectPolicy, WsConnector,
};

/// Wall-clock epoch milliseconds. Falls back to 0 before the epoch.
pub fn wall_clock_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
