//! Camera ingestion.
//!
//! `FrameSource` owns the camera device and its live track:
//! - `enumerate()` asks the backend for permission, then lists devices
//! - `start()` / `stop()` acquire and release the single hardware track
//! - `poll()` observes asynchronous track failures and runs bounded recovery
//!
//! Backends:
//! - `SyntheticCamera` for `stub://` device ids (tests, demos)
//! - `V4l2Camera` for local device nodes (feature: ingest-v4l2)
//! - `SystemCamera` dispatches between them by device id
//!
//! At most one track is live per `FrameSource`; a new `start()` releases the
//! previous track first.

#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

pub use synthetic::{SyntheticCamera, SyntheticControl, SyntheticTrack};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::{V4l2Camera, V4l2Track};

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::frame::VideoFrame;

pub const DEFAULT_RECOVERY_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_RECOVERY_ATTEMPTS: u32 = 3;

/// Device ids with this prefix are served by the synthetic backend.
pub const SYNTHETIC_SCHEME: &str = "stub://";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CameraDevice {
    pub id: String,
    pub label: String,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CameraError {
    #[error("camera permission denied")]
    PermissionDenied,
    #[error("camera device {0} is unavailable")]
    DeviceUnavailable(String),
    #[error("camera track ended")]
    TrackEnded,
    #[error("camera backend error: {0}")]
    Backend(String),
}

/// Preferred capture resolution. Backends may deliver something else.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Asynchronous track termination, observed through `CameraTrack::poll_event`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackEvent {
    Ended,
    Failed(String),
}

/// A live hardware track. The track is also the video surface frames are read from.
pub trait CameraTrack {
    fn device_id(&self) -> &str;

    /// Native frame dimensions; `(0, 0)` until the first frame metadata is known.
    fn dimensions(&self) -> (u32, u32);

    fn grab(&mut self) -> Result<VideoFrame, CameraError>;

    fn poll_event(&mut self) -> Option<TrackEvent>;

    /// Release the hardware. Called exactly once before the track is dropped.
    fn stop(&mut self);
}

pub trait CameraBackend {
    type Track: CameraTrack;

    fn request_permission(&mut self) -> Result<(), CameraError>;

    fn devices(&mut self) -> Result<Vec<CameraDevice>, CameraError>;

    fn open(&mut self, device_id: &str, ideal: Resolution) -> Result<Self::Track, CameraError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceConfig {
    pub ideal: Resolution,
    pub recovery_delay: Duration,
    pub max_recovery_attempts: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            ideal: Resolution::default(),
            recovery_delay: DEFAULT_RECOVERY_DELAY,
            max_recovery_attempts: DEFAULT_MAX_RECOVERY_ATTEMPTS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceEvent {
    /// A recovery restart succeeded.
    Recovered { device_id: String },
    /// The live track failed; the session is in `Error`.
    Lost {
        device_id: String,
        error: CameraError,
    },
    RecoveryScheduled {
        device_id: String,
        attempt: u32,
        delay: Duration,
    },
    /// Recovery will not be attempted again; the session stays in `Error`.
    GaveUp {
        device_id: String,
        error: CameraError,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ScheduledRecovery {
    attempt: u32,
    due: Instant,
}

pub struct FrameSource<B: CameraBackend> {
    backend: B,
    config: SourceConfig,
    state: SessionState,
    track: Option<B::Track>,
    device_id: Option<String>,
    /// Set by `stop()`; suppresses automatic recovery.
    stopped: bool,
    recovery: Option<ScheduledRecovery>,
    recovery_attempts: u32,
    last_error: Option<CameraError>,
    events: VecDeque<SourceEvent>,
}

impl<B: CameraBackend> FrameSource<B> {
    pub fn new(backend: B, config: SourceConfig) -> Self {
        Self {
            backend,
            config,
            state: SessionState::Idle,
            track: None,
            device_id: None,
            stopped: true,
            recovery: None,
            recovery_attempts: 0,
            last_error: None,
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Device of the current (or last failed) session.
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn last_error(&self) -> Option<&CameraError> {
        self.last_error.as_ref()
    }

    pub fn recovery_pending(&self) -> bool {
        self.recovery.is_some()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.recovery.map(|recovery| recovery.due)
    }

    /// Request permission, then list devices.
    pub fn enumerate(&mut self) -> Result<Vec<CameraDevice>, CameraError> {
        self.backend.request_permission()?;
        self.backend.devices()
    }

    /// Start capturing from `device_id`, releasing any held track first.
    pub fn start(&mut self, device_id: &str) -> Result<(), CameraError> {
        self.stopped = false;
        self.recovery = None;
        self.recovery_attempts = 0;
        self.open_track(device_id)
    }

    /// Release the track and cancel pending recovery. Idempotent.
    pub fn stop(&mut self) {
        self.stopped = true;
        self.recovery = None;
        self.release_track();
        if self.state != SessionState::Idle {
            log::info!("FrameSource: stopped");
        }
        self.state = SessionState::Idle;
    }

    /// The live track, only while `Active`.
    pub fn surface(&mut self) -> Option<&mut B::Track> {
        if self.state != SessionState::Active {
            return None;
        }
        self.track.as_mut()
    }

    /// Native dimensions of the live track, `(0, 0)` when there is none.
    pub fn dimensions(&self) -> (u32, u32) {
        match (&self.state, &self.track) {
            (SessionState::Active, Some(track)) => track.dimensions(),
            _ => (0, 0),
        }
    }

    /// Observe track failures and run due recovery.
    pub fn poll(&mut self, now: Instant) -> Vec<SourceEvent> {
        if self.state == SessionState::Active {
            let event = self.track.as_mut().and_then(|track| track.poll_event());
            if let Some(event) = event {
                self.track_failed(event, now);
            }
        }

        if let Some(recovery) = self.recovery {
            if recovery.due <= now && !self.stopped {
                self.recovery = None;
                self.recover(recovery.attempt, now);
            }
        }

        self.events.drain(..).collect()
    }

    fn open_track(&mut self, device_id: &str) -> Result<(), CameraError> {
        self.release_track();
        self.state = SessionState::Starting;
        self.device_id = Some(device_id.to_string());
        match self.backend.open(device_id, self.config.ideal) {
            Ok(track) => {
                let (width, height) = track.dimensions();
                log::info!(
                    "FrameSource: started {} ({}x{})",
                    device_id,
                    width,
                    height
                );
                self.track = Some(track);
                self.state = SessionState::Active;
                self.last_error = None;
                Ok(())
            }
            Err(err) => {
                log::warn!("FrameSource: failed to start {}: {}", device_id, err);
                self.state = SessionState::Error;
                self.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    fn release_track(&mut self) {
        if let Some(mut track) = self.track.take() {
            track.stop();
        }
    }

    fn track_failed(&mut self, event: TrackEvent, now: Instant) {
        let device_id = self.device_id.clone().unwrap_or_default();
        let error = match event {
            TrackEvent::Ended => CameraError::TrackEnded,
            TrackEvent::Failed(reason) => CameraError::Backend(reason),
        };
        log::warn!("FrameSource: lost {}: {}", device_id, error);
        self.release_track();
        self.state = SessionState::Error;
        self.last_error = Some(error.clone());
        self.events.push_back(SourceEvent::Lost {
            device_id,
            error: error.clone(),
        });
        self.schedule_recovery(error, now);
    }

    fn recover(&mut self, attempt: u32, now: Instant) {
        let Some(device_id) = self.device_id.clone() else {
            return;
        };
        log::info!("FrameSource: recovery attempt {} for {}", attempt, device_id);
        match self.open_track(&device_id) {
            Ok(()) => {
                self.recovery_attempts = 0;
                self.events.push_back(SourceEvent::Recovered { device_id });
            }
            Err(error) => self.schedule_recovery(error, now),
        }
    }

    fn schedule_recovery(&mut self, error: CameraError, now: Instant) {
        if self.stopped {
            return;
        }
        let device_id = self.device_id.clone().unwrap_or_default();
        if error == CameraError::PermissionDenied
            || self.recovery_attempts >= self.config.max_recovery_attempts
        {
            log::error!(
                "FrameSource: giving up on {} after {} recovery attempts",
                device_id,
                self.recovery_attempts
            );
            self.events
                .push_back(SourceEvent::GaveUp { device_id, error });
            return;
        }
        self.recovery_attempts += 1;
        let delay = self.config.recovery_delay;
        self.recovery = Some(ScheduledRecovery {
            attempt: self.recovery_attempts,
            due: now + delay,
        });
        self.events.push_back(SourceEvent::RecoveryScheduled {
            device_id,
            attempt: self.recovery_attempts,
            delay,
        });
    }
}

/// Camera backend chosen per device id: `stub://` ids are synthetic,
/// everything else is a V4L2 device node.
pub struct SystemCamera {
    synthetic: SyntheticCamera,
    #[cfg(feature = "ingest-v4l2")]
    v4l2: V4l2Camera,
}

pub enum SystemTrack {
    Synthetic(SyntheticTrack),
    #[cfg(feature = "ingest-v4l2")]
    V4l2(V4l2Track),
}

impl SystemCamera {
    pub fn new(synthetic: SyntheticCamera) -> Self {
        Self {
            synthetic,
            #[cfg(feature = "ingest-v4l2")]
            v4l2: V4l2Camera::new(),
        }
    }
}

impl CameraBackend for SystemCamera {
    type Track = SystemTrack;

    fn request_permission(&mut self) -> Result<(), CameraError> {
        self.synthetic.request_permission()
    }

    fn devices(&mut self) -> Result<Vec<CameraDevice>, CameraError> {
        #[allow(unused_mut)]
        let mut devices = self.synthetic.devices()?;
        #[cfg(feature = "ingest-v4l2")]
        devices.extend(self.v4l2.devices()?);
        Ok(devices)
    }

    fn open(&mut self, device_id: &str, ideal: Resolution) -> Result<SystemTrack, CameraError> {
        if device_id.starts_with(SYNTHETIC_SCHEME) {
            return self.synthetic.open(device_id, ideal).map(SystemTrack::Synthetic);
        }
        #[cfg(feature = "ingest-v4l2")]
        {
            self.v4l2.open(device_id, ideal).map(SystemTrack::V4l2)
        }
        #[cfg(not(feature = "ingest-v4l2"))]
        {
            log::warn!(
                "SystemCamera: {} needs the ingest-v4l2 feature",
                device_id
            );
            Err(CameraError::DeviceUnavailable(device_id.to_string()))
        }
    }
}

impl CameraTrack for SystemTrack {
    fn device_id(&self) -> &str {
        match self {
            SystemTrack::Synthetic(track) => track.device_id(),
            #[cfg(feature = "ingest-v4l2")]
            SystemTrack::V4l2(track) => track.device_id(),
        }
    }

    fn dimensions(&self) -> (u32, u32) {
        match self {
            SystemTrack::Synthetic(track) => track.dimensions(),
            #[cfg(feature = "ingest-v4l2")]
            SystemTrack::V4l2(track) => track.dimensions(),
        }
    }

    fn grab(&mut self) -> Result<VideoFrame, CameraError> {
        match self {
            SystemTrack::Synthetic(track) => track.grab(),
            #[cfg(feature = "ingest-v4l2")]
            SystemTrack::V4l2(track) => track.grab(),
        }
    }

    fn poll_event(&mut self) -> Option<TrackEvent> {
        match self {
            SystemTrack::Synthetic(track) => track.poll_event(),
            #[cfg(feature = "ingest-v4l2")]
            SystemTrack::V4l2(track) => track.poll_event(),
        }
    }

    fn stop(&mut self) {
        match self {
            SystemTrack::Synthetic(track) => track.stop(),
            #[cfg(feature = "ingest-v4l2")]
            SystemTrack::V4l2(track) => track.stop(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> (FrameSource<SyntheticCamera>, SyntheticControl) {
        let camera = SyntheticCamera::new();
        let control = camera.control();
        let config = SourceConfig {
            ideal: Resolution {
                width: 64,
                height: 48,
            },
            ..SourceConfig::default()
        };
        (FrameSource::new(camera, config), control)
    }

    #[test]
    fn enumerate_requires_permission() {
        let (mut source, control) = source();
        let devices = source.enumerate().unwrap();
        assert!(devices.iter().any(|d| d.id == "stub://front"));

        control.deny_permission(true);
        assert_eq!(source.enumerate(), Err(CameraError::PermissionDenied));
    }

    #[test]
    fn start_activates_surface() {
        let (mut source, control) = source();
        source.start("stub://front").unwrap();
        assert_eq!(source.state(), SessionState::Active);
        assert_eq!(source.dimensions(), (64, 48));
        assert!(source.surface().is_some());
        assert_eq!(control.live_tracks(), 1);
    }

    #[test]
    fn restart_releases_previous_track_first() {
        let (mut source, control) = source();
        source.start("stub://front").unwrap();
        source.start("stub://rear").unwrap();
        assert_eq!(control.live_tracks(), 1);
        assert_eq!(source.device_id(), Some("stub://rear"));
    }

    #[test]
    fn start_failure_is_returned() {
        let (mut source, control) = source();
        control.unplug("stub://front");
        let err = source.start("stub://front").unwrap_err();
        assert_eq!(err, CameraError::DeviceUnavailable("stub://front".into()));
        assert_eq!(source.state(), SessionState::Error);
        assert!(source.surface().is_none());
    }

    #[test]
    fn stop_is_idempotent_and_releases_from_error() {
        let (mut source, control) = source();
        source.start("stub://front").unwrap();
        control.end_track();
        source.poll(Instant::now());
        assert_eq!(source.state(), SessionState::Error);

        source.stop();
        source.stop();
        assert_eq!(source.state(), SessionState::Idle);
        assert!(!source.recovery_pending());
        assert_eq!(control.live_tracks(), 0);
    }

    #[test]
    fn lost_track_recovers_after_delay() {
        let (mut source, control) = source();
        let t0 = Instant::now();
        source.start("stub://front").unwrap();
        control.end_track();

        let events = source.poll(t0);
        assert_eq!(
            events,
            vec![
                SourceEvent::Lost {
                    device_id: "stub://front".into(),
                    error: CameraError::TrackEnded
                },
                SourceEvent::RecoveryScheduled {
                    device_id: "stub://front".into(),
                    attempt: 1,
                    delay: DEFAULT_RECOVERY_DELAY
                },
            ]
        );
        assert_eq!(source.state(), SessionState::Error);

        assert!(source.poll(t0 + Duration::from_millis(999)).is_empty());
        let events = source.poll(t0 + DEFAULT_RECOVERY_DELAY);
        assert_eq!(
            events,
            vec![SourceEvent::Recovered {
                device_id: "stub://front".into()
            }]
        );
        assert_eq!(source.state(), SessionState::Active);
    }

    #[test]
    fn stop_suppresses_pending_recovery() {
        let (mut source, control) = source();
        let t0 = Instant::now();
        source.start("stub://front").unwrap();
        control.end_track();
        source.poll(t0);
        assert!(source.recovery_pending());

        source.stop();
        assert!(source.poll(t0 + Duration::from_secs(10)).is_empty());
        assert_eq!(source.state(), SessionState::Idle);
        assert_eq!(control.open_count(), 1);
    }

    #[test]
    fn recovery_is_bounded() {
        let (mut source, control) = source();
        let mut now = Instant::now();
        source.start("stub://front").unwrap();
        control.unplug("stub://front");
        control.end_track();

        let mut events = source.poll(now);
        while let Some(due) = source.next_deadline() {
            now = due;
            events.extend(source.poll(now));
        }
        let scheduled = events
            .iter()
            .filter(|e| matches!(e, SourceEvent::RecoveryScheduled { .. }))
            .count();
        assert_eq!(scheduled, 3);
        assert!(matches!(events.last(), Some(SourceEvent::GaveUp { .. })));
        assert_eq!(source.state(), SessionState::Error);
    }

    #[test]
    fn permission_denied_is_not_retried() {
        let (mut source, control) = source();
        let t0 = Instant::now();
        source.start("stub://front").unwrap();
        control.deny_permission(true);
        control.end_track();

        source.poll(t0);
        let events = source.poll(t0 + DEFAULT_RECOVERY_DELAY);
        assert_eq!(
            events,
            vec![SourceEvent::GaveUp {
                device_id: "stub://front".into(),
                error: CameraError::PermissionDenied
            }]
        );
        assert!(!source.recovery_pending());
    }

    #[test]
    fn system_camera_routes_stub_ids() {
        let mut camera = SystemCamera::new(SyntheticCamera::new());
        let track = camera
            .open("stub://front", Resolution::default())
            .unwrap();
        assert_eq!(track.device_id(), "stub://front");
        assert_eq!(track.dimensions(), (1280, 720));
    }
}
