//! Capture → detection → overlay session.
//!
//! `Pipeline` owns the camera source, the detection channel, the scheduler,
//! the detection store and the overlay renderer. Everything runs on the
//! caller's thread: `poll(now)` drains camera events, channel events and a
//! due capture tick, in that order. The inbound handler in here is the only
//! writer of the detection store.

use std::time::{Duration, Instant};

use crate::config::PipelineConfig;
use crate::detect::{DetectionStore, LogEntry};
use crate::ingest::{CameraBackend, CameraDevice, CameraError, FrameSource, SessionState, SourceEvent};
use crate::overlay::{Dimensions, OverlayRenderer, OverlayScene};
use crate::scheduler::{FrameScheduler, TickOutcome};
use crate::timeline::{EventTimeline, TimelineEntry};
use crate::transport::{ChannelEvent, Connector, DetectionChannel, InboundMessage};
use crate::wall_clock_millis;

#[derive(Clone, Debug, PartialEq)]
pub enum PipelineEvent {
    Camera(SourceEvent),
    Channel(ChannelEvent),
    /// Ticks that reached the grab stage; silent skips are not reported.
    Tick(TickOutcome),
}

pub struct Pipeline<B: CameraBackend, C: Connector> {
    source: FrameSource<B>,
    channel: DetectionChannel<C>,
    scheduler: FrameScheduler,
    store: DetectionStore,
    timeline: EventTimeline,
    overlay: OverlayRenderer,
    device: String,
    last_round_trip: Option<Duration>,
    active: bool,
}

impl<B: CameraBackend, C: Connector> Pipeline<B, C> {
    pub fn new(config: PipelineConfig, camera: B, connector: C) -> Self {
        Self {
            source: FrameSource::new(camera, config.camera),
            channel: DetectionChannel::new(connector, config.channel),
            scheduler: FrameScheduler::new(config.capture),
            store: DetectionStore::new(config.history),
            timeline: EventTimeline::new(),
            overlay: OverlayRenderer::new(
                config.display,
                config.capture.flip_horizontal,
                config.mirror_display,
            ),
            device: config.device,
            last_round_trip: None,
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn source(&self) -> &FrameSource<B> {
        &self.source
    }

    pub fn channel(&self) -> &DetectionChannel<C> {
        &self.channel
    }

    pub fn scheduler(&self) -> &FrameScheduler {
        &self.scheduler
    }

    pub fn store(&self) -> &DetectionStore {
        &self.store
    }

    /// Round trip of the most recently answered frame.
    pub fn last_round_trip(&self) -> Option<Duration> {
        self.last_round_trip
    }

    pub fn enumerate_devices(&mut self) -> Result<Vec<CameraDevice>, CameraError> {
        self.source.enumerate()
    }

    /// Start a session: fresh histories, camera, channel and capture timer.
    ///
    /// A camera failure is logged and returned; the channel and timer still run
    /// so a later `select_device` can resume capture.
    pub fn init(&mut self, now: Instant) -> Result<(), CameraError> {
        self.store.clear();
        self.last_round_trip = None;
        self.active = true;

        let device = self.device.clone();
        let started = self.source.start(&device);
        self.channel.connect(now);
        self.scheduler.start(now);
        log::info!(
            "Pipeline: session started on {} -> {}",
            device,
            self.channel.endpoint()
        );

        if let Err(err) = started {
            self.store
                .push_log(LogEntry::error(format!("camera {device}: {err}"), wall_clock_millis()));
            return Err(err);
        }
        Ok(())
    }

    /// Stop everything. Idempotent; safe mid-reconnect and mid-capture.
    pub fn teardown(&mut self) {
        self.scheduler.stop();
        self.channel.disconnect();
        self.source.stop();
        self.store.clear();
        if self.active {
            log::info!("Pipeline: session stopped");
        }
        self.active = false;
    }

    pub fn poll(&mut self, now: Instant) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        if !self.active {
            return events;
        }

        for event in self.source.poll(now) {
            self.handle_camera(&event);
            events.push(PipelineEvent::Camera(event));
        }

        for event in self.channel.poll(now) {
            self.handle_channel(&event, now);
            events.push(PipelineEvent::Channel(event));
        }

        let surface = self.source.surface();
        match self.scheduler.tick(now, surface, &mut self.channel) {
            TickOutcome::NotDue | TickOutcome::Skipped(_) => {}
            outcome => events.push(PipelineEvent::Tick(outcome)),
        }

        events
    }

    /// Restart capture on another device.
    pub fn select_device(&mut self, device_id: &str) -> Result<(), CameraError> {
        self.device = device_id.to_string();
        if !self.active {
            return Ok(());
        }
        self.source.start(device_id).map_err(|err| {
            self.store.push_log(LogEntry::error(
                format!("camera {device_id}: {err}"),
                wall_clock_millis(),
            ));
            err
        })
    }

    pub fn set_capture_interval(&mut self, interval: Duration, now: Instant) {
        self.scheduler.set_interval(interval, now);
    }

    pub fn set_flip_horizontal(&mut self, flip: bool) {
        self.scheduler.set_flip_horizontal(flip);
        self.overlay.set_flip_horizontal(flip);
    }

    pub fn resize_display(&mut self, display: Dimensions) {
        self.overlay.resize(display);
    }

    /// Current overlay for the latest result, in display pixels.
    pub fn overlay(&mut self) -> &OverlayScene {
        let (width, height) = self.source.dimensions();
        self.overlay.scene(
            self.store.current(),
            Dimensions::new(width, height),
            self.store.revision(),
        )
    }

    pub fn timeline(&mut self) -> &[TimelineEntry] {
        self.timeline.sync(&self.store)
    }

    /// Timeline entries that arrived after `seq`; syncs first.
    pub fn timeline_after(&mut self, seq: Option<u64>) -> Vec<TimelineEntry> {
        self.timeline.sync(&self.store);
        self.timeline.entries_after(seq).cloned().collect()
    }

    /// Earliest instant at which `poll` has timed work.
    pub fn next_wakeup(&self) -> Option<Instant> {
        [
            self.source.next_deadline(),
            self.channel.next_deadline(),
            self.scheduler.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn handle_camera(&mut self, event: &SourceEvent) {
        let now_ms = wall_clock_millis();
        let entry = match event {
            SourceEvent::Lost { device_id, error } => {
                LogEntry::warning(format!("camera {device_id} lost: {error}"), now_ms)
            }
            SourceEvent::RecoveryScheduled {
                device_id,
                attempt,
                delay,
            } => LogEntry::info(
                format!(
                    "restarting camera {device_id} in {}ms (attempt {attempt})",
                    delay.as_millis()
                ),
                now_ms,
            ),
            SourceEvent::Recovered { device_id } => {
                LogEntry::info(format!("camera {device_id} recovered"), now_ms)
            }
            SourceEvent::GaveUp { device_id, error } => LogEntry::error(
                format!("camera {device_id} unavailable: {error}; select a device to retry"),
                now_ms,
            ),
        };
        self.store.push_log(entry);
    }

    fn handle_channel(&mut self, event: &ChannelEvent, now: Instant) {
        let now_ms = wall_clock_millis();
        match event {
            ChannelEvent::Opened => {
                self.store.push_log(LogEntry::info(
                    format!("connected to {}", self.channel.endpoint()),
                    now_ms,
                ));
            }
            ChannelEvent::Message(InboundMessage::Connected) => {
                self.store
                    .push_log(LogEntry::info("detection service ready", now_ms));
            }
            ChannelEvent::Message(InboundMessage::Result(result)) => {
                self.last_round_trip = self.scheduler.resolve(now).or(self.last_round_trip);
                self.store.record_result(
                    result.objects.clone(),
                    result.text.clone(),
                    result.logs.clone(),
                    now_ms,
                );
            }
            ChannelEvent::Message(InboundMessage::Error { message }) => {
                self.scheduler.resolve(now);
                self.store
                    .push_log(LogEntry::error(format!("service error: {message}"), now_ms));
            }
            ChannelEvent::Message(InboundMessage::Pong | InboundMessage::Unknown(_)) => {}
            ChannelEvent::ProtocolError(reason) => {
                // A discarded reply can never answer the outstanding frame.
                self.scheduler.abandon_in_flight();
                self.store.push_log(LogEntry::warning(
                    format!("discarded malformed message: {reason}"),
                    now_ms,
                ));
            }
            ChannelEvent::Closed { code, .. } => {
                self.scheduler.abandon_in_flight();
                self.store
                    .push_log(LogEntry::info(format!("connection closed ({code})"), now_ms));
            }
            ChannelEvent::ConnectionLost { code, reason } => {
                self.scheduler.abandon_in_flight();
                let text = if reason.is_empty() {
                    format!("connection lost ({code})")
                } else {
                    format!("connection lost ({code}): {reason}")
                };
                self.store.push_log(LogEntry::warning(text, now_ms));
            }
            ChannelEvent::RetryScheduled { attempt, delay } => {
                self.store.push_log(LogEntry::info(
                    format!("reconnecting in {}ms (attempt {attempt})", delay.as_millis()),
                    now_ms,
                ));
            }
            ChannelEvent::GaveUp { attempts } => {
                self.store.push_log(LogEntry::error(
                    format!("detection service unreachable after {attempts} attempts; restart required"),
                    now_ms,
                ));
            }
        }
    }

    /// Camera session state, for status displays.
    pub fn camera_state(&self) -> SessionState {
        self.source.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Severity;
    use crate::ingest::{Resolution, SyntheticCamera, SyntheticControl};
    use crate::timeline::TimelineEvent;
    use crate::transport::{ChannelState, LoopbackConnector, LoopbackEndpoint};
    use serde_json::json;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn pipeline() -> (
        Pipeline<SyntheticCamera, LoopbackConnector>,
        SyntheticControl,
        LoopbackEndpoint,
    ) {
        let mut config = PipelineConfig::defaults().unwrap();
        config.camera.ideal = Resolution {
            width: 128,
            height: 72,
        };
        config.channel.keepalive_interval = Duration::ZERO;
        let camera = SyntheticCamera::new();
        let control = camera.control();
        let endpoint = LoopbackEndpoint::new();
        let pipeline = Pipeline::new(config, camera, endpoint.connector());
        (pipeline, control, endpoint)
    }

    fn result_message() -> serde_json::Value {
        json!({
            "kind": "result",
            "objects": [
                {"class": "person", "confidence": 91.0, "bbox": {"x1": 10, "y1": 10, "x2": 50, "y2": 60}, "timestamp": 1_700_000_000_000u64}
            ],
            "text": [],
            "logs": [{"severity": "info", "text": "1 object", "timestamp": 1_700_000_000_000u64}]
        })
    }

    fn has_log(pipeline: &mut Pipeline<SyntheticCamera, LoopbackConnector>, severity: Severity, needle: &str) -> bool {
        pipeline.timeline().iter().any(|entry| match &entry.event {
            TimelineEvent::Log(log) => log.severity == severity && log.text.contains(needle),
            _ => false,
        })
    }

    #[test]
    fn init_starts_camera_channel_and_timer() {
        let (mut pipeline, control, endpoint) = pipeline();
        let t0 = Instant::now();
        pipeline.init(t0).unwrap();
        assert_eq!(pipeline.camera_state(), SessionState::Active);
        assert_eq!(pipeline.channel().state(), ChannelState::Open);
        assert_eq!(control.live_tracks(), 1);
        assert_eq!(pipeline.next_wakeup(), Some(t0 + ms(500)));

        pipeline.poll(t0);
        let events = pipeline.poll(t0 + ms(500));
        assert!(events.contains(&PipelineEvent::Tick(TickOutcome::Submitted)));
        assert_eq!(endpoint.sent_frames(), 1);
        assert!(pipeline.scheduler().is_processing());
        assert!(has_log(&mut pipeline, Severity::Info, "connected to ws://"));
    }

    #[test]
    fn result_resolves_frame_and_updates_views() {
        let (mut pipeline, _control, endpoint) = pipeline();
        let t0 = Instant::now();
        pipeline.init(t0).unwrap();
        pipeline.poll(t0 + ms(500));

        endpoint.push_json(&result_message());
        pipeline.poll(t0 + ms(800));
        assert!(!pipeline.scheduler().is_processing());
        assert_eq!(pipeline.last_round_trip(), Some(ms(300)));
        assert_eq!(pipeline.store().objects().len(), 1);
        assert_eq!(pipeline.overlay().shapes.len(), 1);
        assert!(has_log(&mut pipeline, Severity::Info, "1 object"));
    }

    #[test]
    fn service_error_is_logged_and_clears_processing() {
        let (mut pipeline, _control, endpoint) = pipeline();
        let t0 = Instant::now();
        pipeline.init(t0).unwrap();
        pipeline.poll(t0 + ms(500));

        endpoint.push_json(&json!({"kind": "error", "message": "model overloaded"}));
        pipeline.poll(t0 + ms(600));
        assert!(!pipeline.scheduler().is_processing());
        assert!(has_log(&mut pipeline, Severity::Error, "model overloaded"));
    }

    #[test]
    fn malformed_reply_releases_in_flight_frame() {
        let (mut pipeline, _control, endpoint) = pipeline();
        let t0 = Instant::now();
        pipeline.init(t0).unwrap();
        pipeline.poll(t0 + ms(500));
        assert!(pipeline.scheduler().is_processing());

        endpoint.push_json(&json!({"kind": "result", "objects": [{"confidence": 50}]}));
        pipeline.poll(t0 + ms(600));
        assert!(!pipeline.scheduler().is_processing());
        assert!(has_log(&mut pipeline, Severity::Warning, "discarded malformed message"));

        pipeline.poll(t0 + ms(1000));
        assert_eq!(endpoint.sent_frames(), 2);
    }

    #[test]
    fn abnormal_close_abandons_in_flight_frame() {
        let (mut pipeline, _control, endpoint) = pipeline();
        let t0 = Instant::now();
        pipeline.init(t0).unwrap();
        pipeline.poll(t0 + ms(500));
        assert!(pipeline.scheduler().is_processing());

        endpoint.close_from_server(1011, "restart");
        pipeline.poll(t0 + ms(600));
        assert!(!pipeline.scheduler().is_processing());
        assert_eq!(pipeline.channel().state(), ChannelState::Reconnecting);
        assert!(has_log(&mut pipeline, Severity::Warning, "connection lost (1011)"));
        assert!(has_log(&mut pipeline, Severity::Info, "reconnecting in 3000ms"));
    }

    #[test]
    fn exhausted_reconnects_surface_fatal_entry() {
        let (mut pipeline, _control, endpoint) = pipeline();
        endpoint.refuse_connects(100);
        let mut now = Instant::now();
        pipeline.init(now).unwrap();
        pipeline.poll(now);
        while let Some(retry) = pipeline.channel().pending_retry() {
            now = retry.due;
            pipeline.poll(now);
        }
        assert_eq!(pipeline.channel().state(), ChannelState::Closed);
        assert!(has_log(&mut pipeline, Severity::Error, "restart required"));
    }

    #[test]
    fn teardown_is_idempotent_and_releases_everything() {
        let (mut pipeline, control, endpoint) = pipeline();
        let t0 = Instant::now();
        pipeline.init(t0).unwrap();
        pipeline.poll(t0 + ms(500));
        endpoint.push_json(&result_message());
        pipeline.poll(t0 + ms(700));

        pipeline.teardown();
        pipeline.teardown();
        assert_eq!(endpoint.client_close().map(|(code, _)| code), Some(1000));
        assert_eq!(control.live_tracks(), 0);
        assert!(pipeline.timeline().is_empty());
        assert!(pipeline.store().current().is_none());
        assert!(pipeline.poll(t0 + ms(5000)).is_empty());
        assert_eq!(endpoint.sent_frames(), 1);
    }

    #[test]
    fn teardown_mid_reconnect_cancels_retry() {
        let (mut pipeline, _control, endpoint) = pipeline();
        let t0 = Instant::now();
        endpoint.refuse_connects(1);
        pipeline.init(t0).unwrap();
        assert!(pipeline.channel().pending_retry().is_some());

        pipeline.teardown();
        assert!(pipeline.channel().pending_retry().is_none());
        assert_eq!(pipeline.next_wakeup(), None);
        assert_eq!(endpoint.connect_attempts(), 1);
    }

    #[test]
    fn camera_failure_at_init_is_reported() {
        let (mut pipeline, control, _endpoint) = pipeline();
        control.unplug("stub://front");
        let err = pipeline.init(Instant::now()).unwrap_err();
        assert_eq!(err, CameraError::DeviceUnavailable("stub://front".into()));
        assert!(has_log(&mut pipeline, Severity::Error, "stub://front"));

        pipeline.select_device("stub://rear").unwrap();
        assert_eq!(pipeline.camera_state(), SessionState::Active);
    }

    #[test]
    fn flip_and_resize_update_overlay() {
        let (mut pipeline, _control, endpoint) = pipeline();
        let t0 = Instant::now();
        pipeline.init(t0).unwrap();
        pipeline.poll(t0 + ms(500));
        endpoint.push_json(&result_message());
        pipeline.poll(t0 + ms(600));

        // 128x72 native onto 640x360: scale 5, mirrored by default.
        let rect = |pipeline: &mut Pipeline<SyntheticCamera, LoopbackConnector>| {
            match &pipeline.overlay().shapes[0] {
                crate::overlay::OverlayShape::Box { rect, .. } => *rect,
                other => panic!("unexpected shape {other:?}"),
            }
        };
        assert_eq!(rect(&mut pipeline).left, 640.0 - 250.0);

        pipeline.set_flip_horizontal(true);
        assert_eq!(rect(&mut pipeline).left, 50.0);

        pipeline.resize_display(Dimensions::new(1280, 720));
        assert_eq!(rect(&mut pipeline).left, 100.0);
    }
}
