//! Single-flight frame scheduler.
//!
//! A periodic tick grabs the current frame from the live track, optionally
//! flips it, encodes it as a JPEG data URL and submits it to a `FrameSink`.
//! At most one frame is outstanding: the processing flag set on submit is
//! cleared by `resolve()` when the matching result or error arrives, or by
//! `abandon_in_flight()` when no answer can arrive any more. A frame left
//! unanswered for `answer_timeout` is released by the next tick.

use std::time::{Duration, Instant};

use crate::frame::encode_data_url;
use crate::ingest::CameraTrack;
use crate::transport::{Connector, DetectionChannel, OutboundMessage, SendOutcome};

pub const DEFAULT_CAPTURE_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_JPEG_QUALITY: u8 = 80;
pub const DEFAULT_ANSWER_TIMEOUT: Duration = Duration::from_secs(10);

/// Where encoded frames go.
pub trait FrameSink {
    fn submit(&mut self, message: OutboundMessage, now: Instant) -> SendOutcome;
}

impl<C: Connector> FrameSink for DetectionChannel<C> {
    fn submit(&mut self, message: OutboundMessage, now: Instant) -> SendOutcome {
        self.send(message, now)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureSettings {
    pub interval: Duration,
    /// Mirror frames before encoding.
    pub flip_horizontal: bool,
    pub jpeg_quality: u8,
    /// Release an unanswered frame after this long. Zero waits forever.
    pub answer_timeout: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_CAPTURE_INTERVAL,
            flip_horizontal: false,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            answer_timeout: DEFAULT_ANSWER_TIMEOUT,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    NoSurface,
    NoDimensions,
    InFlight,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// Stopped, or the next tick is still in the future.
    NotDue,
    Skipped(SkipReason),
    Submitted,
    /// The sink refused the frame; processing was cleared.
    Dropped,
    /// Grab or encode failed; processing was cleared.
    Failed(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub submitted: u64,
    pub skipped: u64,
    pub dropped: u64,
    pub failed: u64,
    pub resolved: u64,
    pub timed_out: u64,
}

pub struct FrameScheduler {
    settings: CaptureSettings,
    running: bool,
    next_tick: Option<Instant>,
    /// Submission instant of the outstanding frame.
    in_flight: Option<Instant>,
    stats: SchedulerStats,
}

impl FrameScheduler {
    pub fn new(settings: CaptureSettings) -> Self {
        Self {
            settings,
            running: false,
            next_tick: None,
            in_flight: None,
            stats: SchedulerStats::default(),
        }
    }

    pub fn settings(&self) -> CaptureSettings {
        self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_processing(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.next_tick
    }

    /// Arm the timer; the first tick fires one interval from `now`.
    pub fn start(&mut self, now: Instant) {
        self.running = true;
        self.in_flight = None;
        self.next_tick = Some(now + self.settings.interval);
        log::debug!(
            "FrameScheduler: started at {}ms interval",
            self.settings.interval.as_millis()
        );
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.next_tick = None;
        self.in_flight = None;
    }

    /// Re-arm at the new period. An outstanding frame stays outstanding.
    pub fn set_interval(&mut self, interval: Duration, now: Instant) {
        self.settings.interval = interval;
        if self.running {
            self.next_tick = Some(now + interval);
        }
        log::info!("FrameScheduler: interval set to {}ms", interval.as_millis());
    }

    pub fn set_flip_horizontal(&mut self, flip: bool) {
        self.settings.flip_horizontal = flip;
    }

    pub fn due(&self, now: Instant) -> bool {
        self.running && self.next_tick.is_some_and(|tick| tick <= now)
    }

    /// Run one tick if due.
    pub fn tick<T, S>(&mut self, now: Instant, surface: Option<&mut T>, sink: &mut S) -> TickOutcome
    where
        T: CameraTrack,
        S: FrameSink,
    {
        if !self.due(now) {
            return TickOutcome::NotDue;
        }
        // Missed ticks are not replayed.
        self.next_tick = Some(now + self.settings.interval);
        self.stats.ticks += 1;

        let Some(track) = surface else {
            return self.skip(SkipReason::NoSurface);
        };
        let (width, height) = track.dimensions();
        if width == 0 || height == 0 {
            return self.skip(SkipReason::NoDimensions);
        }
        if let Some(submitted) = self.in_flight {
            let timeout = self.settings.answer_timeout;
            if timeout.is_zero() || now.saturating_duration_since(submitted) < timeout {
                return self.skip(SkipReason::InFlight);
            }
            log::warn!(
                "FrameScheduler: no answer after {}ms, releasing frame",
                timeout.as_millis()
            );
            self.in_flight = None;
            self.stats.timed_out += 1;
        }

        self.in_flight = Some(now);
        let mut frame = match track.grab() {
            Ok(frame) => frame,
            Err(err) => return self.fail(format!("grab failed: {err}")),
        };
        if self.settings.flip_horizontal {
            frame.flip_horizontal();
        }
        let image = match encode_data_url(frame, self.settings.jpeg_quality) {
            Ok(image) => image,
            Err(err) => return self.fail(format!("encode failed: {err:#}")),
        };

        match sink.submit(OutboundMessage::frame(image), now) {
            SendOutcome::Sent => {
                self.stats.submitted += 1;
                TickOutcome::Submitted
            }
            SendOutcome::Dropped => {
                self.in_flight = None;
                self.stats.dropped += 1;
                log::debug!("FrameScheduler: frame dropped, channel not open");
                TickOutcome::Dropped
            }
        }
    }

    /// The outstanding frame was answered. Returns its round-trip time.
    pub fn resolve(&mut self, now: Instant) -> Option<Duration> {
        let submitted = self.in_flight.take()?;
        self.stats.resolved += 1;
        Some(now.saturating_duration_since(submitted))
    }

    /// No answer can arrive for the outstanding frame.
    pub fn abandon_in_flight(&mut self) {
        if self.in_flight.take().is_some() {
            log::debug!("FrameScheduler: abandoned in-flight frame");
        }
    }

    fn skip(&mut self, reason: SkipReason) -> TickOutcome {
        self.stats.skipped += 1;
        TickOutcome::Skipped(reason)
    }

    fn fail(&mut self, reason: String) -> TickOutcome {
        self.in_flight = None;
        self.stats.failed += 1;
        log::warn!("FrameScheduler: {}", reason);
        TickOutcome::Failed(reason)
    }
}
