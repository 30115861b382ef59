//! Reconnecting detection channel.
//!
//! `DetectionChannel` owns the duplex connection to the detection service and
//! the reconnect state machine:
//!
//! ```text
//! Closed ──connect──▶ Connecting ──ok──▶ Open ──close(1000)──▶ Closed
//!                        │                 │
//!                        └──fail──┐   abnormal close
//!                                 ▼        ▼
//!                            Reconnecting ──retry due──▶ Connecting
//! ```
//!
//! Retries are delay-scheduled (`base_delay × attempt`) through an explicit
//! `ScheduledRetry` handle that `disconnect()` cancels. After `max_attempts`
//! scheduled retries the next failure gives up and the channel stays `Closed`
//! until connected again by hand.
//!
//! The channel never blocks on the service: `poll()` drains whatever the
//! connection has ready and returns the resulting events.

use anyhow::Result;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};
use url::Url;

use super::protocol::{
    is_explicit_disconnect, parse_inbound, InboundMessage, OutboundMessage, CLOSE_ABNORMAL,
    CLOSE_NORMAL,
};

pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_millis(3000);
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// A live duplex connection. Implementations must not block in `poll_event`.
pub trait Connection {
    fn send_text(&mut self, text: &str) -> Result<()>;

    /// Next pending event, or `Ok(None)` when nothing is ready.
    fn poll_event(&mut self) -> Result<Option<ConnectionEvent>>;

    fn close(&mut self, code: u16, reason: &str) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Text(String),
    Closed { code: u16, reason: String },
}

/// Opens connections to an endpoint.
pub trait Connector {
    type Connection: Connection;

    fn connect(&mut self, endpoint: &Url) -> Result<Self::Connection>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
    Reconnecting,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Connecting => "connecting",
            ChannelState::Open => "open",
            ChannelState::Closed => "closed",
            ChannelState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Linear backoff with an attempt cap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            base_delay: DEFAULT_RECONNECT_BASE_DELAY,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub endpoint: Url,
    pub reconnect: ReconnectPolicy,
    /// Zero disables keepalive pings.
    pub keepalive_interval: Duration,
}

/// Cancellable handle for the next connection attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScheduledRetry {
    pub attempt: u32,
    pub due: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Channel not open; the message was discarded, never queued.
    Dropped,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ChannelEvent {
    Opened,
    /// `connected`, `result` and `error` messages. Pongs and unknown tags stay internal.
    Message(InboundMessage),
    /// Malformed inbound message; discarded, connection kept.
    ProtocolError(String),
    /// Normal closure; no reconnect follows.
    Closed { code: u16, reason: String },
    /// Abnormal closure or failed connect; a retry or give-up follows.
    ConnectionLost { code: u16, reason: String },
    RetryScheduled { attempt: u32, delay: Duration },
    GaveUp { attempts: u32 },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub connects: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub messages_received: u64,
    pub protocol_errors: u64,
}

pub struct DetectionChannel<C: Connector> {
    connector: C,
    config: ChannelConfig,
    state: ChannelState,
    connection: Option<C::Connection>,
    attempts: u32,
    retry: Option<ScheduledRetry>,
    /// Set by `disconnect()`; a disconnected channel is only reopened by `connect()`.
    disconnected: bool,
    /// Set when the retry budget ran out.
    exhausted: bool,
    service_ready: bool,
    last_ping_at: Option<Instant>,
    last_pong_at: Option<Instant>,
    events: VecDeque<ChannelEvent>,
    stats: ChannelStats,
}

impl<C: Connector> DetectionChannel<C> {
    pub fn new(connector: C, config: ChannelConfig) -> Self {
        Self {
            connector,
            config,
            state: ChannelState::Closed,
            connection: None,
            attempts: 0,
            retry: None,
            disconnected: false,
            exhausted: false,
            service_ready: false,
            last_ping_at: None,
            last_pong_at: None,
            events: VecDeque::new(),
            stats: ChannelStats::default(),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn endpoint(&self) -> &Url {
        &self.config.endpoint
    }

    /// Consecutive abnormal closures since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn pending_retry(&self) -> Option<ScheduledRetry> {
        self.retry
    }

    /// True once the service sent `connected` on the current connection.
    pub fn is_service_ready(&self) -> bool {
        self.service_ready
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn last_pong_at(&self) -> Option<Instant> {
        self.last_pong_at
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    /// User-initiated connect. Clears a previous disconnect or give-up.
    ///
    /// No-op while an attempt is in progress or the channel is already open.
    pub fn connect(&mut self, now: Instant) {
        if matches!(self.state, ChannelState::Connecting | ChannelState::Open) {
            return;
        }
        self.disconnected = false;
        if self.exhausted {
            self.exhausted = false;
            self.attempts = 0;
        }
        self.retry = None;
        self.attempt_connect(now);
    }

    /// Fire-and-forget send.
    ///
    /// Only an open channel sends. Otherwise the message is dropped, and an
    /// idle channel (closed, not disconnected, not given up) starts connecting.
    pub fn send(&mut self, message: OutboundMessage, now: Instant) -> SendOutcome {
        if self.state != ChannelState::Open {
            self.stats.messages_dropped += 1;
            if self.state == ChannelState::Closed && !self.disconnected && !self.exhausted {
                log::debug!("DetectionChannel: send while closed, connecting");
                self.attempt_connect(now);
            }
            return SendOutcome::Dropped;
        }

        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                log::error!("DetectionChannel: {}", e);
                self.stats.messages_dropped += 1;
                return SendOutcome::Dropped;
            }
        };
        let Some(connection) = self.connection.as_mut() else {
            self.stats.messages_dropped += 1;
            return SendOutcome::Dropped;
        };
        match connection.send_text(&text) {
            Ok(()) => {
                self.stats.messages_sent += 1;
                SendOutcome::Sent
            }
            Err(e) => {
                self.stats.messages_dropped += 1;
                self.connection_lost(CLOSE_ABNORMAL, format!("send failed: {e}"), now);
                SendOutcome::Dropped
            }
        }
    }

    /// Run due timers, drain the connection and return everything that happened
    /// since the previous call.
    pub fn poll(&mut self, now: Instant) -> Vec<ChannelEvent> {
        if self.state == ChannelState::Reconnecting {
            if let Some(retry) = self.retry {
                if retry.due <= now {
                    self.retry = None;
                    log::info!(
                        "DetectionChannel: reconnect attempt {} to {}",
                        retry.attempt,
                        self.config.endpoint
                    );
                    self.attempt_connect(now);
                }
            }
        }

        if self.state == ChannelState::Open {
            self.drain_connection(now);
        }

        if self.state == ChannelState::Open {
            self.keepalive(now);
        }

        self.events.drain(..).collect()
    }

    /// Earliest instant at which `poll` has timed work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let retry = self.retry.map(|retry| retry.due);
        let ping = match (self.state, self.last_ping_at) {
            (ChannelState::Open, Some(last)) if !self.config.keepalive_interval.is_zero() => {
                Some(last + self.config.keepalive_interval)
            }
            _ => None,
        };
        match (retry, ping) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Explicit disconnect: cancels any pending retry and closes with code 1000.
    ///
    /// Idempotent. Pending events are discarded.
    pub fn disconnect(&mut self) {
        self.retry = None;
        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = connection.close(CLOSE_NORMAL, "client disconnect") {
                log::debug!("DetectionChannel: close failed: {}", e);
            }
            log::info!("DetectionChannel: disconnected from {}", self.config.endpoint);
        }
        self.state = ChannelState::Closed;
        self.disconnected = true;
        self.service_ready = false;
        self.last_ping_at = None;
        self.events.clear();
    }

    fn attempt_connect(&mut self, now: Instant) {
        self.state = ChannelState::Connecting;
        match self.connector.connect(&self.config.endpoint) {
            Ok(connection) => {
                self.connection = Some(connection);
                self.state = ChannelState::Open;
                self.attempts = 0;
                self.exhausted = false;
                self.service_ready = false;
                self.last_ping_at = Some(now);
                self.stats.connects += 1;
                log::info!("DetectionChannel: connected to {}", self.config.endpoint);
                self.events.push_back(ChannelEvent::Opened);
            }
            Err(e) => {
                log::warn!(
                    "DetectionChannel: connect to {} failed: {:#}",
                    self.config.endpoint,
                    e
                );
                self.connection_lost(CLOSE_ABNORMAL, e.to_string(), now);
            }
        }
    }

    fn drain_connection(&mut self, now: Instant) {
        loop {
            let Some(connection) = self.connection.as_mut() else {
                return;
            };
            match connection.poll_event() {
                Ok(None) => return,
                Ok(Some(ConnectionEvent::Text(text))) => self.handle_text(&text, now),
                Ok(Some(ConnectionEvent::Closed { code, reason })) => {
                    if is_explicit_disconnect(code) {
                        log::info!("DetectionChannel: closed normally ({})", code);
                        self.connection = None;
                        self.state = ChannelState::Closed;
                        self.service_ready = false;
                        self.events.push_back(ChannelEvent::Closed { code, reason });
                    } else {
                        log::warn!("DetectionChannel: closed abnormally ({}) {}", code, reason);
                        self.connection_lost(code, reason, now);
                    }
                    return;
                }
                Err(e) => {
                    log::warn!("DetectionChannel: connection error: {:#}", e);
                    self.connection_lost(CLOSE_ABNORMAL, e.to_string(), now);
                    return;
                }
            }
        }
    }

    fn handle_text(&mut self, text: &str, now: Instant) {
        self.stats.messages_received += 1;
        match parse_inbound(text, crate::wall_clock_millis()) {
            Ok(InboundMessage::Connected) => {
                log::info!("DetectionChannel: service handshake complete");
                self.service_ready = true;
                self.events
                    .push_back(ChannelEvent::Message(InboundMessage::Connected));
            }
            Ok(InboundMessage::Pong) => {
                self.last_pong_at = Some(now);
            }
            Ok(InboundMessage::Unknown(tag)) => {
                log::debug!("DetectionChannel: ignoring message with tag '{}'", tag);
            }
            Ok(message) => self.events.push_back(ChannelEvent::Message(message)),
            Err(e) => {
                self.stats.protocol_errors += 1;
                log::warn!("DetectionChannel: discarding malformed message: {}", e);
                self.events
                    .push_back(ChannelEvent::ProtocolError(e.to_string()));
            }
        }
    }

    fn keepalive(&mut self, now: Instant) {
        let interval = self.config.keepalive_interval;
        if interval.is_zero() {
            return;
        }
        let due = match self.last_ping_at {
            Some(last) => now.duration_since(last) >= interval,
            None => true,
        };
        if !due {
            return;
        }
        self.last_ping_at = Some(now);
        let Ok(text) = OutboundMessage::Ping.to_json() else {
            return;
        };
        if let Some(connection) = self.connection.as_mut() {
            if let Err(e) = connection.send_text(&text) {
                self.connection_lost(CLOSE_ABNORMAL, format!("keepalive failed: {e}"), now);
            }
        }
    }

    /// Abnormal closure: schedule the next retry or give up.
    fn connection_lost(&mut self, code: u16, reason: String, now: Instant) {
        self.connection = None;
        self.service_ready = false;
        self.last_ping_at = None;
        self.events
            .push_back(ChannelEvent::ConnectionLost { code, reason });

        if self.attempts >= self.config.reconnect.max_attempts {
            log::error!(
                "DetectionChannel: giving up on {} after {} attempts",
                self.config.endpoint,
                self.attempts
            );
            self.state = ChannelState::Closed;
            self.exhausted = true;
            self.retry = None;
            self.events.push_back(ChannelEvent::GaveUp {
                attempts: self.attempts,
            });
            return;
        }

        self.attempts += 1;
        let delay = self.config.reconnect.delay_for(self.attempts);
        self.retry = Some(ScheduledRetry {
            attempt: self.attempts,
            due: now + delay,
        });
        self.state = ChannelState::Reconnecting;
        log::info!(
            "DetectionChannel: retry {}/{} in {}ms",
            self.attempts,
            self.config.reconnect.max_attempts,
            delay.as_millis()
        );
        self.events.push_back(ChannelEvent::RetryScheduled {
            attempt: self.attempts,
            delay,
        });
    }
}
