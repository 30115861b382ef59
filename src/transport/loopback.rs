//! In-process connector for tests.
//!
//! `LoopbackEndpoint` plays the detection service: it scripts inbound
//! messages, closes connections with chosen codes, refuses connects and
//! records everything the client sent.

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use url::Url;

use super::channel::{Connection, ConnectionEvent, Connector};

#[derive(Debug, Default)]
struct LoopbackState {
    refuse: u32,
    connect_attempts: u32,
    generation: u64,
    inbound: VecDeque<ConnectionEvent>,
    sent: Vec<String>,
    client_close: Option<(u16, String)>,
}

/// Service side of a loopback link. Clones share state.
#[derive(Clone, Debug, Default)]
pub struct LoopbackEndpoint {
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> LoopbackConnector {
        LoopbackConnector {
            state: Arc::clone(&self.state),
        }
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_connects(&self, count: u32) {
        self.lock().refuse = count;
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.lock()
            .inbound
            .push_back(ConnectionEvent::Text(text.into()));
    }

    pub fn push_json(&self, value: &serde_json::Value) {
        self.push_text(value.to_string());
    }

    pub fn close_from_server(&self, code: u16, reason: &str) {
        self.lock().inbound.push_back(ConnectionEvent::Closed {
            code,
            reason: reason.to_string(),
        });
    }

    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    /// Raw JSON texts received from the client, oldest first.
    pub fn sent(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    pub fn sent_frames(&self) -> usize {
        self.lock()
            .sent
            .iter()
            .filter(|text| {
                serde_json::from_str::<serde_json::Value>(text)
                    .map(|value| value["kind"] == "frame")
                    .unwrap_or(false)
            })
            .count()
    }

    pub fn client_close(&self) -> Option<(u16, String)> {
        self.lock().client_close.clone()
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        lock_state(&self.state)
    }
}

fn lock_state(state: &Mutex<LoopbackState>) -> MutexGuard<'_, LoopbackState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone, Debug)]
pub struct LoopbackConnector {
    state: Arc<Mutex<LoopbackState>>,
}

impl Connector for LoopbackConnector {
    type Connection = LoopbackConnection;

    fn connect(&mut self, endpoint: &Url) -> Result<LoopbackConnection> {
        let mut state = lock_state(&self.state);
        state.connect_attempts += 1;
        if state.refuse > 0 {
            state.refuse -= 1;
            return Err(anyhow!("loopback endpoint {} refused connection", endpoint));
        }
        state.generation += 1;
        state.inbound.clear();
        state.client_close = None;
        Ok(LoopbackConnection {
            state: Arc::clone(&self.state),
            generation: state.generation,
        })
    }
}

/// Client side of one loopback connection. Stale once a newer one opens.
#[derive(Debug)]
pub struct LoopbackConnection {
    state: Arc<Mutex<LoopbackState>>,
    generation: u64,
}

impl Connection for LoopbackConnection {
    fn send_text(&mut self, text: &str) -> Result<()> {
        let mut state = lock_state(&self.state);
        if state.generation != self.generation || state.client_close.is_some() {
            return Err(anyhow!("loopback connection is closed"));
        }
        state.sent.push(text.to_string());
        Ok(())
    }

    fn poll_event(&mut self) -> Result<Option<ConnectionEvent>> {
        let mut state = lock_state(&self.state);
        if state.generation != self.generation {
            return Ok(None);
        }
        Ok(state.inbound.pop_front())
    }

    fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        let mut state = lock_state(&self.state);
        if state.generation == self.generation {
            state.client_close = Some((code, reason.to_string()));
        }
        Ok(())
    }
}
