use crate::history::BoundedHistory;

use super::result::{DetectionFrame, LogEntry, ObjectDetection, TextDetection};

pub const DEFAULT_OBJECT_HISTORY: usize = 50;
pub const DEFAULT_TEXT_HISTORY: usize = 50;
pub const DEFAULT_LOG_HISTORY: usize = 100;

/// Per-source history caps. Each history enforces its own cap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HistoryCaps {
    pub objects: usize,
    pub text: usize,
    pub logs: usize,
}

impl Default for HistoryCaps {
    fn default() -> Self {
        Self {
            objects: DEFAULT_OBJECT_HISTORY,
            text: DEFAULT_TEXT_HISTORY,
            logs: DEFAULT_LOG_HISTORY,
        }
    }
}

/// A history entry tagged with its global arrival order.
#[derive(Clone, Debug, PartialEq)]
pub struct Stamped<T> {
    pub seq: u64,
    pub item: T,
}

/// Detection and log histories plus the current-frame slot.
///
/// Written only by the pipeline's inbound handler. `revision()` changes on
/// every mutation so readers can recompute derived views lazily.
#[derive(Debug)]
pub struct DetectionStore {
    objects: BoundedHistory<Stamped<ObjectDetection>>,
    text: BoundedHistory<Stamped<TextDetection>>,
    logs: BoundedHistory<Stamped<LogEntry>>,
    current: Option<DetectionFrame>,
    next_seq: u64,
    revision: u64,
}

impl DetectionStore {
    pub fn new(caps: HistoryCaps) -> Self {
        Self {
            objects: BoundedHistory::new(caps.objects),
            text: BoundedHistory::new(caps.text),
            logs: BoundedHistory::new(caps.logs),
            current: None,
            next_seq: 0,
            revision: 0,
        }
    }

    /// Record a `result` message: replaces the current frame and appends to
    /// every history. Service-provided log lines are appended after detections.
    pub fn record_result(
        &mut self,
        objects: Vec<ObjectDetection>,
        text: Vec<TextDetection>,
        logs: Vec<LogEntry>,
        received_at: u64,
    ) {
        for object in &objects {
            let seq = self.bump_seq();
            self.objects.push(Stamped {
                seq,
                item: object.clone(),
            });
        }
        for region in &text {
            let seq = self.bump_seq();
            self.text.push(Stamped {
                seq,
                item: region.clone(),
            });
        }
        for entry in logs {
            let seq = self.bump_seq();
            self.logs.push(Stamped { seq, item: entry });
        }
        self.current = Some(DetectionFrame {
            objects,
            text,
            received_at,
        });
        self.revision += 1;
    }

    pub fn push_log(&mut self, entry: LogEntry) {
        let seq = self.bump_seq();
        self.logs.push(Stamped { seq, item: entry });
        self.revision += 1;
    }

    /// Latest result, if any arrived since the session started.
    pub fn current(&self) -> Option<&DetectionFrame> {
        self.current.as_ref()
    }

    pub fn objects(&self) -> &BoundedHistory<Stamped<ObjectDetection>> {
        &self.objects
    }

    pub fn text(&self) -> &BoundedHistory<Stamped<TextDetection>> {
        &self.text
    }

    pub fn logs(&self) -> &BoundedHistory<Stamped<LogEntry>> {
        &self.logs
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Drop all histories and the current frame. Sequence numbers keep counting.
    pub fn clear(&mut self) {
        self.objects.clear();
        self.text.clear();
        self.logs.clear();
        self.current = None;
        self.revision += 1;
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}
