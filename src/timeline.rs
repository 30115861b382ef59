//! Unified event timeline.
//!
//! Merges the log, object and text histories into one feed ordered by
//! timestamp, ties broken by arrival sequence. Each history keeps its own
//! cap; the merge adds none.

use serde::Serialize;
use std::fmt;

use crate::detect::{DetectionStore, LogEntry, ObjectDetection, TextDetection};

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TimelineEvent {
    Log(LogEntry),
    Object(ObjectDetection),
    Text(TextDetection),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TimelineEntry {
    /// Global arrival sequence.
    pub seq: u64,
    /// Epoch milliseconds.
    pub timestamp: u64,
    pub event: TimelineEvent,
}

impl fmt::Display for TimelineEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.event {
            TimelineEvent::Log(entry) => {
                write!(f, "[{}] {}", entry.severity.as_str(), entry.text)
            }
            TimelineEvent::Object(object) => write!(
                f,
                "[object] {} {:.0}% at ({:.0},{:.0})-({:.0},{:.0})",
                object.class,
                object.confidence,
                object.bbox.x1,
                object.bbox.y1,
                object.bbox.x2,
                object.bbox.y2
            ),
            TimelineEvent::Text(region) => write!(
                f,
                "[text] \"{}\" {:.0}%",
                region.text,
                region.confidence * 100.0
            ),
        }
    }
}

/// Merge every history in `store` into one time-ordered sequence.
pub fn merge(store: &DetectionStore) -> Vec<TimelineEntry> {
    let logs = store.logs().iter().map(|stamped| TimelineEntry {
        seq: stamped.seq,
        timestamp: stamped.item.timestamp,
        event: TimelineEvent::Log(stamped.item.clone()),
    });
    let objects = store.objects().iter().map(|stamped| TimelineEntry {
        seq: stamped.seq,
        timestamp: stamped.item.timestamp,
        event: TimelineEvent::Object(stamped.item.clone()),
    });
    let text = store.text().iter().map(|stamped| TimelineEntry {
        seq: stamped.seq,
        timestamp: stamped.item.timestamp,
        event: TimelineEvent::Text(stamped.item.clone()),
    });

    let mut merged: Vec<TimelineEntry> = logs.chain(objects).chain(text).collect();
    merged.sort_by_key(|entry| (entry.timestamp, entry.seq));
    merged
}

/// Cached merge, recomputed when the store's revision changes.
#[derive(Debug, Default)]
pub struct EventTimeline {
    revision: Option<u64>,
    entries: Vec<TimelineEntry>,
}

impl EventTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sync(&mut self, store: &DetectionStore) -> &[TimelineEntry] {
        if self.revision != Some(store.revision()) {
            self.entries = merge(store);
            self.revision = Some(store.revision());
        }
        &self.entries
    }

    /// Last synced entries.
    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    /// Entries that arrived after `seq`, in timeline order.
    pub fn entries_after(&self, seq: Option<u64>) -> impl Iterator<Item = &TimelineEntry> {
        self.entries
            .iter()
            .filter(move |entry| seq.map_or(true, |seen| entry.seq > seen))
    }

    pub fn latest_seq(&self) -> Option<u64> {
        self.entries.iter().map(|entry| entry.seq).max()
    }
}
