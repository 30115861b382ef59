//! Detection data model.
//!
//! Results arrive from the remote service already normalized by the transport
//! layer. This module holds the typed results and the bounded stores they are
//! recorded into.

mod result;
mod store;

pub use result::{
    BoundingBox, DetectionFrame, LogEntry, ObjectDetection, Point, Severity, TextDetection,
};
pub use store::{
    DetectionStore, HistoryCaps, Stamped, DEFAULT_LOG_HISTORY, DEFAULT_OBJECT_HISTORY,
    DEFAULT_TEXT_HISTORY,
};
