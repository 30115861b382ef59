//! Detection channel wire protocol.
//!
//! UTF-8 JSON text frames tagged by `kind`. Inbound payloads are normalized
//! here so nothing past the channel boundary branches on payload shape:
//! - `objects` / `detections` both name the object list
//! - `text` / `text_detections` may be an array or an `{ "text_detections": [...] }` envelope
//! - text geometry may be a 4-point `polygon`, a 4-point `bbox`, or a `{x1,y1,x2,y2}` box
//! - text confidence above 1.0 is a percentage
//! - timestamps are optional; seconds are promoted to milliseconds

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::detect::{BoundingBox, LogEntry, ObjectDetection, Point, Severity, TextDetection};

/// Close code for an explicit, client-initiated disconnect. Suppresses reconnect.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code used when the connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Values below this are taken to be epoch seconds rather than milliseconds.
const EPOCH_MILLIS_FLOOR: f64 = 100_000_000_000.0;

pub fn is_explicit_disconnect(code: u16) -> bool {
    code == CLOSE_NORMAL
}

/// Client → service messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OutboundMessage {
    Frame { image: String },
    Ping,
}

impl OutboundMessage {
    pub fn frame(image: String) -> Self {
        OutboundMessage::Frame { image }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| anyhow!("encode outbound message: {}", e))
    }
}

/// Service → client messages, normalized.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundMessage {
    Connected,
    Result(DetectionResult),
    Error { message: String },
    Pong,
    /// Unrecognized tag; ignored by the channel.
    Unknown(String),
}

/// Body of a `result` message.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionResult {
    pub objects: Vec<ObjectDetection>,
    pub text: Vec<TextDetection>,
    pub logs: Vec<LogEntry>,
}

#[derive(Debug, Deserialize)]
struct WireResult {
    #[serde(default, alias = "detections")]
    objects: Vec<WireObject>,
    #[serde(default, alias = "text_detections")]
    text: Option<WireTextPayload>,
    #[serde(default)]
    logs: Vec<WireLog>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireTextPayload {
    List(Vec<WireText>),
    Envelope {
        #[serde(default)]
        text_detections: Vec<WireText>,
    },
    /// Some services send only the joined text; it carries no regions.
    Plain(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireGeometry {
    Rect { x1: f32, y1: f32, x2: f32, y2: f32 },
    Points(Vec<[f32; 2]>),
}

#[derive(Debug, Deserialize)]
struct WireObject {
    #[serde(alias = "class_name", alias = "label")]
    class: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    bbox: Option<WireGeometry>,
    #[serde(default)]
    timestamp: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WireText {
    text: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    polygon: Option<Vec<[f32; 2]>>,
    #[serde(default)]
    bbox: Option<WireGeometry>,
    #[serde(default)]
    timestamp: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WireLog {
    #[serde(alias = "message")]
    text: String,
    #[serde(default, alias = "level", alias = "type")]
    severity: Option<String>,
    #[serde(default)]
    timestamp: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default, alias = "detail")]
    message: Option<String>,
}

/// Parse one inbound text frame.
///
/// `received_at` (epoch ms) stands in for missing timestamps. Returns an error
/// for malformed JSON, a missing tag, or a body that does not match its tag;
/// unknown tags are not errors.
pub fn parse_inbound(text: &str, received_at: u64) -> Result<InboundMessage> {
    let value: Value = serde_json::from_str(text).map_err(|e| anyhow!("parse error: {}", e))?;
    let tag = value
        .get("kind")
        .or_else(|| value.get("type"))
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("message missing 'kind' tag"))?
        .to_string();

    let message = match tag.as_str() {
        "connected" => InboundMessage::Connected,
        "pong" => InboundMessage::Pong,
        "error" => {
            let wire: WireError = serde_json::from_value(value)
                .map_err(|e| anyhow!("invalid error message: {}", e))?;
            InboundMessage::Error {
                message: wire
                    .message
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| "detection service reported an error".to_string()),
            }
        }
        "result" => {
            let wire: WireResult = serde_json::from_value(value)
                .map_err(|e| anyhow!("invalid result message: {}", e))?;
            InboundMessage::Result(normalize_result(wire, received_at))
        }
        _ => InboundMessage::Unknown(tag),
    };
    Ok(message)
}

fn normalize_result(wire: WireResult, received_at: u64) -> DetectionResult {
    let objects = wire
        .objects
        .into_iter()
        .filter_map(|object| {
            let Some(bbox) = object.bbox.as_ref().and_then(geometry_bounds) else {
                log::debug!("dropping object '{}' without usable bbox", object.class);
                return None;
            };
            Some(ObjectDetection {
                class: object.class,
                confidence: object.confidence.clamp(0.0, 100.0),
                bbox,
                timestamp: wire_timestamp(object.timestamp.as_ref(), received_at),
            })
        })
        .collect();

    let text_items = match wire.text {
        Some(WireTextPayload::List(items)) => items,
        Some(WireTextPayload::Envelope { text_detections }) => text_detections,
        Some(WireTextPayload::Plain(_)) | None => Vec::new(),
    };
    let text = text_items
        .into_iter()
        .filter_map(|item| {
            let Some(polygon) = text_polygon(&item) else {
                log::debug!("dropping text '{}' without usable geometry", item.text);
                return None;
            };
            Some(TextDetection {
                text: item.text,
                confidence: normalize_fraction(item.confidence),
                polygon,
                timestamp: wire_timestamp(item.timestamp.as_ref(), received_at),
            })
        })
        .collect();

    let logs = wire
        .logs
        .into_iter()
        .map(|entry| {
            LogEntry::new(
                entry
                    .severity
                    .as_deref()
                    .map(Severity::from_label)
                    .unwrap_or(Severity::Info),
                entry.text,
                wire_timestamp(entry.timestamp.as_ref(), received_at),
            )
        })
        .collect();

    DetectionResult {
        objects,
        text,
        logs,
    }
}

fn text_polygon(item: &WireText) -> Option<[Point; 4]> {
    if let Some(points) = item.polygon.as_deref() {
        if let Some(polygon) = quad(points) {
            return Some(polygon);
        }
    }
    match item.bbox.as_ref()? {
        WireGeometry::Points(points) => quad(points),
        rect @ WireGeometry::Rect { .. } => geometry_bounds(rect).map(|bbox| bbox.corners()),
    }
}

/// Exactly four points are used as-is; any other non-empty set collapses to its bounds.
fn quad(points: &[[f32; 2]]) -> Option<[Point; 4]> {
    if let [a, b, c, d] = points {
        return Some([
            Point::new(a[0], a[1]),
            Point::new(b[0], b[1]),
            Point::new(c[0], c[1]),
            Point::new(d[0], d[1]),
        ]);
    }
    point_bounds(points).map(|bbox| bbox.corners())
}

fn geometry_bounds(geometry: &WireGeometry) -> Option<BoundingBox> {
    match geometry {
        WireGeometry::Rect { x1, y1, x2, y2 } => Some(BoundingBox {
            x1: x1.min(*x2),
            y1: y1.min(*y2),
            x2: x1.max(*x2),
            y2: y1.max(*y2),
        }),
        WireGeometry::Points(points) => point_bounds(points),
    }
}

fn point_bounds(points: &[[f32; 2]]) -> Option<BoundingBox> {
    let first = points.first()?;
    let mut bbox = BoundingBox {
        x1: first[0],
        y1: first[1],
        x2: first[0],
        y2: first[1],
    };
    for p in &points[1..] {
        bbox.x1 = bbox.x1.min(p[0]);
        bbox.y1 = bbox.y1.min(p[1]);
        bbox.x2 = bbox.x2.max(p[0]);
        bbox.y2 = bbox.y2.max(p[1]);
    }
    Some(bbox)
}

fn normalize_fraction(confidence: f32) -> f32 {
    let value = if confidence > 1.0 {
        confidence / 100.0
    } else {
        confidence
    };
    value.clamp(0.0, 1.0)
}

fn wire_timestamp(value: Option<&Value>, fallback: u64) -> u64 {
    let Some(raw) = value.and_then(Value::as_f64) else {
        return fallback;
    };
    if !raw.is_finite() || raw < 0.0 {
        return fallback;
    }
    if raw < EPOCH_MILLIS_FLOOR {
        (raw * 1000.0) as u64
    } else {
        raw as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000_000;

    #[test]
    fn frame_message_wire_format() {
        let json = OutboundMessage::frame("data:image/jpeg;base64,AAAA".to_string())
            .to_json()
            .unwrap();
        assert_eq!(
            json,
            r#"{"kind":"frame","image":"data:image/jpeg;base64,AAAA"}"#
        );
        assert_eq!(OutboundMessage::Ping.to_json().unwrap(), r#"{"kind":"ping"}"#);
    }

    #[test]
    fn parses_control_messages() {
        assert_eq!(
            parse_inbound(r#"{"kind":"connected"}"#, NOW).unwrap(),
            InboundMessage::Connected
        );
        assert_eq!(
            parse_inbound(r#"{"kind":"pong"}"#, NOW).unwrap(),
            InboundMessage::Pong
        );
        assert_eq!(
            parse_inbound(r#"{"type":"error","message":"model not loaded"}"#, NOW).unwrap(),
            InboundMessage::Error {
                message: "model not loaded".to_string()
            }
        );
    }

    #[test]
    fn unknown_tag_is_not_an_error() {
        assert_eq!(
            parse_inbound(r#"{"kind":"depth","map":[]}"#, NOW).unwrap(),
            InboundMessage::Unknown("depth".to_string())
        );
    }

    #[test]
    fn malformed_messages_are_errors() {
        assert!(parse_inbound("not json", NOW).is_err());
        assert!(parse_inbound(r#"{"objects":[]}"#, NOW).is_err());
        assert!(parse_inbound(r#"{"kind":"result","objects":"nope"}"#, NOW).is_err());
    }

    #[test]
    fn parses_result_with_objects_text_and_logs() {
        let json = r#"{
            "kind": "result",
            "objects": [
                {"class": "person", "confidence": 87.5,
                 "bbox": {"x1": 100, "y1": 50, "x2": 200, "y2": 150},
                 "timestamp": 1700000000123}
            ],
            "text": [
                {"text": "EXIT", "confidence": 0.92,
                 "polygon": [[10, 10], [60, 12], [60, 30], [10, 28]]}
            ],
            "logs": [
                {"severity": "warning", "text": "low light"}
            ]
        }"#;
        let InboundMessage::Result(result) = parse_inbound(json, NOW).unwrap() else {
            panic!("expected result");
        };
        assert_eq!(result.objects.len(), 1);
        let person = &result.objects[0];
        assert_eq!(person.class, "person");
        assert_eq!(person.bbox.x2, 200.0);
        assert_eq!(person.timestamp, 1_700_000_000_123);

        assert_eq!(result.text.len(), 1);
        assert_eq!(result.text[0].polygon[1], Point::new(60.0, 12.0));
        assert_eq!(result.text[0].timestamp, NOW);

        assert_eq!(result.logs.len(), 1);
        assert_eq!(result.logs[0].severity, Severity::Warning);
        assert_eq!(result.logs[0].text, "low light");
    }

    #[test]
    fn normalizes_ocr_envelope_and_bbox_shapes() {
        let json = r#"{
            "kind": "result",
            "detections": [],
            "text_detections": {
                "count": 2,
                "full_text": "STOP 42",
                "text_detections": [
                    {"text": "STOP", "confidence": 91.0,
                     "bbox": {"x1": 5, "y1": 6, "x2": 25, "y2": 16}},
                    {"text": "42", "confidence": 0.5,
                     "bbox": [[1, 1], [9, 1], [9, 5], [1, 5]]}
                ]
            }
        }"#;
        let InboundMessage::Result(result) = parse_inbound(json, NOW).unwrap() else {
            panic!("expected result");
        };
        assert_eq!(result.text.len(), 2);
        let stop = &result.text[0];
        assert!((stop.confidence - 0.91).abs() < 1e-6);
        assert_eq!(stop.polygon[0], Point::new(5.0, 6.0));
        assert_eq!(stop.polygon[2], Point::new(25.0, 16.0));
        assert_eq!(result.text[1].polygon[3], Point::new(1.0, 5.0));
    }

    #[test]
    fn items_without_geometry_are_dropped() {
        let json = r#"{"kind":"result","text":[{"text":"floating"}],
                       "objects":[{"class":"cup","bbox":[]}]}"#;
        let InboundMessage::Result(result) = parse_inbound(json, NOW).unwrap() else {
            panic!("expected result");
        };
        assert!(result.text.is_empty());
        assert!(result.objects.is_empty());
    }

    #[test]
    fn missing_bbox_drops_only_that_object() {
        let json = r#"{"kind":"result",
                       "objects":[{"class":"cup","confidence":50},
                                  {"class":"dog","confidence":80,"bbox":{"x1":1,"y1":2,"x2":3,"y2":4}}],
                       "logs":[{"severity":"info","text":"2 objects"}]}"#;
        let InboundMessage::Result(result) = parse_inbound(json, NOW).unwrap() else {
            panic!("expected result");
        };
        assert_eq!(result.objects.len(), 1);
        assert_eq!(result.objects[0].class, "dog");
        assert_eq!(result.logs.len(), 1);
    }

    #[test]
    fn log_aliases_and_second_timestamps() {
        let json = r#"{"kind":"result","logs":[
            {"message":"scene changed","level":"WARN","timestamp":1700000000.5}
        ]}"#;
        let InboundMessage::Result(result) = parse_inbound(json, NOW).unwrap() else {
            panic!("expected result");
        };
        assert_eq!(result.logs[0].severity, Severity::Warning);
        assert_eq!(result.logs[0].timestamp, 1_700_000_000_500);
    }

    #[test]
    fn non_numeric_timestamps_fall_back_to_receipt_time() {
        let json = r#"{"kind":"result","objects":[
            {"class":"cup","confidence":50,"bbox":{"x1":0,"y1":0,"x2":1,"y2":1},
             "timestamp":"2024-01-01T00:00:00"}
        ]}"#;
        let InboundMessage::Result(result) = parse_inbound(json, NOW).unwrap() else {
            panic!("expected result");
        };
        assert_eq!(result.objects[0].timestamp, NOW);
    }

    #[test]
    fn close_code_classification() {
        assert!(is_explicit_disconnect(CLOSE_NORMAL));
        assert!(!is_explicit_disconnect(CLOSE_ABNORMAL));
        assert!(!is_explicit_disconnect(1011));
    }
}
