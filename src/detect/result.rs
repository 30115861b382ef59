use serde::Serialize;

/// Axis-aligned box in source-frame pixel space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    /// Corner points clockwise from the top-left.
    pub fn corners(&self) -> [Point; 4] {
        [
            Point::new(self.x1, self.y1),
            Point::new(self.x2, self.y1),
            Point::new(self.x2, self.y2),
            Point::new(self.x1, self.y2),
        ]
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Object detected by the remote service.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ObjectDetection {
    pub class: String,
    /// Percentage, 0..=100.
    pub confidence: f32,
    pub bbox: BoundingBox,
    /// Epoch milliseconds.
    pub timestamp: u64,
}

/// Recognized text region.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TextDetection {
    pub text: String,
    /// Fraction, 0.0..=1.0.
    pub confidence: f32,
    pub polygon: [Point; 4],
    /// Epoch milliseconds.
    pub timestamp: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    /// Lenient parse used for service-provided levels. Unknown levels are `Info`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "warn" | "warning" => Severity::Warning,
            "error" | "fatal" => Severity::Error,
            _ => Severity::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LogEntry {
    pub severity: Severity,
    pub text: String,
    /// Epoch milliseconds.
    pub timestamp: u64,
}

impl LogEntry {
    pub fn new(severity: Severity, text: impl Into<String>, timestamp: u64) -> Self {
        Self {
            severity,
            text: text.into(),
            timestamp,
        }
    }

    pub fn info(text: impl Into<String>, timestamp: u64) -> Self {
        Self::new(Severity::Info, text, timestamp)
    }

    pub fn warning(text: impl Into<String>, timestamp: u64) -> Self {
        Self::new(Severity::Warning, text, timestamp)
    }

    pub fn error(text: impl Into<String>, timestamp: u64) -> Self {
        Self::new(Severity::Error, text, timestamp)
    }
}

/// Detections belonging to the most recent result; what the overlay draws.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionFrame {
    pub objects: Vec<ObjectDetection>,
    pub text: Vec<TextDetection>,
    /// Epoch milliseconds at receipt.
    pub received_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corners_run_clockwise_from_top_left() {
        let bbox = BoundingBox {
            x1: 1.0,
            y1: 2.0,
            x2: 3.0,
            y2: 4.0,
        };
        let c = bbox.corners();
        assert_eq!(c[0], Point::new(1.0, 2.0));
        assert_eq!(c[1], Point::new(3.0, 2.0));
        assert_eq!(c[2], Point::new(3.0, 4.0));
        assert_eq!(c[3], Point::new(1.0, 4.0));
    }

    #[test]
    fn severity_labels_are_lenient() {
        assert_eq!(Severity::from_label("WARN"), Severity::Warning);
        assert_eq!(Severity::from_label("error"), Severity::Error);
        assert_eq!(Severity::from_label("detection"), Severity::Info);
        assert_eq!(Severity::Warning.as_str(), "warning");
    }
}
