//! Detection overlay geometry.
//!
//! `render` is a pure function from the latest detections, the native frame
//! size, the displayed surface size and the mirroring flags to an
//! `OverlayScene` in display pixels. New detections and surface resizes both
//! go through it, so equal inputs always give equal scenes.
//!
//! Mirroring: a selfie-style preview is shown mirrored. Unless frames are
//! already flipped before encoding, detection x coordinates are reflected so
//! boxes line up with the mirrored picture.

use image::{Rgba, RgbaImage};
use serde::Serialize;

use crate::detect::{BoundingBox, DetectionFrame, ObjectDetection, Point, TextDetection};

/// Height reserved for a label above its anchor.
pub const LABEL_HEIGHT: f32 = 16.0;
const LABEL_CHAR_WIDTH: f32 = 7.0;
const LABEL_PADDING: f32 = 4.0;

const OBJECT_COLOR: Rgba<u8> = Rgba([0, 255, 0, 255]);
const TEXT_COLOR: Rgba<u8> = Rgba([255, 200, 0, 255]);
const LABEL_BACKGROUND: Rgba<u8> = Rgba([0, 0, 0, 180]);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Reflect `x` across a surface of `display_width`. Applying it twice is the identity.
pub fn mirror_x(x: f32, display_width: f32) -> f32 {
    display_width - x
}

/// Source-frame to display-surface mapping.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform {
    pub scale_x: f32,
    pub scale_y: f32,
    pub display_width: f32,
    pub reflect: bool,
}

impl Transform {
    /// `None` when either size is empty.
    pub fn new(
        native: Dimensions,
        display: Dimensions,
        flip_horizontal: bool,
        mirror_display: bool,
    ) -> Option<Self> {
        if native.is_empty() || display.is_empty() {
            return None;
        }
        Some(Self {
            scale_x: display.width as f32 / native.width as f32,
            scale_y: display.height as f32 / native.height as f32,
            display_width: display.width as f32,
            reflect: mirror_display && !flip_horizontal,
        })
    }

    pub fn x(&self, x: f32) -> f32 {
        let scaled = x * self.scale_x;
        if self.reflect {
            mirror_x(scaled, self.display_width)
        } else {
            scaled
        }
    }

    pub fn y(&self, y: f32) -> f32 {
        y * self.scale_y
    }

    pub fn point(&self, point: Point) -> Point {
        Point::new(self.x(point.x), self.y(point.y))
    }

    /// A reflected box takes its left edge from `x2` and its right edge from `x1`.
    pub fn rect(&self, bbox: &BoundingBox) -> Rect {
        let (left, right) = if self.reflect {
            (self.x(bbox.x2), self.x(bbox.x1))
        } else {
            (self.x(bbox.x1), self.x(bbox.x2))
        };
        Rect {
            left,
            top: self.y(bbox.y1),
            right,
            bottom: self.y(bbox.y2),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct Rect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl Rect {
    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Label {
    pub text: String,
    /// Top-left of the label bar.
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Label {
    /// Place `text` above the anchor, never above the visible area.
    fn anchored(text: String, anchor: Point) -> Self {
        let width = text.chars().count() as f32 * LABEL_CHAR_WIDTH + LABEL_PADDING;
        Self {
            text,
            x: anchor.x,
            y: (anchor.y - LABEL_HEIGHT).max(0.0),
            width,
            height: LABEL_HEIGHT,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "shape", rename_all = "lowercase")]
pub enum OverlayShape {
    Box { rect: Rect, label: Label },
    Polygon { points: [Point; 4], label: Label },
}

impl OverlayShape {
    pub fn label(&self) -> &Label {
        match self {
            OverlayShape::Box { label, .. } | OverlayShape::Polygon { label, .. } => label,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct OverlayScene {
    pub display: Dimensions,
    pub shapes: Vec<OverlayShape>,
}

impl OverlayScene {
    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct OverlayInput<'a> {
    pub objects: &'a [ObjectDetection],
    pub text: &'a [TextDetection],
    pub native: Dimensions,
    pub display: Dimensions,
    pub flip_horizontal: bool,
    pub mirror_display: bool,
}

pub fn render(input: &OverlayInput<'_>) -> OverlayScene {
    let Some(transform) = Transform::new(
        input.native,
        input.display,
        input.flip_horizontal,
        input.mirror_display,
    ) else {
        return OverlayScene {
            display: input.display,
            shapes: Vec::new(),
        };
    };

    let mut shapes = Vec::with_capacity(input.objects.len() + input.text.len());
    for object in input.objects {
        let rect = transform.rect(&object.bbox);
        let label = Label::anchored(
            format!("{} {:.0}%", object.class, object.confidence),
            Point::new(rect.left, rect.top),
        );
        shapes.push(OverlayShape::Box { rect, label });
    }
    for region in input.text {
        let points = region.polygon.map(|point| transform.point(point));
        let anchor = points.iter().fold(
            Point::new(f32::INFINITY, f32::INFINITY),
            |acc, point| Point::new(acc.x.min(point.x), acc.y.min(point.y)),
        );
        let label = Label::anchored(
            format!("{} {:.0}%", region.text, region.confidence * 100.0),
            anchor,
        );
        shapes.push(OverlayShape::Polygon { points, label });
    }

    OverlayScene {
        display: input.display,
        shapes,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SceneKey {
    revision: u64,
    native: Dimensions,
    display: Dimensions,
    flip_horizontal: bool,
    mirror_display: bool,
}

/// Holds display-side settings and the last rendered scene.
///
/// The scene is re-rendered only when the detections' revision or any
/// geometry input changes.
#[derive(Debug)]
pub struct OverlayRenderer {
    display: Dimensions,
    flip_horizontal: bool,
    mirror_display: bool,
    key: Option<SceneKey>,
    scene: OverlayScene,
}

impl OverlayRenderer {
    pub fn new(display: Dimensions, flip_horizontal: bool, mirror_display: bool) -> Self {
        Self {
            display,
            flip_horizontal,
            mirror_display,
            key: None,
            scene: OverlayScene::default(),
        }
    }

    pub fn display(&self) -> Dimensions {
        self.display
    }

    pub fn resize(&mut self, display: Dimensions) {
        self.display = display;
    }

    pub fn set_flip_horizontal(&mut self, flip: bool) {
        self.flip_horizontal = flip;
    }

    pub fn set_mirror_display(&mut self, mirror: bool) {
        self.mirror_display = mirror;
    }

    /// Scene for `frame`, re-rendered when `revision` or the geometry changed.
    pub fn scene(
        &mut self,
        frame: Option<&DetectionFrame>,
        native: Dimensions,
        revision: u64,
    ) -> &OverlayScene {
        let key = SceneKey {
            revision,
            native,
            display: self.display,
            flip_horizontal: self.flip_horizontal,
            mirror_display: self.mirror_display,
        };
        if self.key != Some(key) {
            let (objects, text) = match frame {
                Some(frame) => (frame.objects.as_slice(), frame.text.as_slice()),
                None => (&[][..], &[][..]),
            };
            self.scene = render(&OverlayInput {
                objects,
                text,
                native,
                display: self.display,
                flip_horizontal: self.flip_horizontal,
                mirror_display: self.mirror_display,
            });
            self.key = Some(key);
        }
        &self.scene
    }
}

/// Paint `scene` onto a display raster: box outlines, polygon edges and
/// label bars. Shapes outside the raster are clipped.
pub fn paint(scene: &OverlayScene, image: &mut RgbaImage) {
    if image.width() == 0 || image.height() == 0 {
        return;
    }
    for shape in &scene.shapes {
        match shape {
            OverlayShape::Box { rect, .. } => draw_rectangle(
                image,
                rect.left.round() as i32,
                rect.top.round() as i32,
                rect.right.round() as i32,
                rect.bottom.round() as i32,
                OBJECT_COLOR,
            ),
            OverlayShape::Polygon { points, .. } => {
                for i in 0..points.len() {
                    let a = points[i];
                    let b = points[(i + 1) % points.len()];
                    draw_line(image, a, b, TEXT_COLOR);
                }
            }
        }
    }
    for shape in &scene.shapes {
        let label = shape.label();
        fill_rect(
            image,
            label.x.round() as i32,
            label.y.round() as i32,
            (label.x + label.width).round() as i32,
            (label.y + label.height).round() as i32 - 1,
            LABEL_BACKGROUND,
        );
    }
}

fn put_pixel(image: &mut RgbaImage, x: i32, y: i32, color: Rgba<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
        image.put_pixel(x as u32, y as u32, color);
    }
}

fn draw_rectangle(
    image: &mut RgbaImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgba<u8>,
) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    let (left, right) = (left.min(right), left.max(right));
    let (top, bottom) = (top.min(bottom), top.max(bottom));
    if right < 0 || bottom < 0 || left >= width || top >= height {
        return;
    }
    // Edges are walked over the visible span only.
    let (x_from, x_to) = (left.max(0), right.min(width - 1));
    let (y_from, y_to) = (top.max(0), bottom.min(height - 1));
    for x in x_from..=x_to {
        put_pixel(image, x, top, color);
        put_pixel(image, x, bottom, color);
    }
    for y in y_from..=y_to {
        put_pixel(image, left, y, color);
        put_pixel(image, right, y, color);
    }
}

fn fill_rect(
    image: &mut RgbaImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgba<u8>,
) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    if right < 0 || bottom < 0 || left >= width || top >= height || left > right || top > bottom {
        return;
    }
    let left = left.max(0);
    let right = right.min(width - 1);
    let top = top.max(0);
    let bottom = bottom.min(height - 1);
    for y in top..=bottom {
        for x in left..=right {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

/// Liang-Barsky clip of a segment to `[0, width-1] x [0, height-1]`.
fn clip_segment(from: Point, to: Point, width: u32, height: u32) -> Option<(Point, Point)> {
    if ![from.x, from.y, to.x, to.y].iter().all(|v| v.is_finite()) {
        return None;
    }
    // f64 keeps small raster offsets visible next to huge coordinates.
    let (x0, y0) = (from.x as f64, from.y as f64);
    let (x_max, y_max) = ((width - 1) as f64, (height - 1) as f64);
    let dx = to.x as f64 - x0;
    let dy = to.y as f64 - y0;
    let mut t0 = 0.0f64;
    let mut t1 = 1.0f64;
    for (p, q) in [(-dx, x0), (dx, x_max - x0), (-dy, y0), (dy, y_max - y0)] {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
            continue;
        }
        let r = q / p;
        if p < 0.0 {
            if r > t1 {
                return None;
            }
            t0 = t0.max(r);
        } else {
            if r < t0 {
                return None;
            }
            t1 = t1.min(r);
        }
    }
    Some((
        Point::new((x0 + dx * t0) as f32, (y0 + dy * t0) as f32),
        Point::new((x0 + dx * t1) as f32, (y0 + dy * t1) as f32),
    ))
}

fn draw_line(image: &mut RgbaImage, from: Point, to: Point, color: Rgba<u8>) {
    let Some((from, to)) = clip_segment(from, to, image.width(), image.height()) else {
        return;
    };
    let dx = to.x - from.x;
    let dy = to.y - from.y;
    let steps = dx.abs().max(dy.abs()).ceil().max(1.0) as i32;
    for step in 0..=steps {
        let t = step as f32 / steps as f32;
        put_pixel(
            image,
            (from.x + dx * t).round() as i32,
            (from.y + dy * t).round() as i32,
            color,
        );
    }
}
