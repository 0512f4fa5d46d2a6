mod style;
mod surface;
mod topology;

pub use style::{alert_style, behavior_caption, prediction_style, AlertStyle, BoxStyle, Color};
pub use surface::{load_font, RasterSurface, Surface};
pub use topology::{joint_region, JointRegion, POSE_EDGES};

use ab_glyph::FontArc;
use guardian_proto::{Alert, AnnotationMessage, BoundingBox, Keypoint, Prediction};
use image::RgbaImage;
use parking_lot::RwLock;
use std::sync::Arc;

const CHIP_HEIGHT: f32 = 20.0;
const CHIP_PADDING: f32 = 5.0;
const CHAR_WIDTH: f32 = 9.0;
const LABEL_TEXT_SIZE: f32 = 16.0;
const SKELETON_WIDTH: u32 = 2;
const JOINT_RADIUS: f32 = 4.0;

#[derive(Debug, Clone, PartialEq)]
pub enum DrawOp {
    Clear,
    StrokeRect {
        rect: BoundingBox,
        color: Color,
        width: u32,
        dashed: bool,
    },
    FillRect {
        rect: BoundingBox,
        color: Color,
    },
    Text {
        origin: (f32, f32),
        text: String,
        color: Color,
        size: f32,
    },
    Line {
        from: (f32, f32),
        to: (f32, f32),
        color: Color,
        width: u32,
    },
    Joint {
        center: (f32, f32),
        radius: f32,
        color: Color,
    },
}

impl DrawOp {
    pub fn apply(&self, surface: &mut dyn Surface) {
        match self {
            DrawOp::Clear => surface.clear(),
            DrawOp::StrokeRect {
                rect,
                color,
                width,
                dashed,
            } => surface.stroke_rect(rect, *color, *width, *dashed),
            DrawOp::FillRect { rect, color } => surface.fill_rect(rect, *color),
            DrawOp::Text {
                origin,
                text,
                color,
                size,
            } => surface.text(*origin, text, *color, *size),
            DrawOp::Line {
                from,
                to,
                color,
                width,
            } => surface.line(*from, *to, *color, *width),
            DrawOp::Joint {
                center,
                radius,
                color,
            } => surface.joint(*center, *radius, *color),
        }
    }
}

struct CanvasState {
    attached: bool,
    width: u32,
    height: u32,
    ops: Vec<DrawOp>,
}

/// The visible overlay: the display list of the latest rendered message.
///
/// Cloning shares the same overlay. Once detached, renders are ignored.
#[derive(Clone)]
pub struct OverlayCanvas {
    state: Arc<RwLock<CanvasState>>,
}

impl OverlayCanvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            state: Arc::new(RwLock::new(CanvasState {
                attached: true,
                width,
                height,
                ops: Vec::new(),
            })),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        let state = self.state.read();
        (state.width, state.height)
    }

    pub fn is_attached(&self) -> bool {
        self.state.read().attached
    }

    pub fn attach(&self) {
        self.state.write().attached = true;
    }

    pub fn detach(&self) {
        let mut state = self.state.write();
        state.attached = false;
        state.ops.clear();
    }

    pub fn clear(&self) {
        self.state.write().ops.clear();
    }

    /// Swaps in a new display list. Returns `false` when detached.
    fn replace(&self, ops: Vec<DrawOp>) -> bool {
        let mut state = self.state.write();
        if !state.attached {
            return false;
        }
        state.ops = ops;
        true
    }

    pub fn ops(&self) -> Vec<DrawOp> {
        self.state.read().ops.clone()
    }

    pub fn paint(&self, surface: &mut dyn Surface) {
        for op in self.state.read().ops.iter() {
            op.apply(surface);
        }
    }

    pub fn rasterize(&self, font: Option<&FontArc>) -> RgbaImage {
        let (width, height) = self.dimensions();
        let mut surface = RasterSurface::new(width, height, font);
        self.paint(&mut surface);
        surface.into_image()
    }
}

/// Turns annotation messages into overlay draw operations.
///
/// Output depends only on the message and the scale; nothing carries over
/// from previous messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnnotationRenderer;

impl AnnotationRenderer {
    pub fn new() -> Self {
        Self
    }

    /// Renders onto `canvas`; a detached canvas makes this a no-op.
    pub fn render(&self, message: &AnnotationMessage, canvas: &OverlayCanvas, scale: f32) -> bool {
        let rendered = canvas.replace(self.plan(message, scale));
        if !rendered {
            tracing::debug!("Overlay detached, dropping annotation");
        }
        rendered
    }

    pub fn plan(&self, message: &AnnotationMessage, scale: f32) -> Vec<DrawOp> {
        let mut ops = vec![DrawOp::Clear];
        for prediction in &message.predictions {
            self.plan_prediction(prediction, scale, &mut ops);
        }
        for alert in &message.alerts {
            self.plan_alert(alert, scale, &mut ops);
        }
        ops
    }

    fn plan_prediction(&self, prediction: &Prediction, scale: f32, ops: &mut Vec<DrawOp>) {
        let style = prediction_style(&prediction.label);
        let rect = prediction.bbox.scaled(scale);

        ops.push(DrawOp::StrokeRect {
            rect,
            color: style.color,
            width: style.stroke_width,
            dashed: false,
        });

        let text = chip_text(prediction);
        let chip_width = text.chars().count() as f32 * CHAR_WIDTH + 2.0 * CHIP_PADDING;
        ops.push(DrawOp::FillRect {
            rect: BoundingBox::new(rect.x1, rect.y1 - CHIP_HEIGHT, rect.x1 + chip_width, rect.y1),
            color: style.color,
        });
        ops.push(DrawOp::Text {
            origin: (rect.x1 + CHIP_PADDING, rect.y1 - CHIP_HEIGHT + 2.0),
            text,
            color: style.text_color,
            size: LABEL_TEXT_SIZE,
        });

        if let Some(keypoints) = &prediction.keypoints {
            plan_skeleton(keypoints, scale, ops);
        }
    }

    fn plan_alert(&self, alert: &Alert, scale: f32, ops: &mut Vec<DrawOp>) {
        let style = alert_style(alert.kind);
        let rect = alert.bbox.scaled(scale);

        ops.push(DrawOp::StrokeRect {
            rect,
            color: style.color,
            width: style.stroke_width,
            dashed: style.dashed,
        });
        ops.push(DrawOp::Text {
            origin: (rect.x1, rect.y1 - CHIP_HEIGHT - LABEL_TEXT_SIZE),
            text: alert_caption(alert, &style),
            color: style.color,
            size: LABEL_TEXT_SIZE,
        });
    }
}

fn chip_text(prediction: &Prediction) -> String {
    let percent = (prediction.score * 100.0).round() as u32;
    match prediction.track_id {
        Some(id) => format!("{} {}% #{}", prediction.label, percent, id),
        None => format!("{} {}%", prediction.label, percent),
    }
}

fn alert_caption(alert: &Alert, style: &AlertStyle) -> String {
    match alert.behaviors.as_deref() {
        Some(behaviors) if !behaviors.is_empty() => {
            let described: Vec<String> = behaviors.iter().map(|b| behavior_caption(b)).collect();
            format!("{}: {}", style.caption, described.join(", "))
        }
        _ => style.caption.to_string(),
    }
}

fn plan_skeleton(keypoints: &[Keypoint], scale: f32, ops: &mut Vec<DrawOp>) {
    let point = |kp: &Keypoint| (kp.x * scale, kp.y * scale);

    for &(a, b) in POSE_EDGES.iter() {
        let (Some(start), Some(end)) = (keypoints.get(a), keypoints.get(b)) else {
            continue;
        };
        if start.is_visible() && end.is_visible() {
            ops.push(DrawOp::Line {
                from: point(start),
                to: point(end),
                color: style::SKELETON,
                width: SKELETON_WIDTH,
            });
        }
    }

    for (index, keypoint) in keypoints.iter().enumerate() {
        if keypoint.is_visible() {
            ops.push(DrawOp::Joint {
                center: point(keypoint),
                radius: JOINT_RADIUS,
                color: style::joint_color(joint_region(index)),
            });
        }
    }
}
