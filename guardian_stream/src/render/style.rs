use super::topology::JointRegion;
use guardian_proto::AlertKind;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

pub const GREEN: Color = Color::rgb(0, 255, 0);
pub const RED: Color = Color::rgb(255, 0, 0);
pub const MAGENTA: Color = Color::rgb(255, 0, 255);
pub const ORANGE: Color = Color::rgb(255, 165, 0);
pub const BLACK: Color = Color::rgb(0, 0, 0);
pub const WHITE: Color = Color::rgb(255, 255, 255);
pub const SKELETON: Color = Color::rgb(0, 255, 255);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxStyle {
    pub color: Color,
    pub text_color: Color,
    pub stroke_width: u32,
}

const GENERIC_STYLE: BoxStyle = BoxStyle {
    color: GREEN,
    text_color: BLACK,
    stroke_width: 3,
};

const HAZARD_STYLE: BoxStyle = BoxStyle {
    color: RED,
    text_color: WHITE,
    stroke_width: 5,
};

/// Labels with their own styling; everything else uses [`GENERIC_STYLE`].
const LABEL_STYLES: &[(&str, BoxStyle)] = &[("fire", HAZARD_STYLE), ("smoke", HAZARD_STYLE)];

pub fn prediction_style(label: &str) -> BoxStyle {
    LABEL_STYLES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(label))
        .map(|(_, style)| *style)
        .unwrap_or(GENERIC_STYLE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertStyle {
    pub color: Color,
    pub stroke_width: u32,
    pub dashed: bool,
    pub caption: &'static str,
}

const ALERT_STYLES: [(AlertKind, AlertStyle); 4] = [
    (
        AlertKind::Fire,
        AlertStyle {
            color: RED,
            stroke_width: 5,
            dashed: false,
            caption: "Fire detected",
        },
    ),
    (
        AlertKind::Smoke,
        AlertStyle {
            color: RED,
            stroke_width: 5,
            dashed: false,
            caption: "Smoke detected",
        },
    ),
    (
        AlertKind::Abnormal,
        AlertStyle {
            color: MAGENTA,
            stroke_width: 3,
            dashed: true,
            caption: "Abnormal behavior",
        },
    ),
    (
        AlertKind::Loitering,
        AlertStyle {
            color: ORANGE,
            stroke_width: 3,
            dashed: true,
            caption: "Loitering",
        },
    ),
];

pub fn alert_style(kind: AlertKind) -> AlertStyle {
    ALERT_STYLES
        .iter()
        .find(|(candidate, _)| *candidate == kind)
        .map(|(_, style)| *style)
        .unwrap_or(ALERT_STYLES[2].1)
}

const BEHAVIOR_CAPTIONS: &[(&str, &str)] = &[
    ("FALL", "fall"),
    ("HANDS_UP", "hands up"),
    ("FAST_MOTION", "fast motion"),
];

/// Operator text for a behavior code; unknown codes are shown lowercased.
pub fn behavior_caption(code: &str) -> String {
    BEHAVIOR_CAPTIONS
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, caption)| caption.to_string())
        .unwrap_or_else(|| code.replace('_', " ").to_lowercase())
}

pub fn joint_color(region: JointRegion) -> Color {
    match region {
        JointRegion::FaceAndShoulders => Color::rgb(255, 255, 0),
        JointRegion::Arm => Color::rgb(0, 128, 255),
        JointRegion::Leg => Color::rgb(255, 105, 180),
    }
}
