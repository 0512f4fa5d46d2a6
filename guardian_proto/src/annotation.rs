use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of landmarks in the pose topology the backend reports.
pub const POSE_KEYPOINT_COUNT: usize = 33;

/// A keypoint is drawn only when its confidence is strictly above this value.
pub const KEYPOINT_VISIBILITY_THRESHOLD: f32 = 0.3;

#[derive(Error, Debug)]
pub enum MalformedAnnotation {
    #[error("Invalid annotation payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid prediction at index {index}: {reason}")]
    Prediction { index: usize, reason: String },
    #[error("Invalid alert at index {index}: {reason}")]
    Alert { index: usize, reason: String },
}

/// Axis-aligned box `[x1, y1, x2, y2]` in model input coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn scaled(&self, scale: f32) -> Self {
        Self {
            x1: self.x1 * scale,
            y1: self.y1 * scale,
            x2: self.x2 * scale,
            y2: self.y2 * scale,
        }
    }

    pub fn corners(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }

    fn validate(&self) -> Result<(), String> {
        if !self.corners().iter().all(|v| v.is_finite()) {
            return Err(format!("non-finite box {:?}", self.corners()));
        }
        if self.x1 > self.x2 || self.y1 > self.y2 {
            return Err(format!("inverted box {:?}", self.corners()));
        }
        Ok(())
    }
}

impl From<[f32; 4]> for BoundingBox {
    fn from([x1, y1, x2, y2]: [f32; 4]) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(bbox: BoundingBox) -> Self {
        bbox.corners()
    }
}

/// One pose landmark `[x, y, confidence]`, indexed by its position in the
/// 33-point topology.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 3]", into = "[f32; 3]")]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, confidence: f32) -> Self {
        Self { x, y, confidence }
    }

    pub fn is_visible(&self) -> bool {
        self.confidence > KEYPOINT_VISIBILITY_THRESHOLD
    }
}

impl From<[f32; 3]> for Keypoint {
    fn from([x, y, confidence]: [f32; 3]) -> Self {
        Self { x, y, confidence }
    }
}

impl From<Keypoint> for [f32; 3] {
    fn from(kp: Keypoint) -> Self {
        [kp.x, kp.y, kp.confidence]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    pub label: String,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keypoints: Option<Vec<Keypoint>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_loitering: Option<bool>,
}

impl Prediction {
    pub fn new(bbox: BoundingBox, label: impl Into<String>, score: f32) -> Self {
        Self {
            bbox,
            label: label.into(),
            score,
            keypoints: None,
            track_id: None,
            is_loitering: None,
        }
    }

    fn validate(&self) -> Result<(), String> {
        self.bbox.validate()?;
        if !(0.0..=1.0).contains(&self.score) {
            return Err(format!("score {} outside [0, 1]", self.score));
        }
        if let Some(keypoints) = &self.keypoints {
            if keypoints.len() > POSE_KEYPOINT_COUNT {
                return Err(format!(
                    "{} keypoints exceed the {}-point topology",
                    keypoints.len(),
                    POSE_KEYPOINT_COUNT
                ));
            }
            for (i, kp) in keypoints.iter().enumerate() {
                if !(kp.x.is_finite() && kp.y.is_finite()) {
                    return Err(format!("keypoint {} has non-finite position", i));
                }
                if !(0.0..=1.0).contains(&kp.confidence) {
                    return Err(format!(
                        "keypoint {} confidence {} outside [0, 1]",
                        i, kp.confidence
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Abnormal,
    Loitering,
    Fire,
    Smoke,
}

impl AlertKind {
    pub fn is_hazard(&self) -> bool {
        matches!(self, AlertKind::Fire | AlertKind::Smoke)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Abnormal => "abnormal",
            AlertKind::Loitering => "loitering",
            AlertKind::Fire => "fire",
            AlertKind::Smoke => "smoke",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub kind: AlertKind,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub behaviors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl Alert {
    pub fn new(kind: AlertKind, bbox: BoundingBox) -> Self {
        Self {
            kind,
            bbox,
            behaviors: None,
            track_id: None,
            score: None,
        }
    }
}

/// The unit the backend sends per processed frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnotationMessage {
    #[serde(default)]
    pub predictions: Vec<Prediction>,
    #[serde(default)]
    pub alerts: Vec<Alert>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_trackers: Option<u32>,
}

impl AnnotationMessage {
    pub fn validate(&self) -> Result<(), MalformedAnnotation> {
        for (index, prediction) in self.predictions.iter().enumerate() {
            prediction
                .validate()
                .map_err(|reason| MalformedAnnotation::Prediction { index, reason })?;
        }
        for (index, alert) in self.alerts.iter().enumerate() {
            alert
                .bbox
                .validate()
                .map_err(|reason| MalformedAnnotation::Alert { index, reason })?;
        }
        Ok(())
    }
}

/// Parses and validates one inbound text payload.
pub fn decode_annotation(payload: &str) -> Result<AnnotationMessage, MalformedAnnotation> {
    let message: AnnotationMessage = serde_json::from_str(payload)?;
    message.validate()?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_backend_payload() {
        let payload = r#"{
            "predictions": [
                {"box": [10, 20, 110, 220], "label": "person", "score": 0.91,
                 "track_id": 3, "is_loitering": true,
                 "keypoints": [[15.0, 25.0, 0.9], [16.0, 26.0, 0.1]]},
                {"box": [0, 0, 50, 50], "label": "fire", "score": 0.77}
            ],
            "active_trackers": 1,
            "alerts": [
                {"type": "abnormal", "track_id": 3, "behaviors": ["FALL"], "box": [10, 20, 110, 220]},
                {"type": "fire", "box": [0, 0, 50, 50], "score": 0.77}
            ]
        }"#;

        let message = decode_annotation(payload).unwrap();

        assert_eq!(message.predictions.len(), 2);
        assert_eq!(message.predictions[0].bbox, BoundingBox::new(10.0, 20.0, 110.0, 220.0));
        assert_eq!(message.predictions[0].track_id, Some(3));
        let keypoints = message.predictions[0].keypoints.as_ref().unwrap();
        assert!(keypoints[0].is_visible());
        assert!(!keypoints[1].is_visible());
        assert_eq!(message.alerts[0].kind, AlertKind::Abnormal);
        assert_eq!(message.alerts[0].behaviors.as_deref(), Some(&["FALL".to_string()][..]));
        assert!(message.alerts[1].kind.is_hazard());
        assert_eq!(message.active_trackers, Some(1));
    }

    #[test]
    fn test_missing_lists_default_to_empty() {
        let message = decode_annotation("{}").unwrap();
        assert!(message.predictions.is_empty());
        assert!(message.alerts.is_empty());
    }

    #[test]
    fn test_rejects_non_json() {
        assert!(matches!(
            decode_annotation("not json"),
            Err(MalformedAnnotation::Json(_))
        ));
    }

    #[test]
    fn test_rejects_inverted_box() {
        let payload = r#"{"predictions":[{"box":[50,10,10,50],"label":"person","score":0.5}],"alerts":[]}"#;
        assert!(matches!(
            decode_annotation(payload),
            Err(MalformedAnnotation::Prediction { index: 0, .. })
        ));
    }

    #[test]
    fn test_rejects_score_out_of_range() {
        let payload = r#"{"predictions":[{"box":[0,0,10,10],"label":"person","score":1.5}],"alerts":[]}"#;
        assert!(decode_annotation(payload).is_err());
    }

    #[test]
    fn test_rejects_unknown_alert_type() {
        let payload = r#"{"predictions":[],"alerts":[{"type":"tracking","box":[0,0,1,1]}]}"#;
        assert!(matches!(
            decode_annotation(payload),
            Err(MalformedAnnotation::Json(_))
        ));
    }

    #[test]
    fn test_rejects_oversized_topology() {
        let keypoints = vec![[0.0f32, 0.0, 0.5]; POSE_KEYPOINT_COUNT + 1];
        let payload = serde_json::json!({
            "predictions": [{"box": [0, 0, 10, 10], "label": "person", "score": 0.9, "keypoints": keypoints}],
            "alerts": []
        })
        .to_string();
        assert!(decode_annotation(&payload).is_err());
    }

    #[test]
    fn test_visibility_threshold_is_exclusive() {
        assert!(!Keypoint::new(0.0, 0.0, KEYPOINT_VISIBILITY_THRESHOLD).is_visible());
        assert!(Keypoint::new(0.0, 0.0, 0.31).is_visible());
    }

    #[test]
    fn test_box_serializes_as_array() {
        let prediction = Prediction::new(BoundingBox::new(1.0, 2.0, 3.0, 4.0), "person", 0.5);
        let value = serde_json::to_value(&prediction).unwrap();
        assert_eq!(value["box"], serde_json::json!([1.0, 2.0, 3.0, 4.0]));
        assert!(value.get("keypoints").is_none());
    }
}
