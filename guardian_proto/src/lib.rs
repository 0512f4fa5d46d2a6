//! Wire types exchanged with the inference backend.
//!
//! Outbound frames are raw JPEG bytes and need no type here; inbound annotation
//! messages and the pose-settings resource are JSON and are modelled below.

mod annotation;
mod settings;

pub use annotation::{
    decode_annotation, Alert, AlertKind, AnnotationMessage, BoundingBox, Keypoint,
    MalformedAnnotation, Prediction, KEYPOINT_VISIBILITY_THRESHOLD, POSE_KEYPOINT_COUNT,
};
pub use settings::{
    FrameInterval, InferenceSettings, InvalidInterval, MAX_FRAME_INTERVAL, MIN_FRAME_INTERVAL,
};
