use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIN_FRAME_INTERVAL: u8 = 1;
pub const MAX_FRAME_INTERVAL: u8 = 30;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("frame interval {0} is outside 1..=30")]
pub struct InvalidInterval(pub i64);

/// Run the pose model once every N frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct FrameInterval(u8);

impl FrameInterval {
    pub fn new(value: i64) -> Result<Self, InvalidInterval> {
        if (MIN_FRAME_INTERVAL as i64..=MAX_FRAME_INTERVAL as i64).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(InvalidInterval(value))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for FrameInterval {
    type Error = InvalidInterval;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FrameInterval> for u8 {
    fn from(interval: FrameInterval) -> Self {
        interval.0
    }
}

/// Server-held configuration of the secondary (pose) model.
///
/// `available` is a capability flag reported by the backend and never written
/// by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceSettings {
    pub enabled: bool,
    pub available: bool,
    pub frame_interval: FrameInterval,
}
