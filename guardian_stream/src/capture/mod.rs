mod registry;
mod session;
mod synthetic;

#[cfg(feature = "opencv")]
mod opencv;

pub use registry::DeviceRegistry;
pub use session::CaptureSession;
pub use synthetic::SyntheticBackend;

#[cfg(feature = "opencv")]
pub use self::opencv::OpenCvBackend;

use image::RgbImage;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Camera permission denied")]
    PermissionDenied,
    #[error("Device {device_id} unavailable: {reason}")]
    DeviceUnavailable { device_id: String, reason: String },
    #[error("Failed to read frame: {0}")]
    ReadFrameFailed(String),
    #[error("Failed to enumerate devices: {0}")]
    EnumerationFailed(String),
    #[error("Capture task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub label: String,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }

    /// Label shown to the operator; devices report an empty label until
    /// permission is granted.
    pub fn display_name(&self, position: usize) -> String {
        if self.label.is_empty() {
            format!("Camera {}", position + 1)
        } else {
            self.label.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Platform capture layer. Calls block and are run off the async executor.
pub trait CaptureBackend: Send + Sync + 'static {
    /// Briefly opens the default device to obtain the capture permission.
    fn request_permission(&self) -> Result<Box<dyn CaptureStream>, CaptureError>;

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, CaptureError>;

    /// Opens `device_id` at the ideal `resolution`; the device may deliver
    /// another size.
    fn open(
        &self,
        device_id: &str,
        resolution: Resolution,
    ) -> Result<Box<dyn CaptureStream>, CaptureError>;
}

pub trait CaptureStream: Send {
    fn read(&mut self) -> Result<RgbImage, CaptureError>;

    /// Releases the underlying hardware tracks.
    fn stop(&mut self);
}

/// Owns one open stream and stops it exactly once, on `stop()` or on drop.
pub struct StreamHandle {
    device_id: String,
    stream: Option<Box<dyn CaptureStream>>,
}

impl StreamHandle {
    pub fn new(device_id: impl Into<String>, stream: Box<dyn CaptureStream>) -> Self {
        Self {
            device_id: device_id.into(),
            stream: Some(stream),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    pub fn read(&mut self) -> Result<Option<RgbImage>, CaptureError> {
        match self.stream.as_mut() {
            Some(stream) => stream.read().map(Some),
            None => Ok(None),
        }
    }

    /// Returns `true` when this call released the hardware.
    pub fn stop(&mut self) -> bool {
        match self.stream.take() {
            Some(mut stream) => {
                stream.stop();
                tracing::debug!("Released capture stream for device {}", self.device_id);
                true
            }
            None => false,
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("device_id", &self.device_id)
            .field("active", &self.is_active())
            .finish()
    }
}
