use super::{CaptureBackend, CaptureError, Resolution, StreamHandle};
use crate::pump::FrameSource;
use image::{imageops::FilterType, RgbImage};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::instrument;

/// The stream in use plus its id, readable without waiting on a frame read.
struct ActiveStream {
    device_id: String,
    handle: Arc<Mutex<StreamHandle>>,
}

impl ActiveStream {
    /// Releases now, or once the read in progress returns its handle.
    fn release(self) -> bool {
        let Some(mut handle) = self.handle.try_lock() else {
            tracing::debug!(
                "Frame read in progress on {}; releasing when it returns",
                self.device_id
            );
            return true;
        };
        handle.stop()
    }
}

/// Owns at most one open capture stream and renders its frames onto a
/// fixed-size off-screen buffer.
pub struct CaptureSession {
    backend: Arc<dyn CaptureBackend>,
    resolution: Resolution,
    active: Mutex<Option<ActiveStream>>,
}

impl CaptureSession {
    pub fn new(backend: Arc<dyn CaptureBackend>, resolution: Resolution) -> Self {
        Self {
            backend,
            resolution,
            active: Mutex::new(None),
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Opens `device_id`, stopping the current stream first so two streams
    /// never overlap.
    #[instrument(skip(self))]
    pub async fn start(&self, device_id: &str) -> Result<(), CaptureError> {
        self.stop();

        let backend = self.backend.clone();
        let resolution = self.resolution;
        let id = device_id.to_string();
        let stream = tokio::task::spawn_blocking(move || backend.open(&id, resolution)).await??;

        let previous = self.active.lock().replace(ActiveStream {
            device_id: device_id.to_string(),
            handle: Arc::new(Mutex::new(StreamHandle::new(device_id, stream))),
        });
        if let Some(previous) = previous {
            // A concurrent start won the race; keep the newest stream only.
            previous.release();
        }
        tracing::info!("Capture started on device {}", device_id);
        Ok(())
    }

    /// Idempotent; returns `true` when a stream was active. Never waits for
    /// a frame read in progress.
    pub fn stop(&self) -> bool {
        let active = self.active.lock().take();
        match active {
            Some(active) => {
                tracing::info!("Capture stopped on device {}", active.device_id);
                active.release()
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.lock().is_some()
    }

    pub fn device_id(&self) -> Option<String> {
        self.active
            .lock()
            .as_ref()
            .map(|active| active.device_id.clone())
    }
}

impl FrameSource for CaptureSession {
    fn grab(&self) -> Result<Option<RgbImage>, CaptureError> {
        let Some(handle) = self
            .active
            .lock()
            .as_ref()
            .map(|active| active.handle.clone())
        else {
            return Ok(None);
        };
        let Some(frame) = handle.lock().read()? else {
            return Ok(None);
        };
        drop(handle);

        let Resolution { width, height } = self.resolution;
        if frame.dimensions() == (width, height) {
            Ok(Some(frame))
        } else {
            Ok(Some(image::imageops::resize(
                &frame,
                width,
                height,
                FilterType::Triangle,
            )))
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}
