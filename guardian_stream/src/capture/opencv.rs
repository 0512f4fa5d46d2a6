use super::{CaptureBackend, CaptureError, CaptureStream, DeviceDescriptor, Resolution};
use image::RgbImage;
use opencv::{core::Mat, imgproc, prelude::*, videoio};

/// Local cameras addressed by OpenCV device index.
pub struct OpenCvBackend {
    scan_limit: i32,
}

impl OpenCvBackend {
    pub fn new(scan_limit: u32) -> Self {
        Self {
            scan_limit: scan_limit.max(1) as i32,
        }
    }
}

fn open_index(index: i32) -> opencv::Result<Option<videoio::VideoCapture>> {
    let capture = videoio::VideoCapture::new(index, videoio::CAP_ANY)?;
    if capture.is_opened()? {
        Ok(Some(capture))
    } else {
        Ok(None)
    }
}

impl CaptureBackend for OpenCvBackend {
    fn request_permission(&self) -> Result<Box<dyn CaptureStream>, CaptureError> {
        match open_index(0) {
            Ok(Some(capture)) => Ok(Box::new(OpenCvStream { capture })),
            Ok(None) => Err(CaptureError::PermissionDenied),
            Err(e) => {
                tracing::error!("Camera permission request failed: {:?}", e);
                Err(CaptureError::PermissionDenied)
            }
        }
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, CaptureError> {
        let mut devices = Vec::new();
        for index in 0..self.scan_limit {
            match open_index(index) {
                Ok(Some(mut capture)) => {
                    let _ = capture.release();
                    devices.push(DeviceDescriptor::new(index.to_string(), ""));
                }
                Ok(None) => {}
                Err(e) => {
                    return Err(CaptureError::EnumerationFailed(e.to_string()));
                }
            }
        }
        Ok(devices)
    }

    fn open(
        &self,
        device_id: &str,
        resolution: Resolution,
    ) -> Result<Box<dyn CaptureStream>, CaptureError> {
        let unavailable = |reason: String| CaptureError::DeviceUnavailable {
            device_id: device_id.to_string(),
            reason,
        };
        let index: i32 = device_id
            .parse()
            .map_err(|_| unavailable("not an OpenCV device index".into()))?;

        let mut capture = open_index(index)
            .map_err(|e| unavailable(e.to_string()))?
            .ok_or_else(|| unavailable("device could not be opened".into()))?;

        capture
            .set(videoio::CAP_PROP_FRAME_WIDTH, resolution.width as f64)
            .and_then(|_| capture.set(videoio::CAP_PROP_FRAME_HEIGHT, resolution.height as f64))
            .map_err(|e| unavailable(e.to_string()))?;

        Ok(Box::new(OpenCvStream { capture }))
    }
}

struct OpenCvStream {
    capture: videoio::VideoCapture,
}

impl CaptureStream for OpenCvStream {
    fn read(&mut self) -> Result<RgbImage, CaptureError> {
        let mut frame = Mat::default();
        let grabbed = self
            .capture
            .read(&mut frame)
            .map_err(|e| CaptureError::ReadFrameFailed(e.to_string()))?;
        if !grabbed || frame.empty() {
            return Err(CaptureError::ReadFrameFailed("empty frame".into()));
        }

        let mut rgb = Mat::default();
        imgproc::cvt_color_def(&frame, &mut rgb, imgproc::COLOR_BGR2RGB)
            .map_err(|e| CaptureError::ReadFrameFailed(e.to_string()))?;

        let (width, height) = (rgb.cols() as u32, rgb.rows() as u32);
        let data = rgb
            .data_bytes()
            .map_err(|e| CaptureError::ReadFrameFailed(e.to_string()))?
            .to_vec();

        RgbImage::from_raw(width, height, data)
            .ok_or_else(|| CaptureError::ReadFrameFailed("unexpected frame layout".into()))
    }

    fn stop(&mut self) {
        if let Err(e) = self.capture.release() {
            tracing::warn!("Failed to release camera: {:?}", e);
        }
    }
}
