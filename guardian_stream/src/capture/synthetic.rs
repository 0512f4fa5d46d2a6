use super::{CaptureBackend, CaptureError, CaptureStream, DeviceDescriptor, Resolution};
use image::{Rgb, RgbImage};

/// Test-pattern devices for headless deployments and demos.
pub struct SyntheticBackend {
    devices: Vec<DeviceDescriptor>,
}

impl SyntheticBackend {
    pub fn new(devices: Vec<DeviceDescriptor>) -> Self {
        Self { devices }
    }
}

impl CaptureBackend for SyntheticBackend {
    fn request_permission(&self) -> Result<Box<dyn CaptureStream>, CaptureError> {
        Ok(Box::new(PatternStream::new(Resolution::new(16, 16))))
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, CaptureError> {
        Ok(self.devices.clone())
    }

    fn open(
        &self,
        device_id: &str,
        resolution: Resolution,
    ) -> Result<Box<dyn CaptureStream>, CaptureError> {
        if !self.devices.iter().any(|device| device.id == device_id) {
            return Err(CaptureError::DeviceUnavailable {
                device_id: device_id.to_string(),
                reason: "unknown synthetic device".into(),
            });
        }
        Ok(Box::new(PatternStream::new(resolution)))
    }
}

/// Diagonal gradient with a bar sweeping left to right.
struct PatternStream {
    resolution: Resolution,
    tick: u32,
    stopped: bool,
}

impl PatternStream {
    fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            tick: 0,
            stopped: false,
        }
    }
}

impl CaptureStream for PatternStream {
    fn read(&mut self) -> Result<RgbImage, CaptureError> {
        if self.stopped {
            return Err(CaptureError::ReadFrameFailed("stream stopped".into()));
        }
        let Resolution { width, height } = self.resolution;
        let bar = (self.tick * 8) % width.max(1);
        let frame = RgbImage::from_fn(width, height, |x, y| {
            if x.abs_diff(bar) < 6 {
                Rgb([240, 240, 240])
            } else {
                let r = (x * 255 / width.max(1)) as u8;
                let g = (y * 255 / height.max(1)) as u8;
                Rgb([r, g, 96])
            }
        });
        self.tick = self.tick.wrapping_add(1);
        Ok(frame)
    }

    fn stop(&mut self) {
        self.stopped = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_stream_reads_at_requested_size() {
        let backend = SyntheticBackend::new(vec![DeviceDescriptor::new("synthetic-0", "")]);
        let mut stream = backend
            .open("synthetic-0", Resolution::new(40, 30))
            .unwrap();

        let first = stream.read().unwrap();
        let second = stream.read().unwrap();

        assert_eq!(first.dimensions(), (40, 30));
        assert_ne!(first, second);

        stream.stop();
        assert!(stream.read().is_err());
    }

    #[test]
    fn test_unknown_device_is_unavailable() {
        let backend = SyntheticBackend::new(vec![]);
        assert!(matches!(
            backend.open("nope", Resolution::new(8, 8)),
            Err(CaptureError::DeviceUnavailable { .. })
        ));
    }
}
