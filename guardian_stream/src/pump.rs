use crate::{
    capture::CaptureError,
    image_utils::encode_jpeg,
    telemetry::Metrics,
    transport::{ChannelError, SendCompletion},
};
use bytes::Bytes;
use image::{ImageError, RgbImage};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, watch},
    time::MissedTickBehavior,
};

/// Latest raw frame, shared with the operator preview.
pub type PreviewFrame = Arc<RgbImage>;

pub trait FrameSource: Send + Sync + 'static {
    /// `Ok(None)` while no stream is active.
    fn grab(&self) -> Result<Option<RgbImage>, CaptureError>;
}

pub trait FrameSink: Send + Sync + 'static {
    fn send_frame(&self, frame: Bytes) -> Result<SendCompletion, ChannelError>;
}

#[derive(Error, Debug)]
enum PumpError {
    #[error("Capture failed: {0}")]
    Capture(#[from] CaptureError),
    #[error("Encoding failed: {0}")]
    Encode(#[from] ImageError),
}

#[derive(Default)]
struct PumpStats {
    sent: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PumpSnapshot {
    pub sent: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl PumpStats {
    fn snapshot(&self) -> PumpSnapshot {
        PumpSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
struct Ticker {
    source: Arc<dyn FrameSource>,
    sink: Arc<dyn FrameSink>,
    device_id: Arc<str>,
    quality: u8,
    in_flight: Arc<AtomicBool>,
    stats: Arc<PumpStats>,
    preview: watch::Sender<Option<PreviewFrame>>,
    metrics: Arc<Metrics>,
}

impl Ticker {
    fn tick(&self) {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            self.metrics.record_frame_skipped(&self.device_id);
            tracing::trace!("Frame still in flight, skipping tick");
            return;
        }

        let ticker = self.clone();
        tokio::spawn(async move {
            ticker.deliver().await;
            ticker.in_flight.store(false, Ordering::Release);
        });
    }

    async fn deliver(&self) {
        let started = Instant::now();
        let source = self.source.clone();
        let quality = self.quality;
        let encoded = tokio::task::spawn_blocking(move || -> Result<_, PumpError> {
            let Some(frame) = source.grab()? else {
                return Ok(None);
            };
            let jpeg = encode_jpeg(&frame, quality)?;
            Ok(Some((Arc::new(frame), jpeg)))
        })
        .await;

        let (frame, jpeg) = match encoded {
            Ok(Ok(Some(encoded))) => encoded,
            Ok(Ok(None)) => return,
            Ok(Err(e)) => {
                let stage = match e {
                    PumpError::Capture(_) => "capture",
                    PumpError::Encode(_) => "encode",
                };
                self.fail(stage, &e);
                return;
            }
            Err(e) => {
                self.fail("capture", &e);
                return;
            }
        };

        self.preview.send_replace(Some(frame));

        let completion = match self.sink.send_frame(jpeg) {
            Ok(completion) => completion,
            Err(ChannelError::Busy) => {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_frame_skipped(&self.device_id);
                return;
            }
            Err(e) => {
                self.fail("send", &e);
                return;
            }
        };

        match completion.wait().await {
            Ok(()) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_frame_sent(&self.device_id);
                self.metrics
                    .record_send_duration(started.elapsed().as_millis() as u64, &self.device_id);
            }
            Err(e) => self.fail("send", &e),
        }
    }

    fn fail(&self, stage: &'static str, error: &dyn std::error::Error) {
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_send_failure(stage);
        tracing::warn!("Frame {} failed: {}", stage, error);
    }
}

/// Periodically captures, encodes and sends one frame, never letting a
/// second frame leave before the previous one has been accepted.
pub struct FramePump {
    source: Arc<dyn FrameSource>,
    interval: Duration,
    quality: u8,
    in_flight: Arc<AtomicBool>,
    stats: Arc<PumpStats>,
    preview: watch::Sender<Option<PreviewFrame>>,
    metrics: Arc<Metrics>,
    running: Mutex<Option<broadcast::Sender<()>>>,
}

impl FramePump {
    pub fn new(
        source: Arc<dyn FrameSource>,
        interval: Duration,
        quality: u8,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (preview, _) = watch::channel(None);
        Self {
            source,
            interval: interval.max(Duration::from_millis(1)),
            quality,
            in_flight: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(PumpStats::default()),
            preview,
            metrics,
            running: Mutex::new(None),
        }
    }

    /// Starts ticking into `sink`, replacing any running timer.
    pub fn start(&self, sink: Arc<dyn FrameSink>, device_id: &str) {
        self.stop();

        let ticker = Ticker {
            source: self.source.clone(),
            sink,
            device_id: Arc::from(device_id),
            quality: self.quality,
            in_flight: self.in_flight.clone(),
            stats: self.stats.clone(),
            preview: self.preview.clone(),
            metrics: self.metrics.clone(),
        };
        let (stop_tx, mut stop_rx) = broadcast::channel(1);
        let period = self.interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = interval.tick() => ticker.tick(),
                }
            }
            tracing::debug!("Frame pump timer stopped");
        });

        *self.running.lock() = Some(stop_tx);
        tracing::info!("Frame pump started every {:?} for {}", period, device_id);
    }

    /// Idempotent; a frame already in flight is allowed to finish.
    pub fn stop(&self) -> bool {
        match self.running.lock().take() {
            Some(stop_tx) => {
                let _ = stop_tx.send(());
                tracing::info!("Frame pump stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn stats(&self) -> PumpSnapshot {
        self.stats.snapshot()
    }

    pub fn preview(&self) -> watch::Receiver<Option<PreviewFrame>> {
        self.preview.subscribe()
    }

    /// Drops the preview frame so a stale image is not shown after teardown.
    pub fn clear_preview(&self) {
        self.preview.send_replace(None);
    }
}

impl Drop for FramePump {
    fn drop(&mut self) {
        self.stop();
    }
}
