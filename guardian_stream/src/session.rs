use crate::{
    capture::{CaptureError, CaptureSession},
    config::Config,
    guard::{GuardAction, GuardError, GuardEvent, LeaveConfirmation, Navigation, SessionGuard, SessionState},
    image_utils::composite,
    pump::{FramePump, PreviewFrame, PumpSnapshot},
    render::{AnnotationRenderer, OverlayCanvas},
    telemetry::Metrics,
    transport::{ChannelError, ChannelEvent, ChannelState, TransportChannel},
};
use ab_glyph::FontArc;
use image::RgbImage;
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::instrument;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error("Session was ended before it finished starting")]
    Superseded,
}

/// Operator-facing connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionStatus {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Error,
    CameraError,
    PermissionDenied,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SessionStatus::Idle => "Idle",
            SessionStatus::Connecting => "Connecting...",
            SessionStatus::Connected => "Connected",
            SessionStatus::Disconnected => "Disconnected",
            SessionStatus::Error => "Error",
            SessionStatus::CameraError => "Camera Error",
            SessionStatus::PermissionDenied => "Permission Denied",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationOutcome {
    Proceed(Navigation),
    Stayed(Navigation),
    Blocked,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: SessionState,
    pub status: String,
    pub fps: u32,
    pub device: Option<String>,
    pub channel: Option<ChannelState>,
    pub armed: bool,
    pub pending: Option<Navigation>,
    pub pump: PumpSnapshot,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub stream_url: String,
    pub frame_interval: Duration,
    pub jpeg_quality: u8,
    pub display_width: u32,
    pub display_height: u32,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            stream_url: config.backend.get_stream_url(),
            frame_interval: config.streaming.get_frame_interval(),
            jpeg_quality: config.streaming.get_encoder_quality(),
            display_width: config.overlay.display_width,
            display_height: config.overlay.display_height,
        }
    }
}

/// Inbound messages per second, refreshed once a second.
struct FpsCounter {
    window_start: Instant,
    count: u32,
    fps: u32,
}

impl FpsCounter {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            count: 0,
            fps: 0,
        }
    }

    fn tick(&mut self, now: Instant) -> Option<u32> {
        self.count += 1;
        if now.duration_since(self.window_start) >= Duration::from_secs(1) {
            self.fps = self.count;
            self.count = 0;
            self.window_start = now;
            Some(self.fps)
        } else {
            None
        }
    }
}

struct Inner {
    capture: Arc<CaptureSession>,
    pump: FramePump,
    channel: Mutex<Option<Arc<TransportChannel>>>,
    guard: Mutex<SessionGuard>,
    renderer: AnnotationRenderer,
    canvas: OverlayCanvas,
    status: Mutex<SessionStatus>,
    fps: Mutex<FpsCounter>,
    device: Mutex<Option<String>>,
    events_task: Mutex<Option<JoinHandle<()>>>,
    starting: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    stream_url: String,
    scale: f32,
    metrics: Arc<Metrics>,
}

impl Inner {
    fn set_status(&self, status: SessionStatus) {
        let mut current = self.status.lock();
        if *current != status {
            tracing::info!("Status: {}", status);
            *current = status;
        }
    }

    /// Stops the pump, closes the channel and releases the camera. Every
    /// step is idempotent.
    fn release(&self) {
        self.pump.stop();
        if let Some(channel) = self.channel.lock().take() {
            channel.close();
        }
        self.capture.stop();
        self.pump.clear_preview();
        self.canvas.clear();
        *self.fps.lock() = FpsCounter::new();
    }

    /// Ends the current connection from our side; its late events are
    /// ignored afterwards.
    fn teardown(&self, reason: &str) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let was_live = {
            let mut guard = self.guard.lock();
            let live = guard.is_armed() || guard.state() == SessionState::Connecting;
            if let Err(e) = guard.step(GuardEvent::ChannelClosed) {
                tracing::warn!("Guard refused teardown: {}", e);
            }
            live
        };
        self.release();
        if let Some(task) = self.events_task.lock().take() {
            task.abort();
        }
        if was_live {
            tracing::info!("Session torn down: {}", reason);
            self.set_status(SessionStatus::Disconnected);
        }
    }

    /// The operator left: release everything and ignore the channel's
    /// remaining events.
    fn abandon(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.release();
        if let Some(task) = self.events_task.lock().take() {
            task.abort();
        }
        self.set_status(SessionStatus::Disconnected);
    }

    fn on_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened => self.on_opened(),
            ChannelEvent::Message(message) => {
                if let Some(fps) = self.fps.lock().tick(Instant::now()) {
                    self.metrics.record_annotation_fps(fps as f64);
                }
                self.renderer.render(&message, &self.canvas, self.scale);
            }
            ChannelEvent::Errored(reason) => {
                tracing::error!("Backend channel failed: {}", reason);
                self.set_status(SessionStatus::Error);
                self.on_channel_lost(GuardEvent::ChannelErrored);
            }
            ChannelEvent::Closed => {
                if *self.status.lock() != SessionStatus::Error {
                    self.set_status(SessionStatus::Disconnected);
                }
                self.on_channel_lost(GuardEvent::ChannelClosed);
            }
        }
    }

    fn on_opened(&self) {
        if let Err(e) = self.guard.lock().step(GuardEvent::ChannelOpened) {
            tracing::warn!("Ignoring channel open: {}", e);
            return;
        }
        self.set_status(SessionStatus::Connected);

        let channel = self.channel.lock().clone();
        let device = self.device.lock().clone().unwrap_or_default();
        if let Some(channel) = channel {
            self.pump.start(channel, &device);
        }
    }

    fn on_channel_lost(&self, event: GuardEvent) {
        let action = self.guard.lock().step(event);
        match action {
            Ok(GuardAction::Teardown) => self.release(),
            Ok(_) => {}
            Err(e) => tracing::warn!("Guard ignored channel loss: {}", e),
        }
    }
}

async fn run_events(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    generation: u64,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.generation.load(Ordering::SeqCst) != generation {
            break;
        }
        inner.on_channel_event(event);
    }
}

/// One monitoring session: the only owner of the camera stream, the backend
/// channel and the frame pump.
///
/// Every exit path (device change, channel loss, confirmed leave, shutdown,
/// drop) releases all three together.
pub struct MonitoringSession {
    inner: Arc<Inner>,
}

impl MonitoringSession {
    pub fn new(capture: Arc<CaptureSession>, settings: SessionSettings, metrics: Arc<Metrics>) -> Self {
        let capture_width = capture.resolution().width.max(1);
        let pump = FramePump::new(
            capture.clone(),
            settings.frame_interval,
            settings.jpeg_quality,
            metrics.clone(),
        );
        Self {
            inner: Arc::new(Inner {
                capture,
                pump,
                channel: Mutex::new(None),
                guard: Mutex::new(SessionGuard::new()),
                renderer: AnnotationRenderer::new(),
                canvas: OverlayCanvas::new(settings.display_width, settings.display_height),
                status: Mutex::new(SessionStatus::Idle),
                fps: Mutex::new(FpsCounter::new()),
                device: Mutex::new(None),
                events_task: Mutex::new(None),
                starting: tokio::sync::Mutex::new(()),
                generation: AtomicU64::new(0),
                stream_url: settings.stream_url,
                scale: settings.display_width as f32 / capture_width as f32,
                metrics,
            }),
        }
    }

    /// Starts monitoring `device_id`, ending any current session first.
    ///
    /// The camera is opened before the channel; a camera failure leaves the
    /// session closed with a camera status. Starts run one at a time; a newer
    /// start cancels the handshake of an older one.
    #[instrument(skip(self))]
    pub async fn start(&self, device_id: &str) -> Result<(), SessionError> {
        self.inner.teardown("device change");
        let _starting = self.inner.starting.lock().await;
        self.inner.teardown("device change");
        let generation = self.inner.generation.load(Ordering::SeqCst);

        if let Err(e) = self.inner.capture.start(device_id).await {
            tracing::error!("Camera failed: {}", e);
            self.inner.set_status(match e {
                CaptureError::PermissionDenied => SessionStatus::PermissionDenied,
                _ => SessionStatus::CameraError,
            });
            return Err(e.into());
        }

        // Shutdown or a newer start while the camera was opening.
        if self.inner.generation.load(Ordering::SeqCst) != generation {
            self.inner.capture.stop();
            return Err(SessionError::Superseded);
        }

        if let Err(e) = self.inner.guard.lock().step(GuardEvent::OpenRequested) {
            self.inner.capture.stop();
            return Err(e.into());
        }
        self.inner.set_status(SessionStatus::Connecting);
        self.inner.canvas.attach();
        *self.inner.device.lock() = Some(device_id.to_string());

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(TransportChannel::new(events_tx, self.inner.metrics.clone()));
        *self.inner.channel.lock() = Some(channel.clone());
        let task = tokio::spawn(run_events(Arc::downgrade(&self.inner), events_rx, generation));
        if let Some(previous) = self.inner.events_task.lock().replace(task) {
            previous.abort();
        }

        if let Err(e) = channel.open(&self.inner.stream_url).await {
            if self.inner.generation.load(Ordering::SeqCst) == generation {
                self.inner.set_status(SessionStatus::Error);
                self.inner.on_channel_lost(GuardEvent::ChannelErrored);
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// First half of a guarded navigation. Leaving a session that is still
    /// connecting releases it right away.
    pub fn begin_navigation(&self, navigation: Navigation) -> Result<GuardAction, SessionError> {
        if navigation.is_host_level() {
            tracing::info!("Host-level leave attempt {:?}; the host may not wait", navigation);
        }
        let action = self
            .inner
            .guard
            .lock()
            .step(GuardEvent::NavigationAttempted(navigation))?;
        if let GuardAction::TeardownAndProceed(_) = action {
            self.inner.abandon();
        }
        Ok(action)
    }

    /// Second half: the operator's answer to the pending confirmation.
    pub fn resolve_navigation(&self, leave: bool) -> Result<GuardAction, SessionError> {
        let event = if leave {
            GuardEvent::LeaveConfirmed
        } else {
            GuardEvent::LeaveDeclined
        };
        let action = self.inner.guard.lock().step(event)?;
        if matches!(
            action,
            GuardAction::TeardownAndProceed(_) | GuardAction::Teardown
        ) {
            self.inner.abandon();
        }
        Ok(action)
    }

    /// Runs a navigation attempt to completion, asking `confirmation` when
    /// the session is being monitored.
    pub async fn navigate<C: LeaveConfirmation>(
        &self,
        navigation: Navigation,
        confirmation: &C,
    ) -> Result<NavigationOutcome, SessionError> {
        let pending = match self.begin_navigation(navigation)? {
            GuardAction::Proceed(navigation) | GuardAction::TeardownAndProceed(navigation) => {
                return Ok(NavigationOutcome::Proceed(navigation))
            }
            GuardAction::AwaitConfirmation(navigation) => navigation,
            _ => return Ok(NavigationOutcome::Blocked),
        };

        let leave = confirmation.confirm_leave(&pending).await;
        match self.resolve_navigation(leave) {
            Ok(GuardAction::TeardownAndProceed(navigation)) => Ok(NavigationOutcome::Proceed(navigation)),
            Ok(GuardAction::Revert(navigation)) => Ok(NavigationOutcome::Stayed(navigation)),
            Ok(_) => Ok(NavigationOutcome::Blocked),
            // The channel dropped while the operator was deciding.
            Err(SessionError::Guard(_)) if self.state() == SessionState::Closed => {
                Ok(NavigationOutcome::Proceed(pending))
            }
            Err(e) => Err(e),
        }
    }

    /// Releases everything and stops rendering for good.
    pub fn shutdown(&self) {
        self.inner.teardown("shutdown");
        self.inner.canvas.detach();
    }

    pub fn state(&self) -> SessionState {
        self.inner.guard.lock().state()
    }

    pub fn is_armed(&self) -> bool {
        self.inner.guard.lock().is_armed()
    }

    pub fn status(&self) -> SessionStatus {
        *self.inner.status.lock()
    }

    pub fn status_report(&self) -> StatusReport {
        let (state, armed, pending) = {
            let guard = self.inner.guard.lock();
            (guard.state(), guard.is_armed(), guard.pending().cloned())
        };
        StatusReport {
            state,
            status: self.status().to_string(),
            fps: self.inner.fps.lock().fps,
            device: self.inner.device.lock().clone(),
            channel: self.inner.channel.lock().as_ref().map(|c| c.state()),
            armed,
            pending,
            pump: self.inner.pump.stats(),
        }
    }

    pub fn overlay(&self) -> OverlayCanvas {
        self.inner.canvas.clone()
    }

    pub fn preview(&self) -> watch::Receiver<Option<PreviewFrame>> {
        self.inner.pump.preview()
    }

    /// Latest captured frame with the overlay blended on top.
    pub fn compose_preview(&self, font: Option<&FontArc>) -> Option<RgbImage> {
        let frame = self.inner.pump.preview().borrow().clone()?;
        let overlay = self.inner.canvas.rasterize(font);
        Some(composite(&frame, &overlay))
    }
}

impl Drop for MonitoringSession {
    fn drop(&mut self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.release();
        if let Some(task) = self.inner.events_task.lock().take() {
            task.abort();
        }
    }
}
