use crate::{
    capture::{
        CaptureBackend, CaptureSession, DeviceDescriptor, DeviceRegistry, Resolution,
        SyntheticBackend,
    },
    config::{CaptureBackendKind, CaptureConfig, Config},
    guard::{LeaveConfirmation, Navigation},
    render::load_font,
    server::{HttpServer, SharedState},
    session::{MonitoringSession, NavigationOutcome, SessionSettings},
    settings::SettingsSync,
    telemetry::Metrics,
};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{
    signal,
    sync::broadcast,
    time::sleep,
};

pub async fn start_app(config: Config) -> anyhow::Result<()> {
    let metrics = Arc::new(Metrics::new()?);

    let backend = build_backend(&config.capture)?;
    let registry = Arc::new(DeviceRegistry::new(backend.clone()));
    if let Some(device_id) = &config.capture.device_id {
        registry.select(device_id.clone());
    }

    let capture = Arc::new(CaptureSession::new(
        backend,
        Resolution::new(config.capture.width, config.capture.height),
    ));
    let session = Arc::new(MonitoringSession::new(
        capture,
        SessionSettings::from_config(&config),
        metrics.clone(),
    ));
    let settings = Arc::new(SettingsSync::new(&config.backend.get_settings_url())?);

    let state = SharedState {
        session: session.clone(),
        registry: registry.clone(),
        settings: settings.clone(),
        metrics,
        font: load_font(config.overlay.font_path.as_deref()),
        preview_delay_ms: config.overlay.get_preview_delay_ms(),
        preview_quality: config.streaming.get_encoder_quality(),
    };
    let server = HttpServer::new(state, &config.server.get_address()).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    match registry.list().await {
        Ok(_) => match registry.selected() {
            Some(device_id) => {
                if let Err(e) = session.start(&device_id).await {
                    tracing::error!("Failed to start monitoring {}: {}", device_id, e);
                }
            }
            None => tracing::warn!("No capture devices found"),
        },
        Err(e) => tracing::error!("Failed to list capture devices: {}", e),
    }

    match settings.fetch_settings().await {
        Ok(current) => tracing::info!("Pose model settings: {:?}", current),
        Err(e) => tracing::warn!("Pose model settings unavailable: {}", e),
    }

    wait_for_leave(&session, config.guard.get_confirm_window()).await;
    tracing::info!("Leaving, starting graceful shutdown.");

    session.shutdown();
    let _ = shutdown_tx.send(());
    let _ = server_handle.await;

    Ok(())
}

fn build_backend(config: &CaptureConfig) -> anyhow::Result<Arc<dyn CaptureBackend>> {
    match config.backend {
        CaptureBackendKind::Synthetic => {
            let devices = config
                .synthetic_devices
                .iter()
                .map(|device| DeviceDescriptor::new(&device.id, &device.label))
                .collect();
            Ok(Arc::new(SyntheticBackend::new(devices)))
        }
        #[cfg(feature = "opencv")]
        CaptureBackendKind::Opencv => Ok(Arc::new(crate::capture::OpenCvBackend::new(
            config.scan_limit,
        ))),
        #[cfg(not(feature = "opencv"))]
        CaptureBackendKind::Opencv => {
            anyhow::bail!("The opencv capture backend requires the `opencv` feature")
        }
    }
}

/// Confirms a host-level leave with a second Ctrl+C inside the window.
struct SignalConfirmation {
    window: Duration,
}

impl LeaveConfirmation for SignalConfirmation {
    fn confirm_leave(&self, navigation: &Navigation) -> impl Future<Output = bool> + Send {
        let window = self.window;
        tracing::warn!(
            "Monitoring is active ({:?}). Press Ctrl+C again within {}s to stop.",
            navigation,
            window.as_secs()
        );
        async move {
            tokio::select! {
                result = signal::ctrl_c() => result.is_ok(),
                _ = terminate() => true,
                _ = sleep(window) => {
                    tracing::info!("Leave not confirmed, monitoring continues");
                    false
                }
            }
        }
    }
}

async fn wait_for_leave(session: &MonitoringSession, window: Duration) {
    let confirmation = SignalConfirmation { window };
    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
                match session.navigate(Navigation::Close, &confirmation).await {
                    Ok(NavigationOutcome::Proceed(_)) => return,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::error!("Leave request failed: {}", e);
                        return;
                    }
                }
            }
            _ = terminate() => {
                tracing::info!("Terminate signal received");
                // The host has already decided; record the leave as confirmed.
                if session.is_armed() && session.begin_navigation(Navigation::Close).is_ok() {
                    let _ = session.resolve_navigation(true);
                }
                return;
            }
        }
    }
}

async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            tracing::error!("Failed to install terminate handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
