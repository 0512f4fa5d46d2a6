use super::{CaptureBackend, CaptureError, DeviceDescriptor};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::instrument;

pub struct DeviceRegistry {
    backend: Arc<dyn CaptureBackend>,
    devices: RwLock<Vec<DeviceDescriptor>>,
    selected: RwLock<Option<String>>,
}

impl DeviceRegistry {
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        Self {
            backend,
            devices: RwLock::new(Vec::new()),
            selected: RwLock::new(None),
        }
    }

    /// Obtains the capture permission, then enumerates devices.
    ///
    /// The permission stream is stopped before this returns, whether
    /// enumeration succeeds or not. The first device is selected when nothing
    /// is selected yet.
    #[instrument(skip(self))]
    pub async fn list(&self) -> Result<Vec<DeviceDescriptor>, CaptureError> {
        let backend = self.backend.clone();
        let devices = tokio::task::spawn_blocking(move || {
            let mut grant = backend.request_permission()?;
            grant.stop();
            drop(grant);
            backend.enumerate()
        })
        .await??;

        tracing::info!("Found {} capture devices", devices.len());

        {
            let mut selected = self.selected.write();
            if selected.is_none() {
                if let Some(first) = devices.first() {
                    *selected = Some(first.id.clone());
                }
            }
        }
        *self.devices.write() = devices.clone();

        Ok(devices)
    }

    /// Unknown ids are accepted here and rejected when a stream is opened.
    pub fn select(&self, device_id: impl Into<String>) {
        let device_id = device_id.into();
        tracing::info!("Selected capture device {}", device_id);
        *self.selected.write() = Some(device_id);
    }

    pub fn selected(&self) -> Option<String> {
        self.selected.read().clone()
    }

    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        self.devices.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testing::CountingBackend;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_list_releases_permission_stream_and_selects_first() {
        let backend = Arc::new(CountingBackend::default());
        let registry = DeviceRegistry::new(backend.clone());

        let devices = registry.list().await.unwrap();

        assert_eq!(devices.len(), 2);
        assert_eq!(registry.selected().as_deref(), Some("cam1"));
        assert_eq!(backend.opened.load(Ordering::SeqCst), 1);
        assert_eq!(backend.live(), 0);
    }

    #[tokio::test]
    async fn test_list_keeps_existing_selection() {
        let backend = Arc::new(CountingBackend::default());
        let registry = DeviceRegistry::new(backend);
        registry.select("cam2");

        registry.list().await.unwrap();

        assert_eq!(registry.selected().as_deref(), Some("cam2"));
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let backend = Arc::new(CountingBackend::default());
        backend.deny_permission.store(true, Ordering::SeqCst);
        let registry = DeviceRegistry::new(backend.clone());

        let result = registry.list().await;

        assert!(matches!(result, Err(CaptureError::PermissionDenied)));
        assert!(registry.devices().is_empty());
        assert_eq!(backend.live(), 0);
    }

    #[tokio::test]
    async fn test_permission_stream_released_when_enumeration_fails() {
        let backend = Arc::new(CountingBackend::default());
        backend.fail_enumeration.store(true, Ordering::SeqCst);
        let registry = DeviceRegistry::new(backend.clone());

        assert!(registry.list().await.is_err());
        assert_eq!(backend.opened.load(Ordering::SeqCst), 1);
        assert_eq!(backend.live(), 0);
    }

    #[test]
    fn test_select_accepts_unknown_id() {
        let registry = DeviceRegistry::new(Arc::new(CountingBackend::default()));
        registry.select("does-not-exist");
        assert_eq!(registry.selected().as_deref(), Some("does-not-exist"));
    }
}
