use guardian_proto::{FrameInterval, InferenceSettings, InvalidInterval};
use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(#[from] InvalidInterval),
    #[error("Settings request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Settings endpoint answered {0}")]
    Rejected(StatusCode),
    #[error("Invalid settings url: {0}")]
    Url(#[from] url::ParseError),
}

/// Request/response access to the backend's pose-model settings.
///
/// Keeps the last settings seen in a process-local cache. A failed call
/// never touches the cache and is not retried. An accepted write on an empty
/// cache reads the settings back so the cache reflects it.
pub struct SettingsSync {
    client: Client,
    base: Url,
    cache: RwLock<Option<InferenceSettings>>,
}

impl SettingsSync {
    pub fn new(base_url: &str) -> Result<Self, SettingsError> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base,
            cache: RwLock::new(None),
        })
    }

    pub fn cached(&self) -> Option<InferenceSettings> {
        *self.cache.read()
    }

    #[instrument(skip(self))]
    pub async fn fetch_settings(&self) -> Result<InferenceSettings, SettingsError> {
        let response = self.client.get(self.base.join("settings")?).send().await?;
        if !response.status().is_success() {
            return Err(SettingsError::Rejected(response.status()));
        }
        let settings = response.json::<InferenceSettings>().await?;
        *self.cache.write() = Some(settings);
        Ok(settings)
    }

    /// `Ok(false)` when the backend refused the change.
    #[instrument(skip(self))]
    pub async fn set_enabled(&self, enabled: bool) -> Result<bool, SettingsError> {
        let accepted = self.post("toggle", &[("enabled", enabled.to_string())]).await?;
        if accepted {
            self.apply(|settings| settings.enabled = enabled).await;
            tracing::info!("Pose model {}", if enabled { "enabled" } else { "disabled" });
        }
        Ok(accepted)
    }

    /// Rejects values outside 1..=30 without contacting the backend.
    #[instrument(skip(self))]
    pub async fn set_interval(&self, interval: i64) -> Result<bool, SettingsError> {
        let interval = FrameInterval::new(interval)?;
        let accepted = self
            .post("interval", &[("interval", interval.get().to_string())])
            .await?;
        if accepted {
            self.apply(|settings| settings.frame_interval = interval).await;
            tracing::info!("Pose model interval set to {}", interval.get());
        }
        Ok(accepted)
    }

    /// Flips the enabled flag, fetching the current value first when nothing
    /// is cached.
    pub async fn toggle(&self) -> Result<bool, SettingsError> {
        let current = match self.cached() {
            Some(settings) => settings.enabled,
            None => self.fetch_settings().await?.enabled,
        };
        self.set_enabled(!current).await
    }

    async fn apply(&self, change: impl FnOnce(&mut InferenceSettings)) {
        let updated = match self.cache.write().as_mut() {
            Some(settings) => {
                change(settings);
                true
            }
            None => false,
        };
        if !updated {
            if let Err(e) = self.fetch_settings().await {
                tracing::warn!("Accepted change not cached: {}", e);
            }
        }
    }

    async fn post(&self, endpoint: &str, query: &[(&str, String)]) -> Result<bool, SettingsError> {
        let response = self
            .client
            .post(self.base.join(endpoint)?)
            .query(query)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            tracing::warn!("Settings {} rejected with {}", endpoint, status);
        }
        Ok(status.is_success())
    }
}
