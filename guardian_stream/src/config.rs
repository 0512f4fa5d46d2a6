use serde::Deserialize;
use std::{path::PathBuf, time::Duration};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub backend: BackendConfig,
    pub capture: CaptureConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub guard: GuardConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        self.capture.validate()?;
        self.streaming.validate()?;
        self.overlay.validate()?;
        Ok(())
    }
}

/// Local operator surface (status, preview feed, metrics).
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Inference backend reachable over the streaming socket and the settings API.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub secure: bool,
    #[serde(default = "default_stream_path")]
    pub stream_path: String,
    #[serde(default = "default_settings_path")]
    pub settings_path: String,
}

fn default_stream_path() -> String {
    "/security/ws".into()
}

fn default_settings_path() -> String {
    "/security/mediapipe".into()
}

impl BackendConfig {
    pub fn get_stream_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}{}", scheme, self.host, self.port, self.stream_path)
    }

    pub fn get_settings_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!(
            "{}://{}:{}{}",
            scheme, self.host, self.port, self.settings_path
        )
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBackendKind {
    Synthetic,
    Opencv,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyntheticDeviceConfig {
    pub id: String,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaptureConfig {
    pub backend: CaptureBackendKind,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default = "default_frame_size")]
    pub width: u32,
    #[serde(default = "default_frame_size")]
    pub height: u32,
    #[serde(default = "default_scan_limit")]
    pub scan_limit: u32,
    #[serde(default)]
    pub synthetic_devices: Vec<SyntheticDeviceConfig>,
}

fn default_frame_size() -> u32 {
    640
}

fn default_scan_limit() -> u32 {
    4
}

impl CaptureConfig {
    fn validate(&self) -> Result<(), String> {
        if self.width == 0 || self.height == 0 {
            return Err(format!(
                "Capture resolution must be non-zero, got {}x{}",
                self.width, self.height
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamingConfig {
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: f32,
}

fn default_frame_interval_ms() -> u64 {
    150
}

fn default_jpeg_quality() -> f32 {
    0.6
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: default_frame_interval_ms(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl StreamingConfig {
    pub fn get_frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    /// JPEG quality on the encoder's 1..=100 scale.
    pub fn get_encoder_quality(&self) -> u8 {
        (self.jpeg_quality * 100.0).round().clamp(1.0, 100.0) as u8
    }

    fn validate(&self) -> Result<(), String> {
        if self.frame_interval_ms == 0 {
            return Err("Frame interval must be at least 1 ms".into());
        }
        if !(self.jpeg_quality > 0.0 && self.jpeg_quality <= 1.0) {
            return Err(format!(
                "JPEG quality must be in (0, 1], got {}",
                self.jpeg_quality
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OverlayConfig {
    #[serde(default = "default_frame_size")]
    pub display_width: u32,
    #[serde(default = "default_frame_size")]
    pub display_height: u32,
    #[serde(default)]
    pub font_path: Option<PathBuf>,
    #[serde(default = "default_preview_fps")]
    pub preview_fps: u64,
}

fn default_preview_fps() -> u64 {
    15
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            display_width: default_frame_size(),
            display_height: default_frame_size(),
            font_path: None,
            preview_fps: default_preview_fps(),
        }
    }
}

fn fps_to_delay_ms(fps: u64) -> u64 {
    (1000.0 / fps as f64).round() as u64
}

impl OverlayConfig {
    pub fn get_preview_delay_ms(&self) -> u64 {
        fps_to_delay_ms(self.preview_fps)
    }

    fn validate(&self) -> Result<(), String> {
        if self.display_width == 0 || self.display_height == 0 {
            return Err("Display resolution must be non-zero".into());
        }
        if self.preview_fps == 0 {
            return Err("Preview fps must be at least 1".into());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GuardConfig {
    #[serde(default = "default_confirm_window_secs")]
    pub confirm_window_secs: u64,
}

fn default_confirm_window_secs() -> u64 {
    5
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            confirm_window_secs: default_confirm_window_secs(),
        }
    }
}

impl GuardConfig {
    pub fn get_confirm_window(&self) -> Duration {
        Duration::from_secs(self.confirm_window_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir().expect("Failed to determine the current directory");
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .expect("Failed to parse APP_ENVIRONMENT");

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(format!("{}.yaml", environment.as_str())),
        ))
        .add_source(
            config::Environment::with_prefix("GS")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;
    if let Err(e) = config.validate() {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(config::ConfigError::Message(e));
    }

    Ok(config)
}
