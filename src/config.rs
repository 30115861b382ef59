use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::detect::HistoryCaps;
use crate::ingest::{Resolution, SourceConfig};
use crate::overlay::Dimensions;
use crate::scheduler::CaptureSettings;
use crate::transport::{ChannelConfig, ReconnectPolicy};

const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8000/ws/detect";
const DEFAULT_DEVICE: &str = "stub://front";
const DEFAULT_DISPLAY_WIDTH: u32 = 640;
const DEFAULT_DISPLAY_HEIGHT: u32 = 360;

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    channel: Option<ChannelConfigFile>,
    capture: Option<CaptureConfigFile>,
    camera: Option<CameraConfigFile>,
    history: Option<HistoryConfigFile>,
    display: Option<DisplayConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ChannelConfigFile {
    endpoint: Option<String>,
    max_reconnect_attempts: Option<u32>,
    reconnect_base_delay_ms: Option<u64>,
    keepalive_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    interval_ms: Option<u64>,
    flip_horizontal: Option<bool>,
    jpeg_quality: Option<u8>,
    answer_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    recovery_delay_ms: Option<u64>,
    max_recovery_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct HistoryConfigFile {
    objects: Option<usize>,
    text: Option<usize>,
    logs: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct DisplayConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    mirror: Option<bool>,
}

/// Settings for one pipeline session.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub device: String,
    pub camera: SourceConfig,
    pub channel: ChannelConfig,
    pub capture: CaptureSettings,
    pub history: HistoryCaps,
    pub display: Dimensions,
    /// Show the preview mirrored.
    pub mirror_display: bool,
}

impl PipelineConfig {
    /// Built-in defaults, before any file or environment overrides.
    pub fn defaults() -> Result<Self> {
        Ok(Self::with_endpoint(parse_endpoint(DEFAULT_ENDPOINT)?))
    }

    /// Defaults everywhere except the endpoint.
    pub fn with_endpoint(endpoint: Url) -> Self {
        Self {
            device: DEFAULT_DEVICE.to_string(),
            camera: SourceConfig::default(),
            channel: ChannelConfig {
                endpoint,
                reconnect: ReconnectPolicy::default(),
                keepalive_interval: crate::transport::DEFAULT_KEEPALIVE_INTERVAL,
            },
            capture: CaptureSettings::default(),
            history: HistoryCaps::default(),
            display: Dimensions::new(DEFAULT_DISPLAY_WIDTH, DEFAULT_DISPLAY_HEIGHT),
            mirror_display: true,
        }
    }

    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SIGHTLINE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Result<Self> {
        let mut cfg = Self::defaults()?;

        if let Some(channel) = file.channel {
            if let Some(endpoint) = channel.endpoint {
                cfg.channel.endpoint = parse_endpoint(&endpoint)?;
            }
            if let Some(attempts) = channel.max_reconnect_attempts {
                cfg.channel.reconnect.max_attempts = attempts;
            }
            if let Some(ms) = channel.reconnect_base_delay_ms {
                cfg.channel.reconnect.base_delay = Duration::from_millis(ms);
            }
            if let Some(ms) = channel.keepalive_interval_ms {
                cfg.channel.keepalive_interval = Duration::from_millis(ms);
            }
        }
        if let Some(capture) = file.capture {
            cfg.capture.interval = capture
                .interval_ms
                .map(Duration::from_millis)
                .unwrap_or(cfg.capture.interval);
            cfg.capture.flip_horizontal = capture
                .flip_horizontal
                .unwrap_or(cfg.capture.flip_horizontal);
            cfg.capture.jpeg_quality = capture.jpeg_quality.unwrap_or(cfg.capture.jpeg_quality);
            cfg.capture.answer_timeout = capture
                .answer_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(cfg.capture.answer_timeout);
        }
        if let Some(camera) = file.camera {
            cfg.device = camera.device.unwrap_or(cfg.device);
            cfg.camera.ideal = Resolution {
                width: camera.width.unwrap_or(cfg.camera.ideal.width),
                height: camera.height.unwrap_or(cfg.camera.ideal.height),
            };
            cfg.camera.recovery_delay = camera
                .recovery_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(cfg.camera.recovery_delay);
            cfg.camera.max_recovery_attempts = camera
                .max_recovery_attempts
                .unwrap_or(cfg.camera.max_recovery_attempts);
        }
        if let Some(history) = file.history {
            cfg.history = HistoryCaps {
                objects: history.objects.unwrap_or(cfg.history.objects),
                text: history.text.unwrap_or(cfg.history.text),
                logs: history.logs.unwrap_or(cfg.history.logs),
            };
        }
        if let Some(display) = file.display {
            cfg.display = Dimensions::new(
                display.width.unwrap_or(cfg.display.width),
                display.height.unwrap_or(cfg.display.height),
            );
            cfg.mirror_display = display.mirror.unwrap_or(cfg.mirror_display);
        }
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(endpoint) = std::env::var("SIGHTLINE_ENDPOINT") {
            if !endpoint.trim().is_empty() {
                self.channel.endpoint = parse_endpoint(endpoint.trim())?;
            }
        }
        if let Ok(device) = std::env::var("SIGHTLINE_DEVICE") {
            if !device.trim().is_empty() {
                self.device = device.trim().to_string();
            }
        }
        if let Some(ms) = env_parse::<u64>("SIGHTLINE_CAPTURE_INTERVAL_MS")? {
            self.capture.interval = Duration::from_millis(ms);
        }
        if let Ok(flip) = std::env::var("SIGHTLINE_FLIP_HORIZONTAL") {
            if !flip.trim().is_empty() {
                self.capture.flip_horizontal = parse_bool(&flip).ok_or_else(|| {
                    anyhow!("SIGHTLINE_FLIP_HORIZONTAL must be true/false, got '{}'", flip)
                })?;
            }
        }
        if let Some(attempts) = env_parse::<u32>("SIGHTLINE_MAX_RECONNECT_ATTEMPTS")? {
            self.channel.reconnect.max_attempts = attempts;
        }
        if let Some(ms) = env_parse::<u64>("SIGHTLINE_RECONNECT_BASE_DELAY_MS")? {
            self.channel.reconnect.base_delay = Duration::from_millis(ms);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        match self.channel.endpoint.scheme() {
            "ws" => {}
            "wss" if cfg!(feature = "tls") => {}
            "wss" => {
                return Err(anyhow!(
                    "wss endpoints require the 'tls' feature.\n\
                     Recompile with: cargo build --features tls"
                ))
            }
            other => {
                return Err(anyhow!(
                    "endpoint scheme must be ws or wss, got '{}'",
                    other
                ))
            }
        }
        if self.device.trim().is_empty() {
            return Err(anyhow!("camera device must not be empty"));
        }
        if self.capture.interval.is_zero() {
            return Err(anyhow!("capture interval must be greater than zero"));
        }
        if !(1..=100).contains(&self.capture.jpeg_quality) {
            return Err(anyhow!(
                "jpeg quality must be within 1..=100, got {}",
                self.capture.jpeg_quality
            ));
        }
        if self.camera.ideal.width == 0 || self.camera.ideal.height == 0 {
            return Err(anyhow!(
                "camera resolution must be non-zero, got {}",
                self.camera.ideal
            ));
        }
        if self.history.objects == 0 || self.history.text == 0 || self.history.logs == 0 {
            return Err(anyhow!("history caps must be greater than zero"));
        }
        if self.display.is_empty() {
            return Err(anyhow!("display size must be non-zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn parse_endpoint(value: &str) -> Result<Url> {
    Url::parse(value).map_err(|e| anyhow!("invalid endpoint '{}': {}", value, e))
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be an unsigned integer, got '{}'", key, value)),
        _ => Ok(None),
    }
}

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = PipelineConfig::defaults().unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.channel.endpoint.as_str(), DEFAULT_ENDPOINT);
        assert_eq!(cfg.capture.interval, Duration::from_millis(500));
        assert_eq!(cfg.channel.reconnect.max_attempts, 5);
        assert_eq!(cfg.channel.reconnect.base_delay, Duration::from_millis(3000));
        assert_eq!(cfg.history, HistoryCaps::default());
        assert!(cfg.mirror_display);
        assert!(!cfg.capture.flip_horizontal);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let file: PipelineConfigFile =
            serde_json::from_str(r#"{"capture": {"interval_ms": 250}}"#).unwrap();
        let cfg = PipelineConfig::from_file(file).unwrap();
        assert_eq!(cfg.capture.interval, Duration::from_millis(250));
        assert_eq!(cfg.capture.answer_timeout, Duration::from_secs(10));
        assert_eq!(cfg.capture.jpeg_quality, 80);
        assert_eq!(cfg.device, DEFAULT_DEVICE);
    }

    #[test]
    fn rejects_non_websocket_endpoint() {
        let cfg = PipelineConfig::with_endpoint(Url::parse("http://localhost/detect").unwrap());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn wss_follows_tls_feature() {
        let cfg = PipelineConfig::with_endpoint(Url::parse("wss://detect.example.net/ws").unwrap());
        assert_eq!(cfg.validate().is_ok(), cfg!(feature = "tls"));
    }

    #[test]
    fn rejects_zero_interval_and_bad_quality() {
        let mut cfg = PipelineConfig::defaults().unwrap();
        cfg.capture.interval = Duration::ZERO;
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::defaults().unwrap();
        cfg.capture.jpeg_quality = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bool_parsing_is_lenient() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" off "), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
