//! Typed configuration loaded from a YAML file, validated by hand the same
//! way `flowsensor-core`'s interface validator validates its own strings —
//! no derive-validator crate, just explicit checks with a `thiserror` enum.

use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to parse config file {0}: {1}")]
    Parse(PathBuf, serde_yaml::Error),
    #[error("sensor_id must be 1-64 characters, start/end alphanumeric, and contain only letters, digits, spaces, '_' or '-'")]
    InvalidSensorId,
    #[error("enigma_api.upload is true but enigma_api.server is empty")]
    MissingServer,
    #[error("enigma_api.upload is true but enigma_api.api_key is empty")]
    MissingApiKey,
    #[error("capture.window_seconds must be greater than zero")]
    InvalidWindow,
    #[error("enigma_api.max_payload_size_mb must be greater than zero")]
    InvalidPayloadLimit,
    #[error("zeek.sampling_percentage must be between 1 and 100")]
    InvalidSamplingPercentage,
    #[error(transparent)]
    InvalidInterface(#[from] flowsensor_core::InterfaceError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    pub output_dir: PathBuf,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    #[serde(default, rename = "loop")]
    pub run_loop: bool,
    #[serde(default = "default_interface")]
    pub interface: String,
}

fn default_window_seconds() -> u64 {
    60
}

fn default_interface() -> String {
    "any".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnigmaApiConfig {
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub upload: bool,
    #[serde(default = "default_max_payload_size_mb")]
    pub max_payload_size_mb: u64,
    #[serde(default = "default_terminal_status_code")]
    pub terminal_status_code: u16,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,
}

fn default_max_payload_size_mb() -> u64 {
    25
}

fn default_terminal_status_code() -> u16 {
    410
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_delay_seconds() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct BufferingConfig {
    #[serde(default = "default_buffering_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_buffer_max_age_hours")]
    pub max_age_hours: u64,
}

fn default_buffering_dir() -> PathBuf {
    PathBuf::from("logs/buffer")
}

fn default_buffer_max_age_hours() -> u64 {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZeekConfig {
    #[serde(default = "default_sampling_percentage")]
    pub sampling_percentage: u8,
}

fn default_sampling_percentage() -> u8 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub file: Option<PathBuf>,
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u64,
    #[serde(default = "default_max_backups")]
    pub max_backups: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_size_mb() -> u64 {
    10
}

fn default_log_retention_days() -> u64 {
    30
}

fn default_max_backups() -> u32 {
    5
}

/// A watch directory alternative to live capture, mutually exclusive with
/// `capture.interface` at runtime (but both may be present in the file; the
/// CLI decides which front-end to run based on which was passed on the
/// command line).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct WatchConfig {
    pub dir: Option<PathBuf>,
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_stable_seconds")]
    pub stable_seconds: u64,
}

fn default_poll_interval_seconds() -> u64 {
    5
}

fn default_stable_seconds() -> u64 {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorConfig {
    pub sensor_id: String,
    pub capture: CaptureConfig,
    pub enigma_api: EnigmaApiConfig,
    #[serde(default)]
    pub buffering: BufferingConfig,
    #[serde(default)]
    pub zeek: ZeekConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub watch: WatchConfig,
}

impl Default for BufferingConfig {
    fn default() -> Self {
        Self {
            dir: default_buffering_dir(),
            max_age_hours: default_buffer_max_age_hours(),
        }
    }
}

impl Default for ZeekConfig {
    fn default() -> Self {
        Self {
            sampling_percentage: default_sampling_percentage(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
            max_size_mb: default_max_size_mb(),
            log_retention_days: default_log_retention_days(),
            max_backups: default_max_backups(),
        }
    }
}

/// `sensor_id`: 1-64 characters, starts and ends with an alphanumeric
/// character, and is otherwise drawn from `[A-Za-z0-9 _-]`.
fn validate_sensor_id(id: &str) -> Result<(), ConfigError> {
    let len = id.chars().count();
    if len == 0 || len > 64 {
        return Err(ConfigError::InvalidSensorId);
    }
    let first = id.chars().next().unwrap();
    let last = id.chars().next_back().unwrap();
    if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
        return Err(ConfigError::InvalidSensorId);
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '_' || c == '-')
    {
        return Err(ConfigError::InvalidSensorId);
    }
    Ok(())
}

impl SensorConfig {
    pub async fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        let config: SensorConfig =
            serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_sensor_id(&self.sensor_id)?;
        if self.capture.window_seconds == 0 {
            return Err(ConfigError::InvalidWindow);
        }
        if self.enigma_api.max_payload_size_mb == 0 {
            return Err(ConfigError::InvalidPayloadLimit);
        }
        if self.zeek.sampling_percentage == 0 || self.zeek.sampling_percentage > 100 {
            return Err(ConfigError::InvalidSamplingPercentage);
        }
        if self.enigma_api.upload {
            if self.enigma_api.server.trim().is_empty() {
                return Err(ConfigError::MissingServer);
            }
            if self.enigma_api.api_key.trim().is_empty() {
                return Err(ConfigError::MissingApiKey);
            }
        }
        flowsensor_core::parse_interfaces(&self.capture.interface)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_yaml() -> &'static str {
        r#"
sensor_id: sensor-01
capture:
  output_dir: /var/lib/flowsensor/out
enigma_api:
  server: https://enigma.example.com
  api_key: secret
  upload: true
"#
    }

    #[test]
    fn applies_documented_defaults() {
        let config: SensorConfig = serde_yaml::from_str(base_yaml()).unwrap();
        assert_eq!(config.capture.window_seconds, 60);
        assert_eq!(config.capture.interface, "any");
        assert_eq!(config.enigma_api.max_payload_size_mb, 25);
        assert_eq!(config.buffering.dir, PathBuf::from("logs/buffer"));
        assert_eq!(config.buffering.max_age_hours, 2);
        assert_eq!(config.zeek.sampling_percentage, 100);
        assert_eq!(config.logging.level, "info");
        config.validate().unwrap();
    }

    #[test]
    fn rejects_empty_sensor_id() {
        let yaml = base_yaml().replace("sensor-01", "");
        let config: SensorConfig = serde_yaml::from_str(&yaml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidSensorId)));
    }

    #[test]
    fn rejects_sensor_id_starting_or_ending_with_punctuation() {
        assert!(validate_sensor_id("-sensor").is_err());
        assert!(validate_sensor_id("sensor-").is_err());
        assert!(validate_sensor_id(" sensor").is_err());
    }

    #[test]
    fn rejects_sensor_id_over_64_chars() {
        let long = "a".repeat(65);
        assert!(validate_sensor_id(&long).is_err());
    }

    #[test]
    fn accepts_sensor_id_with_internal_spaces_and_underscores() {
        assert!(validate_sensor_id("sensor 01_east").is_ok());
    }

    #[test]
    fn upload_enabled_requires_server_and_key() {
        let yaml = r#"
sensor_id: sensor-01
capture:
  output_dir: /tmp/out
enigma_api:
  upload: true
"#;
        let config: SensorConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::MissingServer)));
    }

    #[test]
    fn rejects_invalid_sampling_percentage() {
        let yaml = r#"
sensor_id: sensor-01
capture:
  output_dir: /tmp/out
enigma_api:
  upload: false
zeek:
  sampling_percentage: 0
"#;
        let config: SensorConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSamplingPercentage)
        ));
    }
}
