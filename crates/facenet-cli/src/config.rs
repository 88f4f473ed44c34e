//! CLI configuration management
//!
//! Handles loading and parsing of `facenet.toml`.

use facenet_models::download::{default_cache_dir, HttpFetcherConfig};
use facenet_models::shape::{InputShape, MIN_SIZE};
use facenet_models::InceptionResNetV1Config;
use facenet_types::{DataFormat, Device, FacenetError, Pooling, Result, Weights};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// CLI configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Model construction settings
    pub model: ModelCliConfig,

    /// Weight download settings
    pub download: DownloadConfig,
}

/// Model CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelCliConfig {
    /// Channel ordering of image tensors
    pub data_format: DataFormat,

    /// Device spec: `cpu`, `cuda[:N]` or `metal[:N]`
    pub device: String,

    /// Square input resolution
    pub input_size: usize,

    /// Input channels (1 or 3 when decoding images)
    pub channels: usize,

    /// Pooling of the last feature map
    pub pooling: Pooling,

    /// Parameter initialization
    pub weights: Weights,
}

impl Default for ModelCliConfig {
    fn default() -> Self {
        Self {
            data_format: DataFormat::ChannelsLast,
            device: "cpu".to_string(),
            input_size: 160,
            channels: 3,
            pooling: Pooling::Avg,
            weights: Weights::None,
        }
    }
}

/// Download configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Cache root; artifacts land in `<cache_dir>/models`
    pub cache_dir: String,

    /// Whole-request timeout in seconds
    pub timeout_seconds: u64,

    /// Connect timeout in seconds
    pub connect_timeout_seconds: u64,

    /// Show a progress bar while downloading
    pub show_progress: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            cache_dir: "~/.facenet".to_string(),
            timeout_seconds: 3600,
            connect_timeout_seconds: 30,
            show_progress: true,
        }
    }
}

impl CliConfig {
    /// Load configuration from file, writing the defaults when it is missing
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            let default_config = Self::default();
            let content = toml::to_string_pretty(&default_config).map_err(|e| {
                FacenetError::configuration(format!("Failed to serialize default config: {}", e))
            })?;

            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).await.map_err(|e| {
                        FacenetError::io(format!("Failed to create config directory: {}", e))
                    })?;
                }
            }

            fs::write(path, content)
                .await
                .map_err(|e| FacenetError::io(format!("Failed to write default config: {}", e)))?;

            return Ok(default_config);
        }

        let content = fs::read_to_string(path)
            .await
            .map_err(|e| FacenetError::io(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| FacenetError::configuration(format!("Failed to parse config: {}", e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.model.input_size < MIN_SIZE {
            return Err(FacenetError::configuration(format!(
                "model.input_size must be at least {}, got {}",
                MIN_SIZE, self.model.input_size
            )));
        }

        if self.model.channels == 0 {
            return Err(FacenetError::configuration(
                "model.channels cannot be 0".to_string(),
            ));
        }

        self.device()?;

        if self.download.timeout_seconds == 0 || self.download.connect_timeout_seconds == 0 {
            return Err(FacenetError::configuration(
                "Download timeouts cannot be 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn device(&self) -> Result<Device> {
        self.model.device.parse()
    }

    /// Cache root, honouring `FACENET_HOME`.
    pub fn cache_dir(&self) -> PathBuf {
        if let Ok(home) = std::env::var("FACENET_HOME") {
            if !home.is_empty() {
                return PathBuf::from(home);
            }
        }
        if self.download.cache_dir.is_empty() {
            return default_cache_dir();
        }
        PathBuf::from(shellexpand::tilde(&self.download.cache_dir).to_string())
    }

    pub fn fetcher_config(&self) -> HttpFetcherConfig {
        HttpFetcherConfig {
            cache_dir: self.cache_dir(),
            timeout: Duration::from_secs(self.download.timeout_seconds),
            connect_timeout: Duration::from_secs(self.download.connect_timeout_seconds),
            show_progress: self.download.show_progress,
        }
    }

    /// Model options for a headless network with the configured input.
    pub fn model_config(&self) -> InceptionResNetV1Config {
        InceptionResNetV1Config::default()
            .with_weights(self.model.weights)
            .with_pooling(self.model.pooling)
            .with_data_format(self.model.data_format)
            .with_input_shape(InputShape::square(
                self.model.input_size,
                self.model.channels,
            ))
    }
}
