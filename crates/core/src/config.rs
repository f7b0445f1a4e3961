use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::controller::ControllerOptions;
use crate::frame_adapter::ResampleAlgorithm;
use crate::model_catalog::DEFAULT_DESCRIPTION_EXTENSION;
use crate::ort_backend::OrtBackendOptions;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "FRAMEBRIDGE_DATA_DIR";
pub const DEFAULT_TARGET_HEIGHT: u32 = 540;

/// PCI vendor ids of Intel, NVIDIA and AMD display adapters.
pub const DEFAULT_ALLOWED_VENDOR_IDS: [&str; 3] = ["0x8086", "0x10de", "0x1002"];

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub inference: InferenceConfig,
    pub capability: CapabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InferenceConfig {
    pub target_height: u32,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub device_index: usize,
    pub resample: ResampleAlgorithm,
    pub extension: String,
    /// Scale of the model's float pixel range: 1.0 for [0, 1], 255.0 for [0, 255].
    pub value_range: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CapabilityConfig {
    pub allowed_vendor_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            target_height: DEFAULT_TARGET_HEIGHT,
            enabled: true,
            model: None,
            device_index: 0,
            resample: ResampleAlgorithm::default(),
            extension: DEFAULT_DESCRIPTION_EXTENSION.to_string(),
            value_range: 1.0,
        }
    }
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            allowed_vendor_ids: DEFAULT_ALLOWED_VENDOR_IDS
                .iter()
                .map(|id| id.to_string())
                .collect(),
            force: None,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config: {}", path.display()))?;
        Ok(config)
    }

    /// Reject values that would bind a degenerate session.
    pub fn validate(&self) -> Result<()> {
        if self.inference.target_height == 0 {
            bail!("inference.target_height must be at least 1");
        }
        let range = self.inference.value_range;
        if !range.is_finite() || range <= 0.0 {
            bail!("inference.value_range must be a positive number, got {range}");
        }
        Ok(())
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Controller settings, with relative paths anchored at `data_dir`.
    pub fn controller_options(&self, data_dir: &Path) -> ControllerOptions {
        ControllerOptions {
            models_dir: resolve_relative_to(data_dir, &self.paths.models_dir),
            extension: self.inference.extension.clone(),
            model: self.inference.model.clone(),
            device_index: self.inference.device_index,
            resample: self.inference.resample,
            enabled: self.inference.enabled,
        }
    }

    pub fn backend_options(&self, data_dir: &Path) -> OrtBackendOptions {
        OrtBackendOptions {
            value_range: self.inference.value_range,
            trt_cache_dir: Some(resolve_relative_to(data_dir, &self.paths.trt_cache_dir)),
        }
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. FRAMEBRIDGE_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and a default config.toml on first run.
/// An existing config file is never overwritten.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns `path` as-is if absolute, otherwise joined to `base`.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
