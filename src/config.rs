//! Merge job configuration

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

fn default_multiplier() -> f64 {
    1.0
}

fn default_device() -> String {
    "cpu".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// OFT adapter `.safetensors`
    pub adapter: PathBuf,
    /// Base checkpoint `.safetensors`
    pub checkpoint: PathBuf,
    /// Where the merged checkpoint is written
    pub output: PathBuf,
    /// Adapter strength; not clamped
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// `cpu`, `cuda` or `cuda:N`
    #[serde(default = "default_device")]
    pub device: String,
    /// Cast floating point checkpoint weights before merging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,
    /// Fail on adapter layers with no checkpoint counterpart instead of skipping them
    #[serde(default)]
    pub strict: bool,
}

impl MergeConfig {
    pub fn device(&self) -> Result<Device> {
        parse_device(&self.device)
    }

    pub fn dtype(&self) -> Result<Option<DType>> {
        self.dtype.as_deref().map(parse_dtype).transpose()
    }
}

pub fn parse_dtype(name: &str) -> Result<DType> {
    Ok(match name.to_ascii_lowercase().as_str() {
        "fp16" | "f16" | "float16" | "half" => DType::F16,
        "bf16" | "bfloat16" => DType::BF16,
        "fp32" | "f32" | "float32" | "float" => DType::F32,
        "fp64" | "f64" | "float64" | "double" => DType::F64,
        other => bail!("Unsupported dtype: {}", other),
    })
}

pub fn parse_device(name: &str) -> Result<Device> {
    let ordinal = match name.to_ascii_lowercase().as_str() {
        "cpu" => return Ok(Device::Cpu),
        "cuda" => 0,
        other => match other.strip_prefix("cuda:") {
            Some(id) => id
                .parse::<usize>()
                .with_context(|| format!("Invalid CUDA device id: {}", id))?,
            None => bail!("Unsupported device: {}", name),
        },
    };

    match Device::new_cuda(ordinal) {
        Ok(device) => Ok(device),
        Err(e) => {
            log::warn!("CUDA device {} not available: {}. Using CPU.", ordinal, e);
            Ok(Device::Cpu)
        }
    }
}

pub fn load_config(path: &Path) -> Result<MergeConfig> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: MergeConfig = serde_yaml::from_str(&config_str)
        .with_context(|| "Failed to parse YAML config")?;

    Ok(config)
}
