//! Base checkpoint loading with format detection

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use log::{info, warn};
use std::collections::HashMap;
use std::path::Path;

/// Layout of the checkpoint keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    /// Single-file SD checkpoint (`model.diffusion_model.` ...)
    StableDiffusion,
    /// Bare diffusers component (`down_blocks.` ...)
    Diffusers,
    Unknown,
}

pub fn detect_format(tensors: &HashMap<String, Tensor>) -> CheckpointFormat {
    if tensors.keys().any(|k| k.starts_with("model.diffusion_model.")) {
        CheckpointFormat::StableDiffusion
    } else if tensors
        .keys()
        .any(|k| k.starts_with("conv_in.") || k.starts_with("down_blocks.") || k.starts_with("text_model."))
    {
        CheckpointFormat::Diffusers
    } else {
        CheckpointFormat::Unknown
    }
}

/// Load all checkpoint tensors, optionally casting floating point weights to `dtype`.
pub fn load_checkpoint(
    path: &Path,
    device: &Device,
    dtype: Option<DType>,
) -> Result<HashMap<String, Tensor>> {
    let tensors = candle_core::safetensors::load(path, device)
        .with_context(|| format!("Failed to load checkpoint: {}", path.display()))?;

    match detect_format(&tensors) {
        CheckpointFormat::StableDiffusion => info!("Detected SD single-file checkpoint format"),
        CheckpointFormat::Diffusers => info!("Detected Diffusers format"),
        CheckpointFormat::Unknown => {
            warn!("Unrecognised checkpoint layout");
            warn!("First few keys: {:?}", tensors.keys().take(5).collect::<Vec<_>>());
        }
    }

    let Some(dtype) = dtype else {
        return Ok(tensors);
    };

    tensors
        .into_iter()
        .map(|(key, tensor)| -> Result<(String, Tensor)> {
            let tensor = if tensor.dtype().is_float() {
                tensor.to_dtype(dtype)?
            } else {
                tensor
            };
            Ok((key, tensor))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_format() -> Result<()> {
        let device = Device::Cpu;
        let t = Tensor::zeros(1, DType::F32, &device)?;

        let mut sd = HashMap::new();
        sd.insert("model.diffusion_model.input_blocks.0.0.weight".to_string(), t.clone());
        assert_eq!(detect_format(&sd), CheckpointFormat::StableDiffusion);

        let mut diffusers = HashMap::new();
        diffusers.insert("conv_in.weight".to_string(), t.clone());
        assert_eq!(detect_format(&diffusers), CheckpointFormat::Diffusers);

        let mut other = HashMap::new();
        other.insert("foo.weight".to_string(), t);
        assert_eq!(detect_format(&other), CheckpointFormat::Unknown);
        Ok(())
    }

    #[test]
    fn test_load_casts_float_weights() -> Result<()> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("unet.safetensors");

        let mut tensors = HashMap::new();
        tensors.insert("conv_in.weight".to_string(), Tensor::ones((2, 2), DType::F32, &device)?);
        tensors.insert("position_ids".to_string(), Tensor::zeros(4, DType::U32, &device)?);
        candle_core::safetensors::save(&tensors, &path)?;

        let loaded = load_checkpoint(&path, &device, Some(DType::F16))?;
        assert_eq!(loaded["conv_in.weight"].dtype(), DType::F16);
        assert_eq!(loaded["position_ids"].dtype(), DType::U32);
        Ok(())
    }
}
