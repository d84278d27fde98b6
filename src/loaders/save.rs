//! Save merged weights as safetensors

use anyhow::{bail, Result};
use candle_core::{DType, Tensor};
use log::info;
use safetensors::{serialize_to_file, Dtype as SafeDtype, View};
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;

/// Host copy of a tensor in safetensors layout
pub struct TensorBytes {
    dtype: SafeDtype,
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

impl TensorBytes {
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let flat = tensor.flatten_all()?;
        let (dtype, bytes) = match tensor.dtype() {
            DType::F32 => (SafeDtype::F32, bytemuck::cast_slice(&flat.to_vec1::<f32>()?).to_vec()),
            DType::F64 => (SafeDtype::F64, bytemuck::cast_slice(&flat.to_vec1::<f64>()?).to_vec()),
            DType::F16 => (
                SafeDtype::F16,
                bytemuck::cast_slice(&flat.to_vec1::<half::f16>()?).to_vec(),
            ),
            DType::BF16 => (
                SafeDtype::BF16,
                bytemuck::cast_slice(&flat.to_vec1::<half::bf16>()?).to_vec(),
            ),
            other => bail!("Unsupported dtype for safetensors: {:?}", other),
        };
        Ok(Self {
            dtype,
            shape: tensor.dims().to_vec(),
            bytes,
        })
    }
}

impl View for &TensorBytes {
    fn dtype(&self) -> SafeDtype {
        self.dtype
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<[u8]> {
        Cow::Borrowed(&self.bytes)
    }

    fn data_len(&self) -> usize {
        self.bytes.len()
    }
}

/// Write `tensors` to `output_path`, sorted by key, with `metadata` in the header.
pub fn save_merged(
    tensors: &HashMap<String, Tensor>,
    output_path: &Path,
    metadata: HashMap<String, String>,
) -> Result<()> {
    let mut converted: Vec<(&str, TensorBytes)> = Vec::with_capacity(tensors.len());
    for (key, tensor) in tensors {
        converted.push((key.as_str(), TensorBytes::from_tensor(tensor)?));
    }
    converted.sort_by(|(a, _), (b, _)| a.cmp(b));

    let views: Vec<(&str, &TensorBytes)> = converted.iter().map(|(k, v)| (*k, v)).collect();
    let metadata = if metadata.is_empty() { None } else { Some(metadata) };
    serialize_to_file(views, &metadata, output_path)?;

    info!("Saved {} tensors to {:?}", converted.len(), output_path);
    Ok(())
}
