//! Adapter file loading
//!
//! Adapter files store one group of tensors per target layer, named
//! `<layer>.<suffix>` where `<layer>` is a kohya-style flattened module path
//! (`lora_unet_down_blocks_0_attentions_0_proj_in`) and `<suffix>` is
//! `oft_blocks`, `alpha`, ...

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use log::{debug, info, warn};
use safetensors::SafeTensors;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::networks::NetworkWeights;

/// A parsed adapter file
#[derive(Debug)]
pub struct AdapterFile {
    pub path: PathBuf,
    /// Per-layer tensor groups, ordered by layer name
    pub layers: BTreeMap<String, NetworkWeights>,
    /// `__metadata__` from the safetensors header
    pub metadata: HashMap<String, String>,
}

impl AdapterFile {
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

/// Split `layer.suffix` at the first dot.
fn split_key(key: &str) -> Option<(&str, &str)> {
    let (layer, suffix) = key.split_once('.')?;
    if layer.is_empty() || suffix.is_empty() {
        return None;
    }
    Some((layer, suffix))
}

/// Group flat adapter tensors into per-layer weight sets.
pub fn group_by_layer(tensors: HashMap<String, Tensor>) -> BTreeMap<String, NetworkWeights> {
    let mut layers: BTreeMap<String, NetworkWeights> = BTreeMap::new();
    for (key, tensor) in tensors {
        match split_key(&key) {
            Some((layer, suffix)) => {
                layers
                    .entry(layer.to_string())
                    .or_insert_with(|| NetworkWeights::new(layer, HashMap::new()))
                    .w
                    .insert(suffix.to_string(), tensor);
            }
            None => warn!("Ignoring adapter tensor without a layer prefix: {}", key),
        }
    }
    layers
}

/// Load an adapter `.safetensors` file onto `device`.
pub fn load_adapter(path: &Path, device: &Device) -> Result<AdapterFile> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read adapter file: {}", path.display()))?;

    let (_, header) = SafeTensors::read_metadata(&bytes)
        .with_context(|| format!("Invalid safetensors header: {}", path.display()))?;
    let metadata = header.metadata().clone().unwrap_or_default();
    for (key, value) in &metadata {
        debug!("  adapter metadata {} = {}", key, value);
    }

    let tensors = candle_core::safetensors::load_buffer(&bytes, device)
        .with_context(|| format!("Failed to load adapter tensors: {}", path.display()))?;
    let tensor_count = tensors.len();
    let layers = group_by_layer(tensors);

    info!(
        "Loaded adapter {} ({} tensors, {} layers)",
        path.display(),
        tensor_count,
        layers.len()
    );

    Ok(AdapterFile {
        path: path.to_path_buf(),
        layers,
        metadata,
    })
}
