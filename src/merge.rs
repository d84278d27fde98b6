//! Apply an adapter file to a checkpoint

use anyhow::{bail, Context, Result};
use candle_core::Tensor;
use log::{info, warn};
use serde::Serialize;
use std::collections::HashMap;

use crate::config::MergeConfig;
use crate::loaders::{load_adapter, load_checkpoint, save_merged, AdapterFile, KeyMapper};
use crate::networks::{create_module, LayerInfo, OftModule};

/// Outcome of merging one adapter into a checkpoint
#[derive(Debug, Default, Clone, Serialize)]
pub struct MergeReport {
    /// Checkpoint keys that were rewritten
    pub merged: Vec<String>,
    /// Adapter layers with no checkpoint counterpart
    pub unmatched: Vec<String>,
    /// Adapter layers no registered variant can handle
    pub unsupported: Vec<String>,
}

#[cfg(feature = "progress-bar")]
fn progress_bar(len: usize) -> indicatif::ProgressBar {
    let bar = indicatif::ProgressBar::new(len as u64);
    if let Ok(style) = indicatif::ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len}") {
        bar.set_style(style);
    }
    bar.set_message("Merging");
    bar
}

/// Merge every adapter layer into `checkpoint` in place.
///
/// Layers whose target key is missing are skipped with a warning unless
/// `strict` is set. Numerical and shape failures always abort the merge.
/// Merged tensors are staged and written back only once every layer has
/// succeeded, so `checkpoint` is left untouched on error.
pub fn merge_adapter_into(
    checkpoint: &mut HashMap<String, Tensor>,
    adapter: &AdapterFile,
    multiplier: f64,
    strict: bool,
) -> Result<MergeReport> {
    let mapper = KeyMapper::from_checkpoint(checkpoint);
    let mut report = MergeReport::default();
    let mut staged: Vec<(String, Tensor)> = Vec::with_capacity(adapter.len());

    #[cfg(feature = "progress-bar")]
    let bar = progress_bar(adapter.len());

    for (name, weights) in &adapter.layers {
        #[cfg(feature = "progress-bar")]
        bar.inc(1);

        let Some(key) = mapper.lookup(name).map(str::to_string) else {
            if strict {
                bail!("Adapter layer {} has no matching checkpoint weight", name);
            }
            warn!("No checkpoint weight for adapter layer {}, skipping", name);
            report.unmatched.push(name.clone());
            continue;
        };

        let base = &checkpoint[&key];
        let layer = LayerInfo::from_weight_shape(base.dims())
            .with_context(|| format!("Unsupported weight shape {:?} for {}", base.dims(), key))?;

        let Some(module) = create_module(weights, &layer)
            .with_context(|| format!("Failed to attach adapter layer {}", name))?
        else {
            warn!("No adapter variant recognises layer {}, skipping", name);
            report.unsupported.push(name.clone());
            continue;
        };

        let merged = module
            .calc_updown(base, multiplier)
            .with_context(|| format!("Failed to merge adapter layer {} into {}", name, key))?;
        report.merged.push(key.clone());
        staged.push((key, merged));
    }

    #[cfg(feature = "progress-bar")]
    bar.finish_and_clear();

    checkpoint.extend(staged);

    info!(
        "Merged {} layers ({} unmatched, {} unsupported) at multiplier {}",
        report.merged.len(),
        report.unmatched.len(),
        report.unsupported.len(),
        multiplier
    );
    Ok(report)
}

/// Run a merge job end to end: load, merge, save.
pub fn merge_checkpoint(config: &MergeConfig) -> Result<MergeReport> {
    let device = config.device()?;
    let adapter = load_adapter(&config.adapter, &device)?;
    let mut checkpoint = load_checkpoint(&config.checkpoint, &device, config.dtype()?)?;

    let report = merge_adapter_into(&mut checkpoint, &adapter, config.multiplier, config.strict)?;

    let mut metadata = HashMap::new();
    metadata.insert("oft_merge_adapter".to_string(), config.adapter.display().to_string());
    metadata.insert("oft_merge_multiplier".to_string(), config.multiplier.to_string());
    metadata.insert("oft_merge_layers".to_string(), report.merged.len().to_string());
    save_merged(&checkpoint, &config.output, metadata)?;

    Ok(report)
}

/// Per-layer summary of an OFT adapter
#[derive(Debug, Clone, Serialize)]
pub struct LayerSummary {
    pub name: String,
    pub num_blocks: usize,
    pub block_size: usize,
    pub alpha: f64,
    pub constraint: f64,
    pub norm: f64,
    pub clamped_norm: f64,
}

impl LayerSummary {
    pub fn clamp_active(&self) -> bool {
        self.norm > self.constraint
    }
}

/// Summarise the OFT layers of an adapter.
///
/// The output dimension is taken from the block layout, so no checkpoint is needed.
pub fn inspect_adapter(adapter: &AdapterFile) -> Result<Vec<LayerSummary>> {
    let mut summaries = Vec::new();
    for (name, weights) in &adapter.layers {
        let Some(blocks) = weights.get("oft_blocks") else {
            continue;
        };
        let dims = blocks.dims();
        if dims.len() != 3 {
            bail!("{}: oft_blocks has shape {:?}, expected 3 dimensions", name, dims);
        }
        let out_dim = dims[0] * dims[1];
        let layer = LayerInfo::Linear { out_features: out_dim, in_features: out_dim };
        let module = OftModule::new(weights, &layer)
            .with_context(|| format!("Invalid OFT layer {}", name))?;
        let (norm, clamped_norm) = module.generator_norms()?;

        summaries.push(LayerSummary {
            name: name.clone(),
            num_blocks: module.num_blocks(),
            block_size: module.block_size(),
            alpha: module.alpha(),
            constraint: module.constraint(),
            norm,
            clamped_norm,
        });
    }
    Ok(summaries)
}
