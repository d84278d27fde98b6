//! Map kohya-style adapter layer names onto checkpoint weight keys
//!
//! Adapter layers are named by flattening the module path with underscores
//! and prefixing the model component (`lora_unet_`, `lora_te_`, ...).
//! Checkpoint keys are dotted paths that may carry a container prefix
//! (`model.diffusion_model.`, `cond_stage_model.transformer.`, ...). Both sides
//! are reduced to the same flattened form and matched. UNet layers named
//! after the diffusers module tree are also tried against the LDM layout
//! (`input_blocks`, `middle_block`, `output_blocks`) used by single-file
//! checkpoints.

use candle_core::Tensor;
use log::debug;
use std::collections::HashMap;

/// Model component an adapter layer targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Unet,
    TextEncoder,
    TextEncoder2,
}

/// Adapter name prefixes, longest first so `lora_te1_` wins over `lora_te_`
const ADAPTER_PREFIXES: &[(&str, Component)] = &[
    ("lora_unet_", Component::Unet),
    ("lora_te1_", Component::TextEncoder),
    ("lora_te2_", Component::TextEncoder2),
    ("lora_te_", Component::TextEncoder),
];

/// Checkpoint container prefixes per component
const CHECKPOINT_PREFIXES: &[(&str, Component)] = &[
    ("model.diffusion_model.", Component::Unet),
    ("diffusion_model.", Component::Unet),
    ("unet.", Component::Unet),
    ("cond_stage_model.transformer.", Component::TextEncoder),
    ("conditioner.embedders.0.transformer.", Component::TextEncoder),
    ("text_encoder.", Component::TextEncoder),
    ("conditioner.embedders.1.model.", Component::TextEncoder2),
    ("text_encoder_2.", Component::TextEncoder2),
];

/// Split an adapter layer name into its component and flattened module path.
pub fn parse_adapter_name(name: &str) -> (Component, &str) {
    for (prefix, component) in ADAPTER_PREFIXES {
        if let Some(rest) = name.strip_prefix(prefix) {
            return (*component, rest);
        }
    }
    (Component::Unet, name)
}

/// Reduce a checkpoint weight key to `(component, flattened path)`.
///
/// Only `.weight` entries are candidates; biases and buffers return `None`.
pub fn normalize_checkpoint_key(key: &str) -> Option<(Component, String)> {
    let stem = key.strip_suffix(".weight")?;
    let (component, path) = CHECKPOINT_PREFIXES
        .iter()
        .find_map(|(prefix, component)| stem.strip_prefix(prefix).map(|rest| (*component, rest)))
        .unwrap_or((Component::Unet, stem));
    Some((component, path.replace('.', "_")))
}

/// Renamed submodules of a resnet block in the LDM layout
const RESNET_SUFFIXES: &[(&str, &str)] = &[
    ("norm1", "in_layers_0"),
    ("conv1", "in_layers_2"),
    ("norm2", "out_layers_0"),
    ("conv2", "out_layers_3"),
    ("time_emb_proj", "emb_layers_1"),
    ("conv_shortcut", "skip_connection"),
];

/// Split a leading block index off `0_rest`.
fn split_index(s: &str) -> Option<(usize, &str)> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    let index = s[..end].parse().ok()?;
    let rest = &s[end..];
    if rest.is_empty() {
        return Some((index, rest));
    }
    Some((index, rest.strip_prefix('_')?))
}

/// `attentions_N_suffix` / `resnets_N_suffix` -> (is_attention, N, LDM suffix)
fn split_sub_block(s: &str) -> Option<(bool, usize, String)> {
    let (attention, rest) = if let Some(rest) = s.strip_prefix("attentions_") {
        (true, rest)
    } else {
        (false, s.strip_prefix("resnets_")?)
    };
    let (index, suffix) = split_index(rest)?;
    if suffix.is_empty() {
        return None;
    }
    let suffix = if attention {
        suffix.to_string()
    } else {
        RESNET_SUFFIXES
            .iter()
            .find(|(from, _)| *from == suffix)
            .map(|(_, to)| to.to_string())
            .unwrap_or_else(|| suffix.to_string())
    };
    Some((attention, index, suffix))
}

/// Translate a flattened diffusers UNet path into the flattened LDM path.
///
/// Follows the SD 1.x/2.x block layout: three resnet/attention slots per
/// down block after `input_blocks_0`, three per up block, and the mid block
/// at `middle_block_{0,1,2}`.
pub fn diffusers_to_ldm(path: &str) -> Option<String> {
    match path {
        "conv_in" => return Some("input_blocks_0_0".to_string()),
        "conv_norm_out" => return Some("out_0".to_string()),
        "conv_out" => return Some("out_2".to_string()),
        _ => {}
    }

    if let Some(rest) = path.strip_prefix("time_embedding_linear_") {
        return match split_index(rest)? {
            (1, "") => Some("time_embed_0".to_string()),
            (2, "") => Some("time_embed_2".to_string()),
            _ => None,
        };
    }

    if let Some(rest) = path.strip_prefix("down_blocks_") {
        let (block, rest) = split_index(rest)?;
        if rest == "downsamplers_0_conv" {
            return Some(format!("input_blocks_{}_0_op", 3 + block * 3));
        }
        let (attention, index, suffix) = split_sub_block(rest)?;
        return Some(format!(
            "input_blocks_{}_{}_{}",
            1 + block * 3 + index,
            if attention { 1 } else { 0 },
            suffix
        ));
    }

    if let Some(rest) = path.strip_prefix("mid_block_") {
        let (attention, index, suffix) = split_sub_block(rest)?;
        return Some(format!(
            "middle_block_{}_{}",
            if attention { 1 } else { index * 2 },
            suffix
        ));
    }

    if let Some(rest) = path.strip_prefix("up_blocks_") {
        let (block, rest) = split_index(rest)?;
        if rest == "upsamplers_0_conv" {
            // up_blocks_0 has no attentions, so its upsampler sits in slot 1
            return Some(format!(
                "output_blocks_{}_{}_conv",
                2 + block * 3,
                if block > 0 { 2 } else { 1 }
            ));
        }
        let (attention, index, suffix) = split_sub_block(rest)?;
        return Some(format!(
            "output_blocks_{}_{}_{}",
            block * 3 + index,
            if attention { 1 } else { 0 },
            suffix
        ));
    }

    None
}

/// Lookup from adapter layer names to checkpoint keys
#[derive(Debug, Default)]
pub struct KeyMapper {
    index: HashMap<(Component, String), String>,
}

impl KeyMapper {
    pub fn from_keys<'a>(keys: impl IntoIterator<Item = &'a String>) -> Self {
        let mut index = HashMap::new();
        for key in keys {
            if let Some(normalized) = normalize_checkpoint_key(key) {
                if let Some(previous) = index.insert(normalized, key.clone()) {
                    debug!("Checkpoint keys {} and {} flatten to the same name", previous, key);
                }
            }
        }
        Self { index }
    }

    pub fn from_checkpoint(tensors: &HashMap<String, Tensor>) -> Self {
        Self::from_keys(tensors.keys())
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Checkpoint key for an adapter layer name, if present.
    ///
    /// UNet names are tried verbatim first, then through the LDM translation.
    pub fn lookup(&self, adapter_layer: &str) -> Option<&str> {
        let (component, path) = parse_adapter_name(adapter_layer);
        if let Some(key) = self.index.get(&(component, path.to_string())) {
            return Some(key.as_str());
        }
        if component != Component::Unet {
            return None;
        }
        let ldm = diffusers_to_ldm(path)?;
        self.index.get(&(component, ldm)).map(String::as_str)
    }
}
