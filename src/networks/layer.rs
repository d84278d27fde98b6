//! Output-dimension introspection for layers an adapter can attach to

use candle_nn::{Conv1d, Conv2d, Linear};
use serde::{Deserialize, Serialize};

/// A layer that can report its output dimensionality
/// (output features for linear layers, output channels for convolutions).
pub trait OutputDimension {
    fn output_dimension(&self) -> usize;
}

impl OutputDimension for Linear {
    fn output_dimension(&self) -> usize {
        self.weight().dims()[0]
    }
}

impl OutputDimension for Conv1d {
    fn output_dimension(&self) -> usize {
        self.weight().dims()[0]
    }
}

impl OutputDimension for Conv2d {
    fn output_dimension(&self) -> usize {
        self.weight().dims()[0]
    }
}

/// Plain layer descriptor for hosts that only have weight shapes at hand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerInfo {
    Linear {
        out_features: usize,
        in_features: usize,
    },
    Conv {
        out_channels: usize,
        in_channels: usize,
        kernel: (usize, usize),
    },
}

impl LayerInfo {
    /// Infer the layer kind from a weight shape: 2-D is linear, 3-D/4-D is a convolution.
    pub fn from_weight_shape(dims: &[usize]) -> Option<Self> {
        match *dims {
            [out_features, in_features] => Some(LayerInfo::Linear { out_features, in_features }),
            [out_channels, in_channels, k] => Some(LayerInfo::Conv {
                out_channels,
                in_channels,
                kernel: (k, 1),
            }),
            [out_channels, in_channels, kh, kw] => Some(LayerInfo::Conv {
                out_channels,
                in_channels,
                kernel: (kh, kw),
            }),
            _ => None,
        }
    }
}

impl OutputDimension for LayerInfo {
    fn output_dimension(&self) -> usize {
        match self {
            LayerInfo::Linear { out_features, .. } => *out_features,
            LayerInfo::Conv { out_channels, .. } => *out_channels,
        }
    }
}
