//! Adapter weights and the module interface shared by adapter variants

use candle_core::Tensor;
use std::collections::HashMap;

use super::error::Result;

/// Named tensors of one adapter layer, keyed by the suffix after the layer
/// name (`oft_blocks`, `alpha`, ...).
#[derive(Debug, Clone)]
pub struct NetworkWeights {
    pub name: String,
    pub w: HashMap<String, Tensor>,
}

impl NetworkWeights {
    pub fn new(name: impl Into<String>, w: HashMap<String, Tensor>) -> Self {
        Self { name: name.into(), w }
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.w.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.w.contains_key(key)
    }
}

/// An adapter attached to a single layer
pub trait NetworkModule: Send + Sync {
    fn name(&self) -> &str;

    /// The adapter's weight matrix at `multiplier` (preview/inspect path).
    fn get_weight(&self, multiplier: f64) -> Result<Tensor>;

    /// The merged layer weight at `multiplier`, same shape as `orig_weight`.
    fn calc_updown(&self, orig_weight: &Tensor, multiplier: f64) -> Result<Tensor>;
}
