//! Adapter networks that modify base model weights

pub mod cayley;
pub mod error;
pub mod layer;
pub mod module;
pub mod oft;
pub mod registry;

pub use error::{NetworkError, Result};
pub use layer::{LayerInfo, OutputDimension};
pub use module::{NetworkModule, NetworkWeights};
pub use oft::{cayley_blocks, compute_rotation, constrained_generator, merge_into_weight, OftModule};
pub use registry::{create_module, ModuleType, MODULE_TYPES};
