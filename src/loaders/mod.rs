pub mod adapter;
pub mod checkpoint;
pub mod key_mapping;
pub mod save;

pub use adapter::{group_by_layer, load_adapter, AdapterFile};
pub use checkpoint::{detect_format, load_checkpoint, CheckpointFormat};
pub use key_mapping::{Component, KeyMapper};
pub use save::save_merged;
