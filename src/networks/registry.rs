//! Adapter variant dispatch
//!
//! Each variant declares which tensors it needs. `create_module` walks the
//! list in order and builds the first variant whose predicate matches.

use super::error::Result;
use super::layer::OutputDimension;
use super::module::{NetworkModule, NetworkWeights};
use super::oft::OftModule;

/// One adapter variant: a predicate over the available tensors and a constructor
pub struct ModuleType {
    pub name: &'static str,
    pub matches: fn(&NetworkWeights) -> bool,
    pub create: fn(&NetworkWeights, &dyn OutputDimension) -> Result<Box<dyn NetworkModule>>,
}

fn oft_matches(weights: &NetworkWeights) -> bool {
    weights.contains("oft_blocks")
}

fn oft_create(
    weights: &NetworkWeights,
    layer: &dyn OutputDimension,
) -> Result<Box<dyn NetworkModule>> {
    Ok(Box::new(OftModule::new(weights, layer)?))
}

/// Registered variants, in resolution order
pub const MODULE_TYPES: &[ModuleType] = &[ModuleType {
    name: "oft",
    matches: oft_matches,
    create: oft_create,
}];

/// Find the variant that can handle `weights`.
pub fn resolve(weights: &NetworkWeights) -> Option<&'static ModuleType> {
    MODULE_TYPES.iter().find(|t| (t.matches)(weights))
}

/// Build a module from the first matching variant.
///
/// Returns `Ok(None)` when no registered variant recognises the tensors.
pub fn create_module(
    weights: &NetworkWeights,
    layer: &dyn OutputDimension,
) -> Result<Option<Box<dyn NetworkModule>>> {
    match resolve(weights) {
        Some(module_type) => Ok(Some((module_type.create)(weights, layer)?)),
        None => Ok(None),
    }
}
