//! slotscan: gated slot attention and IPLR delta-rule recurrences
//!
//! - [`ops`]: fused and chunked kernels with hand-written backward passes
//! - [`layers`]: the gated slot attention token mixer and its building blocks
//! - [`cache`]: per-layer decoding state
//! - [`config`]: YAML-backed layer and run configuration
//! - [`numeric`]: random inputs and tolerance comparisons

pub mod cache;
pub mod config;
pub mod error;
pub mod layers;
pub mod numeric;
pub mod ops;

pub use error::{Error, Result};
