//! CLI subcommands for slotscan
//!
//! - `check` - Compare chunked and fused kernels, forward and backward
//! - `bench` - Time the slot attention layer in each mode

pub mod bench;
pub mod check;

pub use bench::{run_bench, BenchArgs};
pub use check::{run_check, CheckArgs};
