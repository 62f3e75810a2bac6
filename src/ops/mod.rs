//! Recurrent kernels
//!
//! Each engine exposes a fused sequential kernel and a chunked kernel that
//! compute the same function. Tensors crossing the public API are candle
//! tensors of any float dtype; internally everything runs on contiguous f32
//! buffers laid out as described in [`layout`].

pub mod delta_rule;
pub(crate) mod gla;
pub mod gsa;
pub(crate) mod layout;
pub(crate) mod linalg;

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use layout::Segments;

pub use delta_rule::{
    chunk_iplr_delta_rule, chunk_iplr_delta_rule_fwd, fused_recurrent_iplr_delta_rule,
    fused_recurrent_iplr_delta_rule_fwd, iplr_delta_rule, iplr_delta_rule_fwd, DeltaRuleContext,
    DeltaRuleGrads, DeltaRuleInputs,
};
pub use gsa::{
    chunk_gsa, chunk_gsa_fwd, fused_recurrent_gsa, fused_recurrent_gsa_fwd, gsa, gsa_fwd,
    GsaContext, GsaGrads, GsaInputs, SlotState,
};

pub const DEFAULT_BLOCK_V: usize = 64;
pub const DEFAULT_CHUNK_SIZE: usize = 64;

/// Kernel selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Chunk-parallel form with intra-chunk triangular products
    #[default]
    Chunk,
    /// One step at a time
    FusedRecurrent,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "chunk" => Ok(Mode::Chunk),
            "fused_recurrent" => Ok(Mode::FusedRecurrent),
            _ => Err(Error::UnsupportedMode(s.to_string())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Chunk => write!(f, "chunk"),
            Mode::FusedRecurrent => write!(f, "fused_recurrent"),
        }
    }
}

/// Options shared by every kernel entry point.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelOptions {
    /// Query scale; `None` means `K^-0.5`
    pub scale: Option<f64>,
    pub output_final_state: bool,
    /// Cumulative sequence boundaries over a packed batch of size 1
    pub cu_seqlens: Option<Vec<usize>>,
    /// Width of the V-blocks that run as independent units
    pub block_v: usize,
    /// Time chunk used by the chunked kernels
    pub chunk_size: usize,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            scale: None,
            output_final_state: false,
            cu_seqlens: None,
            block_v: DEFAULT_BLOCK_V,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl KernelOptions {
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn with_final_state(mut self, output_final_state: bool) -> Self {
        self.output_final_state = output_final_state;
        self
    }

    pub fn with_cu_seqlens(mut self, cu_seqlens: Vec<usize>) -> Self {
        self.cu_seqlens = Some(cu_seqlens);
        self
    }

    pub fn with_block_v(mut self, block_v: usize) -> Self {
        self.block_v = block_v;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.block_v == 0 {
            return Err(Error::InvalidOption("block_v must be positive".into()));
        }
        if self.chunk_size == 0 {
            return Err(Error::InvalidOption("chunk_size must be positive".into()));
        }
        Ok(())
    }

    pub(crate) fn resolve_scale(&self, k: usize) -> Result<f32> {
        let scale = self.scale.unwrap_or_else(|| (k as f64).powf(-0.5));
        if !(scale > 0.0) {
            return Err(Error::NonPositiveScale(scale));
        }
        Ok(scale as f32)
    }

    /// Segment table for a `[batch, seq_len, ..]` input.
    pub(crate) fn segments(&self, batch: usize, seq_len: usize) -> Result<Segments> {
        match &self.cu_seqlens {
            Some(cu) => {
                if batch != 1 {
                    return Err(Error::VarlenBatch { batch });
                }
                Segments::from_cu_seqlens(cu, seq_len)
            }
            None => Ok(Segments::fixed(batch, seq_len)),
        }
    }
}

// ----------------------------------------------------------------------------
// Tensor boundary
// ----------------------------------------------------------------------------

/// A tensor flattened to f32 together with the dtype it came in.
#[derive(Debug, Clone)]
pub(crate) struct Flat {
    pub data: Vec<f32>,
    pub dtype: DType,
}

impl Flat {
    pub fn from_tensor(t: &Tensor) -> Result<Self> {
        let data = t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        Ok(Self { data, dtype: t.dtype() })
    }

    pub fn from_optional(t: Option<&Tensor>) -> Result<Option<Vec<f32>>> {
        t.map(|t| Self::from_tensor(t).map(|f| f.data)).transpose()
    }
}

pub(crate) fn to_tensor(data: Vec<f32>, shape: &[usize], dtype: DType, device: &Device) -> Result<Tensor> {
    Ok(Tensor::from_vec(data, shape, device)?.to_dtype(dtype)?)
}

pub(crate) fn dims4(name: &'static str, t: &Tensor) -> Result<[usize; 4]> {
    match *t.dims() {
        [a, b, c, d] => Ok([a, b, c, d]),
        _ => Err(Error::Rank {
            name,
            expected: 4,
            actual: t.dims().to_vec(),
        }),
    }
}

pub(crate) fn expect_shape(name: &'static str, t: &Tensor, expected: &[usize]) -> Result<()> {
    if t.dims() != expected {
        return Err(Error::shape(name, expected, t.dims()));
    }
    Ok(())
}

/// Check a `[N, H, X, Y]` state against the segment count before its inner dims.
pub(crate) fn expect_state(name: &'static str, t: &Tensor, expected: [usize; 4]) -> Result<()> {
    let dims = t.dims();
    if dims.len() == 4 && dims[0] != expected[0] {
        return Err(Error::InitialStateCount {
            expected: expected[0],
            actual: dims[0],
        });
    }
    expect_shape(name, t, &expected)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_from_str() {
        assert_eq!("chunk".parse::<Mode>().unwrap(), Mode::Chunk);
        assert_eq!("FUSED_RECURRENT".parse::<Mode>().unwrap(), Mode::FusedRecurrent);
        assert!(matches!("parallel".parse::<Mode>(), Err(Error::UnsupportedMode(_))));
        assert_eq!(Mode::FusedRecurrent.to_string(), "fused_recurrent");
    }

    #[test]
    fn test_scale_defaults_to_inverse_sqrt_k() {
        let opts = KernelOptions::default();
        assert!((opts.resolve_scale(16).unwrap() - 0.25).abs() < 1e-7);
        let opts = opts.with_scale(0.0);
        assert!(matches!(opts.resolve_scale(16), Err(Error::NonPositiveScale(_))));
    }

    #[test]
    fn test_varlen_requires_unit_batch() {
        let opts = KernelOptions::default().with_cu_seqlens(vec![0, 2, 4]);
        assert!(matches!(opts.segments(2, 4), Err(Error::VarlenBatch { batch: 2 })));
        assert_eq!(opts.segments(1, 4).unwrap().len(), 2);
    }

    #[test]
    fn test_zero_block_rejected() {
        let opts = KernelOptions::default().with_block_v(0);
        assert!(matches!(opts.check(), Err(Error::InvalidOption(_))));
    }
}
