//! Error taxonomy for the kernels and the slot attention layer
//!
//! Configuration errors are raised at construction or dispatch time, contract
//! errors before any kernel work starts. Nothing here is recovered internally.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------
    /// Feature map name not in {swish, relu, t2r}
    #[error("feature map `{0}` is not supported (expected one of: swish, relu, t2r)")]
    UnsupportedFeatureMap(String),

    /// Computation mode name not in {chunk, fused_recurrent}
    #[error("mode `{0}` is not supported (expected one of: chunk, fused_recurrent)")]
    UnsupportedMode(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ------------------------------------------------------------------
    // Shape / contract violations
    // ------------------------------------------------------------------
    #[error(
        "the batch size is expected to be 1 rather than {batch} when using `cu_seqlens`; \
         flatten variable-length inputs before processing"
    )]
    VarlenBatch { batch: usize },

    #[error(
        "the number of initial states is expected to be equal to the number of input sequences, \
         i.e. {expected} rather than {actual}"
    )]
    InitialStateCount { expected: usize, actual: usize },

    #[error("scale must be positive, got {0}")]
    NonPositiveScale(f64),

    #[error(
        "expected attention_mask as a 0-1 matrix with shape [batch_size, seq_len], got rank {0}"
    )]
    MaskRank(usize),

    #[error("shape mismatch for `{name}`: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("`{name}` must have rank {expected}, got shape {actual:?}")]
    Rank {
        name: &'static str,
        expected: usize,
        actual: Vec<usize>,
    },

    #[error("invalid cu_seqlens: {0}")]
    InvalidCuSeqlens(String),

    #[error("invalid kernel option: {0}")]
    InvalidOption(String),

    #[error("cache has {len} layer entries, cannot update layer {layer_idx}")]
    CacheLayer { layer_idx: usize, len: usize },

    #[error("layer was built without `layer_idx` but a cache was supplied")]
    MissingLayerIndex,

    // ------------------------------------------------------------------
    // Tensor backend
    // ------------------------------------------------------------------
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

impl Error {
    pub(crate) fn shape(name: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        Error::ShapeMismatch {
            name,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
