use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::layers::FeatureMapKind;
use crate::ops::{Mode, DEFAULT_BLOCK_V, DEFAULT_CHUNK_SIZE};

// Default value functions for serde
fn default_expand() -> f64 { 1.0 }
fn default_num_heads() -> usize { 4 }
fn default_true() -> bool { true }
fn default_conv_size() -> usize { 4 }
fn default_norm_eps() -> f64 { 1e-5 }
fn default_gate_logit_normalizer() -> f64 { 8.0 }
fn default_scale() -> Option<f64> { Some(1.0) }
fn default_chunk_size() -> usize { DEFAULT_CHUNK_SIZE }
fn default_block_v() -> usize { DEFAULT_BLOCK_V }
fn default_batch_size() -> usize { 2 }
fn default_seq_len() -> usize { 128 }
fn default_seed() -> u64 { 42 }
fn default_iters() -> usize { 10 }
fn default_tolerance() -> f64 { 1e-3 }

/// Gated slot attention layer configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct GsaConfig {
    /// Kernel used for sequences longer than 64 steps; shorter inputs always
    /// take the fused recurrent path
    #[serde(default)]
    pub mode: Mode,

    pub hidden_size: usize,
    #[serde(default = "default_expand")]
    pub expand_k: f64,
    #[serde(default = "default_expand")]
    pub expand_v: f64,
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,
    /// Key/value heads for grouped queries; defaults to `num_heads`
    pub num_kv_heads: Option<usize>,

    #[serde(default)]
    pub use_short_conv: bool,
    #[serde(default = "default_conv_size")]
    pub conv_size: usize,
    #[serde(default)]
    pub conv_bias: bool,

    /// Memory slots per head; defaults to the key head dimension
    pub num_slots: Option<usize>,
    #[serde(default = "default_true")]
    pub elementwise_affine: bool,
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
    #[serde(default = "default_gate_logit_normalizer")]
    pub gate_logit_normalizer: f64,
    #[serde(default)]
    pub feature_map: FeatureMapKind,
    /// Query scale; `null` falls back to `head_k_dim^-0.5`
    #[serde(default = "default_scale")]
    pub scale: Option<f64>,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_block_v")]
    pub block_v: usize,

    /// Layer precision (f32/f16/bf16); recurrent states stay f32
    #[serde(default)]
    pub dtype: Precision,
}

impl GsaConfig {
    pub fn new(hidden_size: usize, num_heads: usize) -> Self {
        Self {
            mode: Mode::default(),
            hidden_size,
            expand_k: default_expand(),
            expand_v: default_expand(),
            num_heads,
            num_kv_heads: None,
            use_short_conv: false,
            conv_size: default_conv_size(),
            conv_bias: false,
            num_slots: None,
            elementwise_affine: true,
            norm_eps: default_norm_eps(),
            gate_logit_normalizer: default_gate_logit_normalizer(),
            feature_map: FeatureMapKind::default(),
            scale: default_scale(),
            chunk_size: default_chunk_size(),
            block_v: default_block_v(),
            dtype: Precision::default(),
        }
    }

    pub fn key_dim(&self) -> usize {
        (self.hidden_size as f64 * self.expand_k) as usize
    }

    pub fn value_dim(&self) -> usize {
        (self.hidden_size as f64 * self.expand_v) as usize
    }

    pub fn kv_heads(&self) -> usize {
        self.num_kv_heads.unwrap_or(self.num_heads)
    }

    pub fn kv_groups(&self) -> usize {
        self.num_heads / self.kv_heads()
    }

    pub fn head_k_dim(&self) -> usize {
        self.key_dim() / self.num_heads
    }

    pub fn head_v_dim(&self) -> usize {
        self.value_dim() / self.num_heads
    }

    pub fn slots(&self) -> usize {
        self.num_slots.unwrap_or_else(|| self.head_k_dim())
    }

    /// Check divisibility and positivity constraints.
    pub fn validate(&self) -> Result<()> {
        if self.hidden_size == 0 || self.num_heads == 0 {
            return Err(Error::InvalidConfig(
                "hidden_size and num_heads must be positive".into(),
            ));
        }
        let kv_heads = self.kv_heads();
        if kv_heads == 0 || self.num_heads % kv_heads != 0 {
            return Err(Error::InvalidConfig(format!(
                "num_heads ({}) must be a multiple of num_kv_heads ({})",
                self.num_heads, kv_heads
            )));
        }
        let (key_dim, value_dim) = (self.key_dim(), self.value_dim());
        if key_dim == 0 || key_dim % self.num_heads != 0 {
            return Err(Error::InvalidConfig(format!(
                "key dim ({}) must be a positive multiple of num_heads ({})",
                key_dim, self.num_heads
            )));
        }
        if value_dim == 0 || value_dim % self.num_heads != 0 {
            return Err(Error::InvalidConfig(format!(
                "value dim ({}) must be a positive multiple of num_heads ({})",
                value_dim, self.num_heads
            )));
        }
        if self.slots() == 0 {
            return Err(Error::InvalidConfig("num_slots must be positive".into()));
        }
        if self.use_short_conv && self.conv_size == 0 {
            return Err(Error::InvalidConfig("conv_size must be positive".into()));
        }
        if !(self.gate_logit_normalizer > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "gate_logit_normalizer must be positive, got {}",
                self.gate_logit_normalizer
            )));
        }
        if let Some(scale) = self.scale {
            if !(scale > 0.0) {
                return Err(Error::NonPositiveScale(scale));
            }
        }
        if self.chunk_size == 0 || self.block_v == 0 {
            return Err(Error::InvalidConfig(
                "chunk_size and block_v must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Storage precision of the layer weights and activations.
///
/// The recurrences always accumulate in `f32`; this only selects the dtype
/// tensors are held in between kernels.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    F32,
    F16,
    BF16,
}

impl Precision {
    pub fn dtype(self) -> candle_core::DType {
        match self {
            Precision::F32 => candle_core::DType::F32,
            Precision::F16 => candle_core::DType::F16,
            Precision::BF16 => candle_core::DType::BF16,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Precision::F32 => "f32",
            Precision::F16 => "f16",
            Precision::BF16 => "bf16",
        }
    }
}

impl std::str::FromStr for Precision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "f32" | "fp32" | "float32" | "float" => Ok(Precision::F32),
            "f16" | "fp16" | "float16" | "half" => Ok(Precision::F16),
            "bf16" | "bfloat16" => Ok(Precision::BF16),
            other => Err(Error::InvalidConfig(format!(
                "precision `{other}` is not supported (expected one of: f32, f16, bf16)"
            ))),
        }
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Synthetic problem run by the `check` and `bench` commands
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ProblemConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_seq_len")]
    pub seq_len: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_iters")]
    pub iters: usize,
    /// Relative tolerance for chunk-vs-fused agreement
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

impl Default for ProblemConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            seq_len: default_seq_len(),
            seed: default_seed(),
            iters: default_iters(),
            tolerance: default_tolerance(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    pub layer: GsaConfig,
    #[serde(default)]
    pub problem: ProblemConfig,
}

impl RunConfig {
    /// Load configuration from a YAML file
    ///
    /// # Example
    /// ```no_run
    /// # use slotscan::config::RunConfig;
    /// let config = RunConfig::from_yaml("configs/small.yaml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    ///
    /// # Errors
    /// - File not found
    /// - Invalid YAML syntax, unknown mode or feature map
    /// - Layer constraints violated (see [`GsaConfig::validate`])
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: RunConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.layer.validate()?;
        if self.problem.batch_size == 0 || self.problem.seq_len == 0 {
            anyhow::bail!(
                "problem size must be positive, got batch_size={} seq_len={}",
                self.problem.batch_size,
                self.problem.seq_len
            );
        }
        Ok(())
    }
}
