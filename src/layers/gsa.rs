// Gated Slot Attention layer
// Based on "Gated Slot Attention for Efficient Linear-Time Sequence Modeling" (Zhang et al., 2024)
//
// Implementation Notes:
// - Projections, short convolutions and activations run as candle ops
// - The slot recurrence runs on the CPU kernels in `crate::ops::gsa`
// - Inputs of 64 steps or fewer always take the fused recurrent kernel
// - Padding masks are handled by packing valid tokens into one varlen row
//
// Dimension notation conventions:
// - B: batch size
// - T or q_len: sequence length
// - H or num_heads: number of query heads
// - G: query heads per key/value head
// - K or head_k_dim: key dimension per head
// - V or head_v_dim: value dimension per head
// - M or num_slots: memory slots per head

use candle_core::{Module, Tensor};
use candle_nn::{linear_no_bias, Linear, VarBuilder};

use super::{logsigmoid, repeat_interleave, FeatureMap, RmsNorm, ShortConvolution};
use super::padding::{index_first_axis, pad_input, unpad_indices};
use crate::cache::{Cache, ConvState};
use crate::config::GsaConfig;
use crate::error::{Error, Result};
use crate::ops::{self, GsaInputs, KernelOptions, Mode};

/// Sequences at most this long use the fused recurrent kernel.
const FUSED_MAX_LEN: usize = 64;

#[derive(Debug, Clone)]
struct ShortConvs {
    q: ShortConvolution,
    k: ShortConvolution,
    v: ShortConvolution,
}

#[derive(Debug, Clone)]
pub struct GatedSlotAttention {
    cfg: GsaConfig,
    layer_idx: Option<usize>,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    f_proj: Linear,
    convs: Option<ShortConvs>,
    feature_map: FeatureMap,
    g_norm: RmsNorm,
    o_proj: Linear,
}

impl GatedSlotAttention {
    pub fn new(cfg: &GsaConfig, layer_idx: Option<usize>, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        if layer_idx.is_none() {
            log::warn!(
                "GatedSlotAttention built without `layer_idx`; \
                 calling forward with a cache will fail"
            );
        }

        let hidden = cfg.hidden_size;
        let groups = cfg.kv_groups();
        let key_dim_per_group = cfg.key_dim() / groups;
        let value_dim_per_group = cfg.value_dim() / groups;

        let q_proj = linear_no_bias(hidden, cfg.key_dim(), vb.pp("q_proj"))?;
        let k_proj = linear_no_bias(hidden, key_dim_per_group, vb.pp("k_proj"))?;
        let v_proj = linear_no_bias(hidden, value_dim_per_group, vb.pp("v_proj"))?;
        let f_proj = linear_no_bias(hidden, cfg.kv_heads() * cfg.slots(), vb.pp("f_proj"))?;

        let convs = if cfg.use_short_conv {
            let (w, bias) = (cfg.conv_size, cfg.conv_bias);
            Some(ShortConvs {
                q: ShortConvolution::new(cfg.key_dim(), w, bias, vb.pp("q_conv1d"))?,
                k: ShortConvolution::new(key_dim_per_group, w, bias, vb.pp("k_conv1d"))?,
                v: ShortConvolution::new(value_dim_per_group, w, bias, vb.pp("v_conv1d"))?,
            })
        } else {
            None
        };

        let feature_map = FeatureMap::new(cfg.feature_map, cfg.head_k_dim(), vb.pp("feature_map"))?;
        let g_norm = RmsNorm::new(cfg.value_dim(), cfg.norm_eps, cfg.elementwise_affine, vb.pp("g_norm"))?;
        let o_proj = linear_no_bias(cfg.value_dim(), hidden, vb.pp("o_proj"))?;

        Ok(Self {
            cfg: cfg.clone(),
            layer_idx,
            q_proj,
            k_proj,
            v_proj,
            f_proj,
            convs,
            feature_map,
            g_norm,
            o_proj,
        })
    }

    pub fn config(&self) -> &GsaConfig {
        &self.cfg
    }

    pub fn layer_idx(&self) -> Option<usize> {
        self.layer_idx
    }

    /// Mix `hidden` `[B, T, hidden_size]`.
    ///
    /// `attention_mask` is a `[B, T']` 0/1 padding mask; its last `T` columns
    /// apply. Padded positions come back as zeros. With `use_cache` the
    /// layer's entry in `cache` is advanced by `T` tokens.
    pub fn forward(
        &self,
        hidden: &Tensor,
        attention_mask: Option<&Tensor>,
        cache: Option<&mut Cache>,
        use_cache: bool,
    ) -> Result<Tensor> {
        self.run(hidden, attention_mask, None, cache, use_cache)
    }

    /// Mix a pre-packed `[1, Σ, hidden_size]` batch of sequences delimited by `cu_seqlens`.
    pub fn forward_packed(
        &self,
        hidden: &Tensor,
        cu_seqlens: &[usize],
        cache: Option<&mut Cache>,
        use_cache: bool,
    ) -> Result<Tensor> {
        self.run(hidden, None, Some(cu_seqlens.to_vec()), cache, use_cache)
    }

    fn run(
        &self,
        hidden_states: &Tensor,
        attention_mask: Option<&Tensor>,
        cu_seqlens: Option<Vec<usize>>,
        mut cache: Option<&mut Cache>,
        use_cache: bool,
    ) -> Result<Tensor> {
        let (batch_size, q_len, _) = hidden_states.dims3()?;
        let mode = if q_len <= FUSED_MAX_LEN {
            Mode::FusedRecurrent
        } else {
            self.cfg.mode
        };

        let layer_idx = match (&cache, self.layer_idx) {
            (Some(_), None) => return Err(Error::MissingLayerIndex),
            (_, idx) => idx,
        };
        let last_state = match (&cache, layer_idx) {
            (Some(c), Some(idx)) => c.get(idx).cloned(),
            _ => None,
        };

        // 1. Unpad: pack valid tokens into a single varlen row
        let mut cu_seqlens = cu_seqlens;
        let mut indices = None;
        let hidden_states = match attention_mask {
            Some(mask) => {
                if mask.rank() != 2 {
                    return Err(Error::MaskRank(mask.rank()));
                }
                let cols = mask.dim(1)?;
                if cols < q_len || mask.dim(0)? != batch_size {
                    return Err(Error::shape("attention_mask", &[batch_size, q_len], mask.dims()));
                }
                let (idx, cu, _) = unpad_indices(&mask.narrow(1, cols - q_len, q_len)?)?;
                if idx.dim(0)? == 0 {
                    return self.skip_empty(cache, layer_idx, batch_size, q_len, hidden_states);
                }
                let packed = index_first_axis(&hidden_states.flatten_to(1)?, &idx)?.unsqueeze(0)?;
                cu_seqlens = Some(cu);
                indices = Some(idx);
                packed
            }
            None => hidden_states.clone(),
        };
        let (b, t, _) = hidden_states.dims3()?;
        if t == 0 {
            return self.skip_empty(cache, layer_idx, batch_size, q_len, &hidden_states);
        }

        // 2. Projections with optional short convolutions
        let q = self.q_proj.forward(&hidden_states)?;
        let k = self.k_proj.forward(&hidden_states)?;
        let v = self.v_proj.forward(&hidden_states)?;
        let f = self.f_proj.forward(&hidden_states)?;

        let (q, k, v, conv_state) = match &self.convs {
            Some(convs) => {
                let prev = last_state.as_ref().and_then(|s| s.conv_state.as_ref());
                let cu = cu_seqlens.as_deref();
                let (q, cq) = convs.q.forward(&q, prev.map(|c| &c.q), use_cache, cu)?;
                let (k, ck) = convs.k.forward(&k, prev.map(|c| &c.k), use_cache, cu)?;
                let (v, cv) = convs.v.forward(&v, prev.map(|c| &c.v), use_cache, cu)?;
                let state = match (cq, ck, cv) {
                    (Some(q), Some(k), Some(v)) => Some(ConvState { q, k, v }),
                    _ => None,
                };
                (q, k, v, state)
            }
            None => (q, k, v, None),
        };

        // 3. Split heads and apply activations
        let (dk, dv, m) = (self.cfg.head_k_dim(), self.cfg.head_v_dim(), self.cfg.slots());
        let (h, h_kv) = (self.cfg.num_heads, self.cfg.kv_heads());
        let q = q.reshape((b, t, h, dk))?;
        let k = k.reshape((b, t, h_kv, dk))?;
        let v = v.reshape((b, t, h_kv, dv))?;
        let f = f.reshape((b, t, h_kv, m))?;

        let q = self.feature_map.forward(&q)?;
        let k = self.feature_map.forward(&k)?;
        let v = candle_nn::ops::silu(&v)?;

        let f = logsigmoid(&f)?.affine(1.0 / self.cfg.gate_logit_normalizer, 0.0)?;
        let s = f.exp()?.affine(-1.0, 1.0)?;

        // 4. Grouped-query expansion of the key/value heads
        let groups = self.cfg.kv_groups();
        let k = repeat_interleave(&k, groups, 2)?;
        let v = repeat_interleave(&v, groups, 2)?;
        let f = repeat_interleave(&f, groups, 2)?;
        let s = repeat_interleave(&s, groups, 2)?;

        // 5. Slot recurrence
        let opts = KernelOptions {
            scale: self.cfg.scale,
            output_final_state: use_cache,
            cu_seqlens,
            block_v: self.cfg.block_v,
            chunk_size: self.cfg.chunk_size,
        };
        let inputs = GsaInputs {
            q: q.contiguous()?,
            k: k.contiguous()?,
            v: v.contiguous()?,
            s: s.contiguous()?,
            g: f.contiguous()?,
        };
        let initial_state = last_state.as_ref().and_then(|s| s.recurrent_state.as_ref());
        let (o, recurrent_state) = ops::gsa(&inputs, initial_state, &opts, mode)?;

        if let (Some(cache), Some(idx)) = (cache.as_deref_mut(), layer_idx) {
            cache.update(recurrent_state, conv_state, idx, q_len)?;
        }

        // 6. Gated normalization and output projection
        let o = o.reshape((b, t, self.cfg.value_dim()))?;
        let o = self.g_norm.forward(&candle_nn::ops::silu(&o)?)?;
        let o = self.o_proj.forward(&o)?;

        match indices {
            Some(idx) => pad_input(&o.squeeze(0)?, &idx, batch_size, q_len),
            None => Ok(o),
        }
    }

    /// Output for a call with no valid tokens: zeros, with the cache offset
    /// advanced and its stored states untouched.
    fn skip_empty(
        &self,
        cache: Option<&mut Cache>,
        layer_idx: Option<usize>,
        batch_size: usize,
        q_len: usize,
        like: &Tensor,
    ) -> Result<Tensor> {
        if let (Some(cache), Some(idx)) = (cache, layer_idx) {
            cache.update(None, None, idx, q_len)?;
        }
        Ok(Tensor::zeros(
            (batch_size, q_len, self.cfg.hidden_size),
            like.dtype(),
            like.device(),
        )?)
    }
}
