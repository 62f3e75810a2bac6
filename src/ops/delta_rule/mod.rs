//! Generalized delta rule with identity-plus-low-rank transitions
//!
//! Recurrence per head, written in `[K, V]` storage:
//!
//! ```text
//! h_t = h_{t-1} + b_t ⊗ (h_{t-1}^T a_t) + k_t ⊗ v_t
//! o_t = h_t^T (q_t * scale)
//! ```
//!
//! which is `S_t = S_{t-1} (I + a_t b_t^T) + v_t k_t^T` with `S = h^T`.
//! Both kernels save `ha_t = h_{t-1}^T a_t` for the backward pass.

mod chunk;
mod fused_recurrent;

use candle_core::{Device, Tensor};

use super::layout::{Dims, Segments, Unit};
use super::{dims4, expect_shape, expect_state, to_tensor, Flat, KernelOptions, Mode};
use crate::error::Result;

/// Inputs of one delta-rule call.
///
/// `q`, `k`, `a`, `b` are `[B, T, H, K]` and `v` is `[B, T, H, V]`.
#[derive(Debug, Clone)]
pub struct DeltaRuleInputs {
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
    pub a: Tensor,
    pub b: Tensor,
}

/// Gradients returned by [`DeltaRuleContext::backward`], each in the dtype of its input.
#[derive(Debug, Clone)]
pub struct DeltaRuleGrads {
    pub dq: Tensor,
    pub dk: Tensor,
    pub dv: Tensor,
    pub da: Tensor,
    pub db: Tensor,
    /// Float32 gradient of the initial state, present when the initial state is a variable
    pub dh0: Option<Tensor>,
}

// ----------------------------------------------------------------------------
// Flat kernel plumbing
// ----------------------------------------------------------------------------

pub(crate) struct Problem<'a> {
    pub q: &'a [f32],
    pub k: &'a [f32],
    pub v: &'a [f32],
    pub a: &'a [f32],
    pub b: &'a [f32],
    pub dims: Dims,
    pub segments: &'a Segments,
    pub scale: f32,
    pub block_v: usize,
    pub chunk_size: usize,
}

pub(crate) struct UnitForward {
    pub o: Vec<f32>,
    pub ha: Vec<f32>,
    pub h: Vec<f32>,
}

pub(crate) struct UnitBackward {
    pub dq: Vec<f32>,
    pub dk: Vec<f32>,
    pub da: Vec<f32>,
    pub db: Vec<f32>,
    pub dv: Vec<f32>,
    pub dh0: Option<Vec<f32>>,
}

pub(crate) struct Forward {
    pub o: Vec<f32>,
    pub ha: Vec<f32>,
    pub ht: Option<Vec<f32>>,
}

pub(crate) struct Backward {
    pub dq: Vec<f32>,
    pub dk: Vec<f32>,
    pub dv: Vec<f32>,
    pub da: Vec<f32>,
    pub db: Vec<f32>,
    pub dh0: Option<Vec<f32>>,
}

impl Problem<'_> {
    fn tokens(&self) -> usize {
        self.q.len() / (self.dims.heads * self.dims.k)
    }

    fn state_elems(&self) -> usize {
        self.segments.len() * self.dims.heads * self.dims.state_len()
    }

    fn gather_forward(&self, units: &[Unit], results: Vec<UnitForward>, store_final: bool) -> Forward {
        let rows = self.tokens() * self.dims.heads * self.dims.v;
        let mut o = vec![0.0f32; rows];
        let mut ha = vec![0.0f32; rows];
        let mut ht = store_final.then(|| vec![0.0f32; self.state_elems()]);
        for (u, r) in units.iter().zip(results) {
            u.scatter_v(&r.o, &mut o, &self.dims);
            u.scatter_v(&r.ha, &mut ha, &self.dims);
            if let Some(ht) = ht.as_mut() {
                u.store_state(&r.h, ht, &self.dims);
            }
        }
        Forward { o, ha, ht }
    }

    fn gather_backward(&self, units: &[Unit], results: Vec<UnitBackward>, need_dh0: bool) -> Backward {
        let tokens = self.tokens();
        let krows = tokens * self.dims.heads * self.dims.k;
        let mut g = Backward {
            dq: vec![0.0f32; krows],
            dk: vec![0.0f32; krows],
            dv: vec![0.0f32; tokens * self.dims.heads * self.dims.v],
            da: vec![0.0f32; krows],
            db: vec![0.0f32; krows],
            dh0: need_dh0.then(|| vec![0.0f32; self.state_elems()]),
        };
        for (u, r) in units.iter().zip(results) {
            u.accumulate_k(&r.dq, &mut g.dq, &self.dims);
            u.accumulate_k(&r.dk, &mut g.dk, &self.dims);
            u.accumulate_k(&r.da, &mut g.da, &self.dims);
            u.accumulate_k(&r.db, &mut g.db, &self.dims);
            u.scatter_v(&r.dv, &mut g.dv, &self.dims);
            if let (Some(dst), Some(src)) = (g.dh0.as_mut(), r.dh0.as_ref()) {
                u.store_state(src, dst, &self.dims);
            }
        }
        g
    }
}

// ----------------------------------------------------------------------------
// Saved context
// ----------------------------------------------------------------------------

/// Everything the backward pass needs from a forward call.
#[derive(Debug, Clone)]
pub struct DeltaRuleContext {
    mode: Mode,
    dims: Dims,
    segments: Segments,
    scale: f32,
    block_v: usize,
    chunk_size: usize,
    k_shape: [usize; 4],
    v_shape: [usize; 4],
    q: Flat,
    k: Flat,
    v: Flat,
    a: Flat,
    b: Flat,
    h0: Option<Vec<f32>>,
    h0_requires_grad: bool,
    ha: Vec<f32>,
    device: Device,
}

impl DeltaRuleContext {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    fn problem(&self) -> Problem<'_> {
        Problem {
            q: &self.q.data,
            k: &self.k.data,
            v: &self.v.data,
            a: &self.a.data,
            b: &self.b.data,
            dims: self.dims,
            segments: &self.segments,
            scale: self.scale,
            block_v: self.block_v,
            chunk_size: self.chunk_size,
        }
    }

    fn state_shape(&self) -> [usize; 4] {
        [self.segments.len(), self.dims.heads, self.dims.k, self.dims.v]
    }

    /// Gradients of all inputs given the output gradient and, optionally,
    /// the gradient of the final state.
    pub fn backward(&self, d_o: &Tensor, dht: Option<&Tensor>) -> Result<DeltaRuleGrads> {
        expect_shape("do", d_o, &self.v_shape)?;
        if let Some(dht) = dht {
            expect_state("dht", dht, self.state_shape())?;
        }
        let d_o = Flat::from_tensor(d_o)?.data;
        let dht = Flat::from_optional(dht)?;

        let p = self.problem();
        let h0 = self.h0.as_deref();
        let need_dh0 = self.h0.is_some() && self.h0_requires_grad;
        let g = match self.mode {
            Mode::FusedRecurrent => {
                fused_recurrent::backward(&p, h0, &self.ha, &d_o, dht.as_deref(), need_dh0)
            }
            Mode::Chunk => chunk::backward(&p, h0, &self.ha, &d_o, dht.as_deref(), need_dh0),
        };

        let dev = &self.device;
        Ok(DeltaRuleGrads {
            dq: to_tensor(g.dq, &self.k_shape, self.q.dtype, dev)?,
            dk: to_tensor(g.dk, &self.k_shape, self.k.dtype, dev)?,
            dv: to_tensor(g.dv, &self.v_shape, self.v.dtype, dev)?,
            da: to_tensor(g.da, &self.k_shape, self.a.dtype, dev)?,
            db: to_tensor(g.db, &self.k_shape, self.b.dtype, dev)?,
            dh0: g
                .dh0
                .map(|d| Tensor::from_vec(d, &self.state_shape()[..], dev))
                .transpose()?,
        })
    }
}

// ----------------------------------------------------------------------------
// Public entry points
// ----------------------------------------------------------------------------

fn forward(
    mode: Mode,
    inputs: &DeltaRuleInputs,
    initial_state: Option<&Tensor>,
    opts: &KernelOptions,
) -> Result<(Tensor, Option<Tensor>, DeltaRuleContext)> {
    opts.check()?;
    let k_shape = dims4("q", &inputs.q)?;
    let [batch, seq_len, heads, kd] = k_shape;
    expect_shape("k", &inputs.k, &k_shape)?;
    expect_shape("a", &inputs.a, &k_shape)?;
    expect_shape("b", &inputs.b, &k_shape)?;
    let v_shape = dims4("v", &inputs.v)?;
    expect_shape("v", &inputs.v, &[batch, seq_len, heads, v_shape[3]])?;
    let vd = v_shape[3];

    let segments = opts.segments(batch, seq_len)?;
    let dims = Dims::new(heads, kd, vd);
    let state_shape = [segments.len(), heads, kd, vd];
    if let Some(h0) = initial_state {
        expect_state("initial_state", h0, state_shape)?;
    }
    let scale = opts.resolve_scale(kd)?;

    log::debug!(
        "iplr delta rule: mode={} segments={} heads={} k={} v={} scale={:.4}",
        mode,
        segments.len(),
        heads,
        kd,
        vd,
        scale
    );

    let mut ctx = DeltaRuleContext {
        mode,
        dims,
        segments,
        scale,
        block_v: opts.block_v,
        chunk_size: opts.chunk_size,
        k_shape,
        v_shape,
        q: Flat::from_tensor(&inputs.q)?,
        k: Flat::from_tensor(&inputs.k)?,
        v: Flat::from_tensor(&inputs.v)?,
        a: Flat::from_tensor(&inputs.a)?,
        b: Flat::from_tensor(&inputs.b)?,
        h0: Flat::from_optional(initial_state)?,
        h0_requires_grad: initial_state.is_some_and(|t| t.is_variable()),
        ha: Vec::new(),
        device: inputs.v.device().clone(),
    };

    let p = ctx.problem();
    let h0 = ctx.h0.as_deref();
    let out = match mode {
        Mode::FusedRecurrent => fused_recurrent::forward(&p, h0, opts.output_final_state),
        Mode::Chunk => chunk::forward(&p, h0, opts.output_final_state),
    };

    let o = to_tensor(out.o, &v_shape, ctx.v.dtype, &ctx.device)?;
    let ht = out
        .ht
        .map(|h| Tensor::from_vec(h, &state_shape[..], &ctx.device))
        .transpose()?;
    ctx.ha = out.ha;
    Ok((o, ht, ctx))
}

/// Sequential kernel; returns `(o, final_state)`.
pub fn fused_recurrent_iplr_delta_rule(
    inputs: &DeltaRuleInputs,
    initial_state: Option<&Tensor>,
    opts: &KernelOptions,
) -> Result<(Tensor, Option<Tensor>)> {
    let (o, ht, _) = forward(Mode::FusedRecurrent, inputs, initial_state, opts)?;
    Ok((o, ht))
}

pub fn fused_recurrent_iplr_delta_rule_fwd(
    inputs: &DeltaRuleInputs,
    initial_state: Option<&Tensor>,
    opts: &KernelOptions,
) -> Result<(Tensor, Option<Tensor>, DeltaRuleContext)> {
    forward(Mode::FusedRecurrent, inputs, initial_state, opts)
}

/// Chunked kernel; same contract as [`fused_recurrent_iplr_delta_rule`].
pub fn chunk_iplr_delta_rule(
    inputs: &DeltaRuleInputs,
    initial_state: Option<&Tensor>,
    opts: &KernelOptions,
) -> Result<(Tensor, Option<Tensor>)> {
    let (o, ht, _) = forward(Mode::Chunk, inputs, initial_state, opts)?;
    Ok((o, ht))
}

pub fn chunk_iplr_delta_rule_fwd(
    inputs: &DeltaRuleInputs,
    initial_state: Option<&Tensor>,
    opts: &KernelOptions,
) -> Result<(Tensor, Option<Tensor>, DeltaRuleContext)> {
    forward(Mode::Chunk, inputs, initial_state, opts)
}

pub fn iplr_delta_rule(
    inputs: &DeltaRuleInputs,
    initial_state: Option<&Tensor>,
    opts: &KernelOptions,
    mode: Mode,
) -> Result<(Tensor, Option<Tensor>)> {
    let (o, ht, _) = forward(mode, inputs, initial_state, opts)?;
    Ok((o, ht))
}

pub fn iplr_delta_rule_fwd(
    inputs: &DeltaRuleInputs,
    initial_state: Option<&Tensor>,
    opts: &KernelOptions,
    mode: Mode,
) -> Result<(Tensor, Option<Tensor>, DeltaRuleContext)> {
    forward(mode, inputs, initial_state, opts)
}
