//! Gated slot attention
//!
//! A bounded memory of `M` slots per head is read and written by two chained
//! gated recurrences with a softmax over slots between them:
//!
//! ```text
//! ok, hk = gla(q, k, s, gv = g, scale)      hk: [K, M]
//! qv     = softmax_M(ok)
//! o,  hv = gla(qv, s, v, gk = g, 1.0)       hv: [M, V]
//! ```
//!
//! `s` is the slot write strength and `g` its log-decay, both `[B, T, H, M]`.

use candle_core::{Device, Tensor};

use super::gla::{self, chunk, fused_recurrent};
use super::layout::{Dims, Segments};
use super::{dims4, expect_shape, expect_state, to_tensor, Flat, KernelOptions, Mode};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct GsaInputs {
    /// [B, T, H, K]
    pub q: Tensor,
    /// [B, T, H, K]
    pub k: Tensor,
    /// [B, T, H, V]
    pub v: Tensor,
    /// [B, T, H, M]
    pub s: Tensor,
    /// [B, T, H, M]
    pub g: Tensor,
}

/// Key-side and value-side slot memories of every sequence.
#[derive(Debug, Clone)]
pub struct SlotState {
    /// [N, H, K, M]
    pub hk: Tensor,
    /// [N, H, M, V]
    pub hv: Tensor,
}

impl SlotState {
    pub fn num_sequences(&self) -> usize {
        self.hk.dims().first().copied().unwrap_or(0)
    }

    fn is_variable(&self) -> bool {
        self.hk.is_variable() || self.hv.is_variable()
    }
}

#[derive(Debug, Clone)]
pub struct GsaGrads {
    pub dq: Tensor,
    pub dk: Tensor,
    pub dv: Tensor,
    pub ds: Tensor,
    pub dg: Tensor,
    pub dh0: Option<SlotState>,
}

#[derive(Debug, Clone)]
pub struct GsaContext {
    mode: Mode,
    segments: Segments,
    key_dims: Dims,
    value_dims: Dims,
    scale: f32,
    block_v: usize,
    chunk_size: usize,
    k_shape: [usize; 4],
    v_shape: [usize; 4],
    m_shape: [usize; 4],
    q: Flat,
    k: Flat,
    v: Flat,
    s: Flat,
    g: Flat,
    hk0: Option<Vec<f32>>,
    hv0: Option<Vec<f32>>,
    h0_requires_grad: bool,
    /// f32 intermediates of the forward pass
    ok: Vec<f32>,
    qv: Vec<f32>,
    o: Vec<f32>,
    device: Device,
}

impl GsaContext {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    fn key_problem(&self) -> gla::Problem<'_> {
        gla::Problem {
            q: &self.q.data,
            k: &self.k.data,
            v: &self.s.data,
            gk: None,
            gv: Some(&self.g.data),
            dims: self.key_dims,
            segments: &self.segments,
            scale: self.scale,
            block_v: self.block_v,
            chunk_size: self.chunk_size,
        }
    }

    fn value_problem(&self) -> gla::Problem<'_> {
        gla::Problem {
            q: &self.qv,
            k: &self.s.data,
            v: &self.v.data,
            gk: Some(&self.g.data),
            gv: None,
            dims: self.value_dims,
            segments: &self.segments,
            scale: 1.0,
            block_v: self.block_v,
            chunk_size: self.chunk_size,
        }
    }

    fn state_shapes(&self) -> ([usize; 4], [usize; 4]) {
        let n = self.segments.len();
        let Dims { heads, k, v: m } = self.key_dims;
        ([n, heads, k, m], [n, heads, m, self.value_dims.v])
    }

    pub fn backward(&self, d_o: &Tensor, dht: Option<&SlotState>) -> Result<GsaGrads> {
        expect_shape("do", d_o, &self.v_shape)?;
        let (hk_shape, hv_shape) = self.state_shapes();
        if let Some(st) = dht {
            expect_state("dht.hk", &st.hk, hk_shape)?;
            expect_state("dht.hv", &st.hv, hv_shape)?;
        }
        let d_o = Flat::from_tensor(d_o)?.data;
        let dhk = Flat::from_optional(dht.map(|s| &s.hk))?;
        let dhv = Flat::from_optional(dht.map(|s| &s.hv))?;
        let need_dh0 = self.h0_requires_grad;

        let backward = match self.mode {
            Mode::FusedRecurrent => fused_recurrent::backward,
            Mode::Chunk => chunk::backward,
        };

        // value side first, then through the softmax into the key side
        let pv = self.value_problem();
        let gv = backward(&pv, self.hv0.as_deref(), &self.o, &d_o, dhv.as_deref(), need_dh0);
        let dok = softmax_backward(&self.qv, &gv.dq, self.key_dims.v);
        let pk = self.key_problem();
        let gk = backward(&pk, self.hk0.as_deref(), &self.ok, &dok, dhk.as_deref(), need_dh0);

        let ds: Vec<f32> = gk.dv.iter().zip(&gv.dk).map(|(a, b)| a + b).collect();
        let dg: Vec<f32> = match (gk.dgv, gv.dgk) {
            (Some(a), Some(b)) => a.iter().zip(&b).map(|(x, y)| x + y).collect(),
            _ => vec![0.0f32; ds.len()],
        };

        let dev = &self.device;
        let dh0 = match (gk.dh0, gv.dh0) {
            (Some(hk), Some(hv)) => Some(SlotState {
                hk: Tensor::from_vec(hk, &hk_shape[..], dev)?,
                hv: Tensor::from_vec(hv, &hv_shape[..], dev)?,
            }),
            _ => None,
        };
        Ok(GsaGrads {
            dq: to_tensor(gk.dq, &self.k_shape, self.q.dtype, dev)?,
            dk: to_tensor(gk.dk, &self.k_shape, self.k.dtype, dev)?,
            dv: to_tensor(gv.dv, &self.v_shape, self.v.dtype, dev)?,
            ds: to_tensor(ds, &self.m_shape, self.s.dtype, dev)?,
            dg: to_tensor(dg, &self.m_shape, self.g.dtype, dev)?,
            dh0,
        })
    }
}

/// Row-wise softmax over rows of width `m`.
fn softmax_rows(x: &[f32], m: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; x.len()];
    for (src, dst) in x.chunks(m).zip(out.chunks_mut(m)) {
        let max = src.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0f32;
        for (d, &s) in dst.iter_mut().zip(src) {
            *d = (s - max).exp();
            sum += *d;
        }
        for d in dst.iter_mut() {
            *d /= sum;
        }
    }
    out
}

/// dx = p ∘ (dp − Σ p ∘ dp) per row.
fn softmax_backward(p: &[f32], dp: &[f32], m: usize) -> Vec<f32> {
    let mut dx = vec![0.0f32; p.len()];
    for ((pr, dpr), dxr) in p.chunks(m).zip(dp.chunks(m)).zip(dx.chunks_mut(m)) {
        let inner: f32 = pr.iter().zip(dpr).map(|(a, b)| a * b).sum();
        for ((d, &pi), &gi) in dxr.iter_mut().zip(pr).zip(dpr) {
            *d = pi * (gi - inner);
        }
    }
    dx
}

fn forward(
    mode: Mode,
    inputs: &GsaInputs,
    initial_state: Option<&SlotState>,
    opts: &KernelOptions,
) -> Result<(Tensor, Option<SlotState>, GsaContext)> {
    opts.check()?;
    let k_shape = dims4("q", &inputs.q)?;
    let [batch, seq_len, heads, kd] = k_shape;
    expect_shape("k", &inputs.k, &k_shape)?;
    let v_shape = dims4("v", &inputs.v)?;
    expect_shape("v", &inputs.v, &[batch, seq_len, heads, v_shape[3]])?;
    let m_shape = dims4("s", &inputs.s)?;
    expect_shape("s", &inputs.s, &[batch, seq_len, heads, m_shape[3]])?;
    expect_shape("g", &inputs.g, &m_shape)?;
    let (vd, md) = (v_shape[3], m_shape[3]);

    let segments = opts.segments(batch, seq_len)?;
    let n = segments.len();
    let (hk_shape, hv_shape) = ([n, heads, kd, md], [n, heads, md, vd]);
    if let Some(st) = initial_state {
        expect_state("initial_state.hk", &st.hk, hk_shape)?;
        expect_state("initial_state.hv", &st.hv, hv_shape)?;
    }
    let scale = opts.resolve_scale(kd)?;

    log::debug!(
        "gated slot attention: mode={} segments={} heads={} k={} v={} slots={} scale={:.4}",
        mode,
        n,
        heads,
        kd,
        vd,
        md,
        scale
    );

    let mut ctx = GsaContext {
        mode,
        segments,
        key_dims: Dims::new(heads, kd, md),
        value_dims: Dims::new(heads, md, vd),
        scale,
        block_v: opts.block_v,
        chunk_size: opts.chunk_size,
        k_shape,
        v_shape,
        m_shape,
        q: Flat::from_tensor(&inputs.q)?,
        k: Flat::from_tensor(&inputs.k)?,
        v: Flat::from_tensor(&inputs.v)?,
        s: Flat::from_tensor(&inputs.s)?,
        g: Flat::from_tensor(&inputs.g)?,
        hk0: Flat::from_optional(initial_state.map(|s| &s.hk))?,
        hv0: Flat::from_optional(initial_state.map(|s| &s.hv))?,
        h0_requires_grad: initial_state.is_some_and(SlotState::is_variable),
        ok: Vec::new(),
        qv: Vec::new(),
        o: Vec::new(),
        device: inputs.v.device().clone(),
    };

    let run = match mode {
        Mode::FusedRecurrent => fused_recurrent::forward,
        Mode::Chunk => chunk::forward,
    };
    let store = opts.output_final_state;
    let key = run(&ctx.key_problem(), ctx.hk0.as_deref(), store);
    ctx.qv = softmax_rows(&key.o, md);
    ctx.ok = key.o;
    let value = run(&ctx.value_problem(), ctx.hv0.as_deref(), store);
    ctx.o = value.o;

    let o = to_tensor(ctx.o.clone(), &v_shape, ctx.v.dtype, &ctx.device)?;
    let final_state = match (key.ht, value.ht) {
        (Some(hk), Some(hv)) => Some(SlotState {
            hk: Tensor::from_vec(hk, &hk_shape[..], &ctx.device)?,
            hv: Tensor::from_vec(hv, &hv_shape[..], &ctx.device)?,
        }),
        _ => None,
    };
    Ok((o, final_state, ctx))
}

pub fn fused_recurrent_gsa(
    inputs: &GsaInputs,
    initial_state: Option<&SlotState>,
    opts: &KernelOptions,
) -> Result<(Tensor, Option<SlotState>)> {
    let (o, ht, _) = forward(Mode::FusedRecurrent, inputs, initial_state, opts)?;
    Ok((o, ht))
}

pub fn fused_recurrent_gsa_fwd(
    inputs: &GsaInputs,
    initial_state: Option<&SlotState>,
    opts: &KernelOptions,
) -> Result<(Tensor, Option<SlotState>, GsaContext)> {
    forward(Mode::FusedRecurrent, inputs, initial_state, opts)
}

pub fn chunk_gsa(
    inputs: &GsaInputs,
    initial_state: Option<&SlotState>,
    opts: &KernelOptions,
) -> Result<(Tensor, Option<SlotState>)> {
    let (o, ht, _) = forward(Mode::Chunk, inputs, initial_state, opts)?;
    Ok((o, ht))
}

pub fn chunk_gsa_fwd(
    inputs: &GsaInputs,
    initial_state: Option<&SlotState>,
    opts: &KernelOptions,
) -> Result<(Tensor, Option<SlotState>, GsaContext)> {
    forward(Mode::Chunk, inputs, initial_state, opts)
}

pub fn gsa(
    inputs: &GsaInputs,
    initial_state: Option<&SlotState>,
    opts: &KernelOptions,
    mode: Mode,
) -> Result<(Tensor, Option<SlotState>)> {
    let (o, ht, _) = forward(mode, inputs, initial_state, opts)?;
    Ok((o, ht))
}

pub fn gsa_fwd(
    inputs: &GsaInputs,
    initial_state: Option<&SlotState>,
    opts: &KernelOptions,
    mode: Mode,
) -> Result<(Tensor, Option<SlotState>, GsaContext)> {
    forward(mode, inputs, initial_state, opts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::ops::test_util::{assert_close, numeric_grad, rng, to_vec, uniform, weighted_sum};
    use candle_core::Var;
    use rand::rngs::StdRng;

    fn random_inputs(rng: &mut StdRng, b: usize, t: usize, h: usize, k: usize, v: usize, m: usize) -> GsaInputs {
        GsaInputs {
            q: uniform(rng, &[b, t, h, k], -1.0, 1.0),
            k: uniform(rng, &[b, t, h, k], -1.0, 1.0),
            v: uniform(rng, &[b, t, h, v], -1.0, 1.0),
            s: uniform(rng, &[b, t, h, m], 0.05, 0.6),
            g: uniform(rng, &[b, t, h, m], -0.5, -0.02),
        }
    }

    fn random_state(rng: &mut StdRng, n: usize, h: usize, k: usize, v: usize, m: usize) -> SlotState {
        SlotState {
            hk: uniform(rng, &[n, h, k, m], -0.5, 0.5),
            hv: uniform(rng, &[n, h, m, v], -0.5, 0.5),
        }
    }

    fn field_mut<'a>(inputs: &'a mut GsaInputs, name: &str) -> &'a mut Tensor {
        match name {
            "q" => &mut inputs.q,
            "k" => &mut inputs.k,
            "v" => &mut inputs.v,
            "s" => &mut inputs.s,
            _ => &mut inputs.g,
        }
    }

    #[test]
    fn test_softmax_backward_matches_jacobian() {
        let x = [0.3f32, -1.0, 2.0];
        let p = softmax_rows(&x, 3);
        assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        let dp = [1.0f32, 0.0, 0.0];
        let dx = softmax_backward(&p, &dp, 3);
        // column 0 of the softmax Jacobian
        assert!((dx[0] - p[0] * (1.0 - p[0])).abs() < 1e-6);
        assert!((dx[1] + p[0] * p[1]).abs() < 1e-6);
        assert!((dx[2] + p[0] * p[2]).abs() < 1e-6);
    }

    #[test]
    fn test_chunk_matches_fused_recurrent() {
        let mut rng = rng(21);
        let (b, t, h, k, v, m) = (2, 9, 2, 3, 5, 4);
        let inputs = random_inputs(&mut rng, b, t, h, k, v, m);
        let st = random_state(&mut rng, b, h, k, v, m);
        let h0 = SlotState {
            hk: Var::from_tensor(&st.hk).unwrap().as_tensor().clone(),
            hv: Var::from_tensor(&st.hv).unwrap().as_tensor().clone(),
        };
        let d_o = uniform(&mut rng, &[b, t, h, v], -1.0, 1.0);
        let dht = random_state(&mut rng, b, h, k, v, m);
        let opts = KernelOptions::default()
            .with_final_state(true)
            .with_block_v(2)
            .with_chunk_size(4);

        let (o_f, ht_f, ctx_f) = fused_recurrent_gsa_fwd(&inputs, Some(&h0), &opts).unwrap();
        let (o_c, ht_c, ctx_c) = chunk_gsa_fwd(&inputs, Some(&h0), &opts).unwrap();
        assert_close("o", &o_f, &o_c, 1e-4);
        let (ht_f, ht_c) = (ht_f.unwrap(), ht_c.unwrap());
        assert_close("hk", &ht_f.hk, &ht_c.hk, 1e-4);
        assert_close("hv", &ht_f.hv, &ht_c.hv, 1e-4);

        let g_f = ctx_f.backward(&d_o, Some(&dht)).unwrap();
        let g_c = ctx_c.backward(&d_o, Some(&dht)).unwrap();
        for (name, a, b) in [
            ("dq", &g_f.dq, &g_c.dq),
            ("dk", &g_f.dk, &g_c.dk),
            ("dv", &g_f.dv, &g_c.dv),
            ("ds", &g_f.ds, &g_c.ds),
            ("dg", &g_f.dg, &g_c.dg),
        ] {
            assert_close(name, a, b, 1e-4);
        }
        let (d_f, d_c) = (g_f.dh0.unwrap(), g_c.dh0.unwrap());
        assert_close("dhk0", &d_f.hk, &d_c.hk, 1e-4);
        assert_close("dhv0", &d_f.hv, &d_c.hv, 1e-4);
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let mut rng = rng(23);
        let (b, t, h, k, v, m) = (1, 4, 1, 2, 3, 3);
        let inputs = random_inputs(&mut rng, b, t, h, k, v, m);
        let st = random_state(&mut rng, b, h, k, v, m);
        let h0 = SlotState {
            hk: Var::from_tensor(&st.hk).unwrap().as_tensor().clone(),
            hv: Var::from_tensor(&st.hv).unwrap().as_tensor().clone(),
        };
        let w_o = uniform(&mut rng, &[b, t, h, v], -1.0, 1.0);
        let w_h = random_state(&mut rng, b, h, k, v, m);

        for mode in [Mode::FusedRecurrent, Mode::Chunk] {
            let opts = KernelOptions::default().with_final_state(true).with_chunk_size(3);
            let loss = |inp: &GsaInputs, st: &SlotState| {
                let (o, ht) = gsa(inp, Some(st), &opts, mode).unwrap();
                let ht = ht.unwrap();
                weighted_sum(&o, &w_o) + weighted_sum(&ht.hk, &w_h.hk) + weighted_sum(&ht.hv, &w_h.hv)
            };
            let (_, _, ctx) = gsa_fwd(&inputs, Some(&h0), &opts, mode).unwrap();
            let g = ctx.backward(&w_o, Some(&w_h)).unwrap();

            for (name, dx) in [("q", &g.dq), ("k", &g.dk), ("v", &g.dv), ("s", &g.ds), ("g", &g.dg)] {
                let mut base = inputs.clone();
                let x = field_mut(&mut base, name).clone();
                for (idx, &an) in to_vec(dx).iter().enumerate() {
                    let num = numeric_grad(&x, idx, 1e-2, |x| {
                        let mut inp = inputs.clone();
                        *field_mut(&mut inp, name) = x.clone();
                        loss(&inp, &h0)
                    });
                    assert!(
                        (num - an as f64).abs() < 1e-2 * (1.0 + num.abs()),
                        "{mode} d{name}[{idx}]: numeric {num} vs analytic {an}"
                    );
                }
            }

            let dh0 = g.dh0.unwrap();
            for (idx, &an) in to_vec(&dh0.hk).iter().enumerate() {
                let num = numeric_grad(&h0.hk, idx, 1e-2, |x| {
                    loss(&inputs, &SlotState { hk: x.clone(), hv: h0.hv.clone() })
                });
                assert!((num - an as f64).abs() < 1e-2 * (1.0 + num.abs()), "{mode} dhk0[{idx}]");
            }
            for (idx, &an) in to_vec(&dh0.hv).iter().enumerate() {
                let num = numeric_grad(&h0.hv, idx, 1e-2, |x| {
                    loss(&inputs, &SlotState { hk: h0.hk.clone(), hv: x.clone() })
                });
                assert!((num - an as f64).abs() < 1e-2 * (1.0 + num.abs()), "{mode} dhv0[{idx}]");
            }
        }
    }

    #[test]
    fn test_cu_seqlens_isolates_segments() {
        let mut rng = rng(29);
        let (h, k, v, m) = (2, 3, 4, 3);
        let lens = [5usize, 2];
        let seqs: Vec<GsaInputs> = lens.iter().map(|&t| random_inputs(&mut rng, 1, t, h, k, v, m)).collect();
        let states: Vec<SlotState> = lens.iter().map(|_| random_state(&mut rng, 1, h, k, v, m)).collect();

        let mut packed = seqs[0].clone();
        for name in ["q", "k", "v", "s", "g"] {
            let parts: Vec<Tensor> = seqs.iter().map(|s| field_mut(&mut s.clone(), name).clone()).collect();
            *field_mut(&mut packed, name) = Tensor::cat(&parts, 1).unwrap();
        }
        let h0 = SlotState {
            hk: Tensor::cat(&states.iter().map(|s| &s.hk).collect::<Vec<_>>(), 0).unwrap(),
            hv: Tensor::cat(&states.iter().map(|s| &s.hv).collect::<Vec<_>>(), 0).unwrap(),
        };

        let opts = KernelOptions::default().with_final_state(true).with_chunk_size(2);
        let varlen = opts.clone().with_cu_seqlens(vec![0, 5, 7]);
        let (o, ht) = chunk_gsa(&packed, Some(&h0), &varlen).unwrap();
        let ht = ht.unwrap();
        assert_eq!(ht.num_sequences(), 2);

        let mut lo = 0;
        for (n, (seq, st)) in seqs.iter().zip(&states).enumerate() {
            let (o_n, ht_n) = fused_recurrent_gsa(seq, Some(st), &opts).unwrap();
            let ht_n = ht_n.unwrap();
            assert_close("o", &o.narrow(1, lo, lens[n]).unwrap(), &o_n, 1e-4);
            assert_close("hk", &ht.hk.narrow(0, n, 1).unwrap(), &ht_n.hk, 1e-4);
            assert_close("hv", &ht.hv.narrow(0, n, 1).unwrap(), &ht_n.hv, 1e-4);
            lo += lens[n];
        }
    }

    #[test]
    fn test_state_carry_across_calls() {
        let mut rng = rng(31);
        let inputs = random_inputs(&mut rng, 1, 7, 1, 2, 3, 4);
        let opts = KernelOptions::default().with_final_state(true).with_chunk_size(3);
        let (o_full, ht_full) = chunk_gsa(&inputs, None, &opts).unwrap();

        let part = |lo: usize, len: usize| {
            let mut out = inputs.clone();
            for name in ["q", "k", "v", "s", "g"] {
                let t = field_mut(&mut out, name);
                *t = t.narrow(1, lo, len).unwrap();
            }
            out
        };
        let (o1, st) = chunk_gsa(&part(0, 5), None, &opts).unwrap();
        let (o2, st) = fused_recurrent_gsa(&part(5, 2), st.as_ref(), &opts).unwrap();

        assert_close("o", &o_full, &Tensor::cat(&[&o1, &o2], 1).unwrap(), 1e-4);
        let (a, b) = (ht_full.unwrap(), st.unwrap());
        assert_close("hk", &a.hk, &b.hk, 1e-4);
        assert_close("hv", &a.hv, &b.hv, 1e-4);
    }

    #[test]
    fn test_slot_shapes_must_agree() {
        let mut rng = rng(37);
        let mut inputs = random_inputs(&mut rng, 1, 3, 1, 2, 2, 4);
        inputs.g = uniform(&mut rng, &[1, 3, 1, 3], -0.5, -0.1);
        assert!(matches!(
            chunk_gsa(&inputs, None, &KernelOptions::default()),
            Err(Error::ShapeMismatch { name: "g", .. })
        ));

        let inputs = random_inputs(&mut rng, 1, 3, 1, 2, 2, 4);
        let st = random_state(&mut rng, 2, 1, 2, 2, 4);
        assert!(matches!(
            chunk_gsa(&inputs, Some(&st), &KernelOptions::default()),
            Err(Error::InitialStateCount { expected: 1, actual: 2 })
        ));
    }
}
