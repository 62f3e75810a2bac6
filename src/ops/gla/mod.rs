// Gated linear recurrence over f32 buffers.
//
//   h_t = diag(exp(gk_t)) h_{t-1} diag(exp(gv_t)) + k_t ⊗ v_t
//   o_t = h_t^T (q_t * scale)
//
// gk is [.., H, K] and gv is [.., H, V]; either may be absent. Gate gradients
// come from the cumulative-gate identity
//   dgk_t = Σ_{τ≥t} (q_τ ∘ dq_τ − k_τ ∘ dk_τ) + Σ_v (h_T ∘ dh_T)
//   dgv_t = Σ_{τ≥t} (o_τ ∘ do_τ − v_τ ∘ dv_τ) + Σ_k (h_T ∘ dh_T)
// with the sums running inside one segment.

pub(crate) mod chunk;
pub(crate) mod fused_recurrent;

use super::layout::{Dims, Segments, Unit};

pub(crate) struct Problem<'a> {
    pub q: &'a [f32],
    pub k: &'a [f32],
    pub v: &'a [f32],
    pub gk: Option<&'a [f32]>,
    pub gv: Option<&'a [f32]>,
    pub dims: Dims,
    pub segments: &'a Segments,
    pub scale: f32,
    pub block_v: usize,
    pub chunk_size: usize,
}

pub(crate) struct UnitForward {
    pub o: Vec<f32>,
    pub h: Vec<f32>,
}

pub(crate) struct UnitBackward {
    pub dq: Vec<f32>,
    pub dk: Vec<f32>,
    pub dv: Vec<f32>,
    pub dh0: Option<Vec<f32>>,
    /// Σ_v h_T ∘ dh_T over this block's columns, [K]
    pub final_k: Vec<f32>,
    /// Σ_k h_T ∘ dh_T, [bv]
    pub final_v: Vec<f32>,
}

pub(crate) struct Forward {
    pub o: Vec<f32>,
    pub ht: Option<Vec<f32>>,
}

#[derive(Debug)]
pub(crate) struct Backward {
    pub dq: Vec<f32>,
    pub dk: Vec<f32>,
    pub dv: Vec<f32>,
    pub dgk: Option<Vec<f32>>,
    pub dgv: Option<Vec<f32>>,
    pub dh0: Option<Vec<f32>>,
}

impl Problem<'_> {
    fn tokens(&self) -> usize {
        self.q.len() / (self.dims.heads * self.dims.k)
    }

    fn state_elems(&self) -> usize {
        self.segments.len() * self.dims.heads * self.dims.state_len()
    }

    /// Fill the per-step decay factors of token `t` for unit `u`.
    #[inline]
    fn decay(&self, u: &Unit, t: usize, ek: &mut [f32], ev: &mut [f32]) {
        if let Some(gk) = self.gk {
            let r = u.row(t, self.dims.heads, self.dims.k);
            for (e, g) in ek.iter_mut().zip(&gk[r..r + self.dims.k]) {
                *e = g.exp();
            }
        }
        if let Some(gv) = self.gv {
            let r = u.row(t, self.dims.heads, self.dims.v) + u.v0;
            for (e, g) in ev.iter_mut().zip(&gv[r..r + u.bv()]) {
                *e = g.exp();
            }
        }
    }

    fn gated(&self) -> bool {
        self.gk.is_some() || self.gv.is_some()
    }

    fn gather_forward(&self, units: &[Unit], results: Vec<UnitForward>, store_final: bool) -> Forward {
        let mut o = vec![0.0f32; self.tokens() * self.dims.heads * self.dims.v];
        let mut ht = store_final.then(|| vec![0.0f32; self.state_elems()]);
        for (u, r) in units.iter().zip(results) {
            u.scatter_v(&r.o, &mut o, &self.dims);
            if let Some(ht) = ht.as_mut() {
                u.store_state(&r.h, ht, &self.dims);
            }
        }
        Forward { o, ht }
    }

    /// Scatter unit results and derive the gate gradients. `o` is the f32
    /// forward output and `d_o` its gradient, both [.., H, V].
    fn gather_backward(
        &self,
        units: &[Unit],
        results: Vec<UnitBackward>,
        o: &[f32],
        d_o: &[f32],
        need_dh0: bool,
    ) -> Backward {
        let Dims { heads, k: kd, v: vd } = self.dims;
        let tokens = self.tokens();
        let mut dq = vec![0.0f32; tokens * heads * kd];
        let mut dk = vec![0.0f32; tokens * heads * kd];
        let mut dv = vec![0.0f32; tokens * heads * vd];
        let mut dh0 = need_dh0.then(|| vec![0.0f32; self.state_elems()]);
        let n_seq = self.segments.len();
        let mut final_k = vec![0.0f32; n_seq * heads * kd];
        let mut final_v = vec![0.0f32; n_seq * heads * vd];

        for (u, r) in units.iter().zip(results) {
            u.accumulate_k(&r.dq, &mut dq, &self.dims);
            u.accumulate_k(&r.dk, &mut dk, &self.dims);
            u.scatter_v(&r.dv, &mut dv, &self.dims);
            if let (Some(dst), Some(src)) = (dh0.as_mut(), r.dh0.as_ref()) {
                u.store_state(src, dst, &self.dims);
            }
            let kb = (u.seq * heads + u.head) * kd;
            for (dst, src) in final_k[kb..kb + kd].iter_mut().zip(&r.final_k) {
                *dst += *src;
            }
            let vb = (u.seq * heads + u.head) * vd + u.v0;
            final_v[vb..vb + u.bv()].copy_from_slice(&r.final_v);
        }

        let dgk = self.gk.map(|_| {
            let mut g: Vec<f32> = (0..dq.len())
                .map(|i| self.q[i] * dq[i] - self.k[i] * dk[i])
                .collect();
            self.reverse_cumsum(&mut g, &final_k, kd);
            g
        });
        let dgv = self.gv.map(|_| {
            let mut g: Vec<f32> = (0..dv.len())
                .map(|i| o[i] * d_o[i] - self.v[i] * dv[i])
                .collect();
            self.reverse_cumsum(&mut g, &final_v, vd);
            g
        });

        Backward {
            dq,
            dk,
            dv,
            dgk,
            dgv,
            dh0,
        }
    }

    /// In-place suffix sums along time inside each segment, seeded with the
    /// final-state term `seed` ([N, H, d]).
    fn reverse_cumsum(&self, x: &mut [f32], seed: &[f32], d: usize) {
        let heads = self.dims.heads;
        for (n, &(bos, eos)) in self.segments.ranges().iter().enumerate() {
            for h in 0..heads {
                let mut acc = seed[(n * heads + h) * d..(n * heads + h + 1) * d].to_vec();
                for t in (bos..eos).rev() {
                    let r = (t * heads + h) * d;
                    for (xi, a) in x[r..r + d].iter_mut().zip(acc.iter_mut()) {
                        *a += *xi;
                        *xi = *a;
                    }
                }
            }
        }
    }
}

/// h[i, j] *= ek[i] · ev[j]
#[inline]
pub(crate) fn apply_decay(h: &mut [f32], ek: &[f32], ev: &[f32]) {
    let cols = ev.len();
    for (i, &e) in ek.iter().enumerate() {
        for (x, &f) in h[i * cols..(i + 1) * cols].iter_mut().zip(ev) {
            *x *= e * f;
        }
    }
}

/// Σ over columns and over rows of h ∘ dh for a [K, bv] pair.
pub(crate) fn final_terms(h: &[f32], dh: Option<&[f32]>, kd: usize, bv: usize) -> (Vec<f32>, Vec<f32>) {
    let mut fk = vec![0.0f32; kd];
    let mut fv = vec![0.0f32; bv];
    if let Some(dh) = dh {
        for i in 0..kd {
            for j in 0..bv {
                let x = h[i * bv + j] * dh[i * bv + j];
                fk[i] += x;
                fv[j] += x;
            }
        }
    }
    (fk, fv)
}
