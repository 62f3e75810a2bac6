// Chunked gated recurrence.
//
// With local cumulative gates Gk, Gv inside a chunk of n rows (C = n - 1):
//   A[i,j] = Σ_k qs_i k_j exp(Gk_i − Gk_j)                             j ≤ i
//   o_i    = exp(Gv_i) ∘ (h0^T (qs_i ∘ exp(Gk_i))) + Σ_j A[i,j] exp(Gv_i − Gv_j) ∘ v_j
//   h_C    = exp(Gk_C) ⊗ exp(Gv_C) ∘ h0 + Σ_j (k_j ∘ exp(Gk_C − Gk_j)) ⊗ (v_j ∘ exp(Gv_C − Gv_j))
// Every exponent is a difference of cumulative log-decays taken forward in
// time, so it stays ≤ 0 for decaying gates.

use rayon::prelude::*;

use super::{apply_decay, final_terms, Backward, Forward, Problem, UnitBackward, UnitForward};
use crate::ops::layout::{units, Unit};
use crate::ops::linalg::{add_outer, vec_mat};

struct ChunkRows {
    n: usize,
    kd: usize,
    bv: usize,
    qs: Vec<f32>,
    k: Vec<f32>,
    v: Vec<f32>,
    /// Cumulative gates from the chunk start, zero when the gate is absent
    gk: Vec<f32>,
    gv: Vec<f32>,
}

impl ChunkRows {
    fn gather(p: &Problem<'_>, u: &Unit, c0: usize, c1: usize) -> Self {
        let (heads, kd, vd) = (p.dims.heads, p.dims.k, p.dims.v);
        let bv = u.bv();
        let n = c1 - c0;
        let mut rows = Self {
            n,
            kd,
            bv,
            qs: Vec::with_capacity(n * kd),
            k: Vec::with_capacity(n * kd),
            v: Vec::with_capacity(n * bv),
            gk: vec![0.0f32; n * kd],
            gv: vec![0.0f32; n * bv],
        };
        for (i, t) in (c0..c1).enumerate() {
            let kr = u.row(t, heads, kd);
            let vr = u.row(t, heads, vd) + u.v0;
            rows.qs.extend(p.q[kr..kr + kd].iter().map(|x| x * p.scale));
            rows.k.extend_from_slice(&p.k[kr..kr + kd]);
            rows.v.extend_from_slice(&p.v[vr..vr + bv]);
            if let Some(gk) = p.gk {
                cumulate(&mut rows.gk, &gk[kr..kr + kd], i, kd);
            }
            if let Some(gv) = p.gv {
                cumulate(&mut rows.gv, &gv[vr..vr + bv], i, bv);
            }
        }
        rows
    }

    fn krow<'a>(&self, m: &'a [f32], i: usize) -> &'a [f32] {
        &m[i * self.kd..(i + 1) * self.kd]
    }

    fn vrow<'a>(&self, m: &'a [f32], i: usize) -> &'a [f32] {
        &m[i * self.bv..(i + 1) * self.bv]
    }

    /// Σ_k x_i[k] y_j[k] exp(Gk_i[k] − Gk_j[k])
    fn kdot(&self, x: &[f32], i: usize, y: &[f32], j: usize) -> f32 {
        let (gi, gj) = (self.krow(&self.gk, i), self.krow(&self.gk, j));
        let (xi, yj) = (self.krow(x, i), self.krow(y, j));
        (0..self.kd).map(|c| xi[c] * yj[c] * (gi[c] - gj[c]).exp()).sum()
    }

    /// Σ_v x_i[v] y_j[v] exp(Gv_i[v] − Gv_j[v])
    fn vdot(&self, x: &[f32], i: usize, y: &[f32], j: usize) -> f32 {
        let (gi, gj) = (self.vrow(&self.gv, i), self.vrow(&self.gv, j));
        let (xi, yj) = (self.vrow(x, i), self.vrow(y, j));
        (0..self.bv).map(|c| xi[c] * yj[c] * (gi[c] - gj[c]).exp()).sum()
    }

    /// x_j ∘ exp(G_to − G_j), for rows of width `d` with gates `g`.
    fn carried(x: &[f32], g: &[f32], to: usize, j: usize, d: usize) -> Vec<f32> {
        (0..d)
            .map(|c| x[j * d + c] * (g[to * d + c] - g[j * d + c]).exp())
            .collect()
    }

    /// exp of one row of cumulative gates.
    fn exp_row(g: &[f32], i: usize, d: usize) -> Vec<f32> {
        g[i * d..(i + 1) * d].iter().map(|x| x.exp()).collect()
    }

    /// h ← exp(Gk_C) ⊗ exp(Gv_C) ∘ h + Σ_j carried k_j ⊗ carried v_j
    fn advance(&self, h: &mut [f32]) {
        if self.n == 0 {
            return;
        }
        let last = self.n - 1;
        apply_decay(
            h,
            &Self::exp_row(&self.gk, last, self.kd),
            &Self::exp_row(&self.gv, last, self.bv),
        );
        for j in 0..self.n {
            let kc = Self::carried(&self.k, &self.gk, last, j, self.kd);
            let vc = Self::carried(&self.v, &self.gv, last, j, self.bv);
            add_outer(h, &kc, &vc, 1.0);
        }
    }
}

fn cumulate(acc: &mut [f32], step: &[f32], i: usize, d: usize) {
    for c in 0..d {
        let prev = if i == 0 { 0.0 } else { acc[(i - 1) * d + c] };
        acc[i * d + c] = prev + step[c];
    }
}

fn chunks(len: usize, size: usize) -> impl DoubleEndedIterator<Item = (usize, usize)> + ExactSizeIterator {
    (0..len.div_ceil(size)).map(move |c| (c * size, ((c + 1) * size).min(len)))
}

pub(crate) fn forward(p: &Problem<'_>, h0: Option<&[f32]>, store_final: bool) -> Forward {
    let units = units(p.segments, &p.dims, p.block_v);
    let results: Vec<UnitForward> = units.par_iter().map(|u| forward_unit(p, u, h0)).collect();
    p.gather_forward(&units, results, store_final)
}

fn forward_unit(p: &Problem<'_>, u: &Unit, h0: Option<&[f32]>) -> UnitForward {
    let bv = u.bv();
    let len = u.len();
    let mut h = u.load_state(h0, &p.dims);
    let mut o = vec![0.0f32; len * bv];

    for (c0, c1) in chunks(len, p.chunk_size) {
        let c = ChunkRows::gather(p, u, c0, c1);
        for i in 0..c.n {
            let oi = &mut o[(c0 + i) * bv..(c0 + i + 1) * bv];

            // inter-chunk: exp(Gv_i) ∘ h0^T (qs_i ∘ exp(Gk_i))
            let qg: Vec<f32> = c
                .krow(&c.qs, i)
                .iter()
                .zip(c.krow(&c.gk, i))
                .map(|(q, g)| q * g.exp())
                .collect();
            vec_mat(&qg, &h, oi);
            for (x, g) in oi.iter_mut().zip(c.vrow(&c.gv, i)) {
                *x *= g.exp();
            }

            // intra-chunk
            for j in 0..=i {
                let a = c.kdot(&c.qs, i, &c.k, j);
                let (gi, gj, vj) = (c.vrow(&c.gv, i), c.vrow(&c.gv, j), c.vrow(&c.v, j));
                for col in 0..bv {
                    oi[col] += a * (gi[col] - gj[col]).exp() * vj[col];
                }
            }
        }
        c.advance(&mut h);
    }

    UnitForward { o, h }
}

pub(crate) fn backward(
    p: &Problem<'_>,
    h0: Option<&[f32]>,
    o: &[f32],
    d_o: &[f32],
    dht: Option<&[f32]>,
    need_dh0: bool,
) -> Backward {
    let units = units(p.segments, &p.dims, p.block_v);
    let results: Vec<UnitBackward> = units
        .par_iter()
        .map(|u| backward_unit(p, u, h0, d_o, dht, need_dh0))
        .collect();
    p.gather_backward(&units, results, o, d_o, need_dh0)
}

fn backward_unit(
    p: &Problem<'_>,
    u: &Unit,
    h0: Option<&[f32]>,
    d_o: &[f32],
    dht: Option<&[f32]>,
    need_dh0: bool,
) -> UnitBackward {
    let (heads, kd, vd) = (p.dims.heads, p.dims.k, p.dims.v);
    let bv = u.bv();
    let len = u.len();

    // Chunk-start states and the final state.
    let mut starts = Vec::new();
    let mut h = u.load_state(h0, &p.dims);
    for (c0, c1) in chunks(len, p.chunk_size) {
        starts.push(h.clone());
        ChunkRows::gather(p, u, c0, c1).advance(&mut h);
    }
    let dh_final = dht.map(|_| u.load_state(dht, &p.dims));
    let (final_k, final_v) = final_terms(&h, dh_final.as_deref(), kd, bv);

    let mut do_rows = vec![0.0f32; len * bv];
    for t in 0..len {
        let vr = u.row(t, heads, vd) + u.v0;
        do_rows[t * bv..(t + 1) * bv].copy_from_slice(&d_o[vr..vr + bv]);
    }

    let mut dq = vec![0.0f32; len * kd];
    let mut dk = vec![0.0f32; len * kd];
    let mut dv = vec![0.0f32; len * bv];
    let mut dh = dh_final.unwrap_or_else(|| vec![0.0f32; kd * bv]);

    for ((c0, c1), hs) in chunks(len, p.chunk_size).zip(&starts).rev() {
        let c = ChunkRows::gather(p, u, c0, c1);
        let n = c.n;
        let last = n - 1;
        let dob = &do_rows[c0 * bv..c1 * bv];

        // A[i, j] and D[i, j] = Σ_v do_i v_j exp(Gv_i − Gv_j), j ≤ i
        let mut a = vec![0.0f32; n * n];
        let mut d = vec![0.0f32; n * n];
        for i in 0..n {
            for j in 0..=i {
                a[i * n + j] = c.kdot(&c.qs, i, &c.k, j);
                d[i * n + j] = c.vdot(dob, i, &c.v, j);
            }
        }

        let ek_last = ChunkRows::exp_row(&c.gk, last, kd);
        let ev_last = ChunkRows::exp_row(&c.gv, last, bv);
        for i in 0..n {
            let t = c0 + i;
            let (gk_i, gv_i) = (c.krow(&c.gk, i), c.vrow(&c.gv, i));

            // dqs_i = exp(Gk_i) ∘ h0 (exp(Gv_i) ∘ do_i) + Σ_{j≤i} D[i,j] k_j exp(Gk_i − Gk_j)
            let dog: Vec<f32> = c.vrow(dob, i).iter().zip(gv_i).map(|(x, g)| x * g.exp()).collect();
            let dq_t = &mut dq[t * kd..(t + 1) * kd];
            for row in 0..kd {
                let s: f32 = (0..bv).map(|col| hs[row * bv + col] * dog[col]).sum();
                dq_t[row] = s * gk_i[row].exp();
            }
            for j in 0..=i {
                let (kj, gk_j) = (c.krow(&c.k, j), c.krow(&c.gk, j));
                for row in 0..kd {
                    dq_t[row] += d[i * n + j] * kj[row] * (gk_i[row] - gk_j[row]).exp();
                }
            }
            for x in dq_t.iter_mut() {
                *x *= p.scale;
            }

            // dk_i = Σ_{r≥i} D[r,i] qs_r exp(Gk_r − Gk_i)
            //      + exp(Gk_C − Gk_i) ∘ dh_C (v_i ∘ exp(Gv_C − Gv_i))
            let vc = ChunkRows::carried(&c.v, &c.gv, last, i, bv);
            let dk_t = &mut dk[t * kd..(t + 1) * kd];
            for row in 0..kd {
                let s: f32 = (0..bv).map(|col| dh[row * bv + col] * vc[col]).sum();
                dk_t[row] = s * (c.gk[last * kd + row] - gk_i[row]).exp();
            }
            for r in i..n {
                let (qr, gk_r) = (c.krow(&c.qs, r), c.krow(&c.gk, r));
                for row in 0..kd {
                    dk_t[row] += d[r * n + i] * qr[row] * (gk_r[row] - gk_i[row]).exp();
                }
            }

            // dv_i = Σ_{r≥i} A[r,i] exp(Gv_r − Gv_i) ∘ do_r
            //      + exp(Gv_C − Gv_i) ∘ dh_C^T (k_i ∘ exp(Gk_C − Gk_i))
            let kc = ChunkRows::carried(&c.k, &c.gk, last, i, kd);
            let dv_t = &mut dv[t * bv..(t + 1) * bv];
            vec_mat(&kc, &dh, dv_t);
            for col in 0..bv {
                dv_t[col] *= (c.gv[last * bv + col] - gv_i[col]).exp();
            }
            for r in i..n {
                let (dor, gv_r) = (c.vrow(dob, r), c.vrow(&c.gv, r));
                for col in 0..bv {
                    dv_t[col] += a[r * n + i] * (gv_r[col] - gv_i[col]).exp() * dor[col];
                }
            }
        }

        // dh_0 = Σ_i (qs_i ∘ exp(Gk_i)) ⊗ (do_i ∘ exp(Gv_i)) + exp(Gk_C) ⊗ exp(Gv_C) ∘ dh_C
        apply_decay(&mut dh, &ek_last, &ev_last);
        for i in 0..n {
            let qg: Vec<f32> = c.krow(&c.qs, i).iter().zip(c.krow(&c.gk, i)).map(|(q, g)| q * g.exp()).collect();
            let dog: Vec<f32> = c.vrow(dob, i).iter().zip(c.vrow(&c.gv, i)).map(|(x, g)| x * g.exp()).collect();
            add_outer(&mut dh, &qg, &dog, 1.0);
        }
    }

    UnitBackward {
        dq,
        dk,
        dv,
        dh0: need_dh0.then_some(dh),
        final_k,
        final_v,
    }
}
