// Chunked IPLR kernel.
//
// Inside a chunk of n rows with start state h0 (all products restricted to
// the unit's V-block):
//   L_ab = strict_tril(A B^T)     L_ak = strict_tril(A K^T)
//   P_qb = tril(Qs B^T)           P_qk = tril(Qs K^T)
//   U    = (I - L_ab)^{-1} (A h0 + L_ak V)
//   O    = Qs h0 + P_qb U + P_qk V
//   h_C  = h0 + B^T U + K^T V
// U is the per-step h^T a of the sequential form, so it is saved as `ha`.

use rayon::prelude::*;

use super::{Backward, Forward, Problem, UnitBackward, UnitForward};
use crate::ops::layout::{units, Unit};
use crate::ops::linalg::{add_outer, axpy, dot, mat_vec, vec_mat};

/// Rows of one chunk copied out of the flat inputs.
struct ChunkRows {
    n: usize,
    kd: usize,
    bv: usize,
    qs: Vec<f32>,
    k: Vec<f32>,
    a: Vec<f32>,
    b: Vec<f32>,
    v: Vec<f32>,
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
            a: Vec::with_capacity(n * kd),
            b: Vec::with_capacity(n * kd),
            v: Vec::with_capacity(n * bv),
        };
        for t in c0..c1 {
            let kr = u.row(t, heads, kd);
            let vr = u.row(t, heads, vd) + u.v0;
            rows.qs.extend(p.q[kr..kr + kd].iter().map(|x| x * p.scale));
            rows.k.extend_from_slice(&p.k[kr..kr + kd]);
            rows.a.extend_from_slice(&p.a[kr..kr + kd]);
            rows.b.extend_from_slice(&p.b[kr..kr + kd]);
            rows.v.extend_from_slice(&p.v[vr..vr + bv]);
        }
        rows
    }

    fn krow<'a>(&self, m: &'a [f32], i: usize) -> &'a [f32] {
        &m[i * self.kd..(i + 1) * self.kd]
    }

    fn vrow<'a>(&self, m: &'a [f32], i: usize) -> &'a [f32] {
        &m[i * self.bv..(i + 1) * self.bv]
    }

    /// [n, n] lower-triangular Gram matrix x_i · y_j, diagonal kept when `inclusive`.
    fn tril(&self, x: &[f32], y: &[f32], inclusive: bool) -> Vec<f32> {
        let n = self.n;
        let mut g = vec![0.0f32; n * n];
        for i in 0..n {
            let end = if inclusive { i + 1 } else { i };
            for j in 0..end {
                g[i * n + j] = dot(self.krow(x, i), self.krow(y, j));
            }
        }
        g
    }
}

/// Triangular factors shared by the chunk forward and backward.
struct Factors {
    l_ab: Vec<f32>,
    l_ak: Vec<f32>,
    p_qb: Vec<f32>,
    p_qk: Vec<f32>,
}

impl Factors {
    fn new(c: &ChunkRows) -> Self {
        Self {
            l_ab: c.tril(&c.a, &c.b, false),
            l_ak: c.tril(&c.a, &c.k, false),
            p_qb: c.tril(&c.qs, &c.b, true),
            p_qk: c.tril(&c.qs, &c.k, true),
        }
    }
}

/// Chunk boundaries [c0, c1) over a unit of `len` steps.
fn chunks(len: usize, size: usize) -> impl DoubleEndedIterator<Item = (usize, usize)> + ExactSizeIterator {
    (0..len.div_ceil(size)).map(move |c| (c * size, ((c + 1) * size).min(len)))
}

/// Forward substitution for U; returns the [n, bv] rows.
fn solve_u(c: &ChunkRows, f: &Factors, h0: &[f32]) -> Vec<f32> {
    let (n, bv) = (c.n, c.bv);
    let mut u = vec![0.0f32; n * bv];
    for i in 0..n {
        let (done, rest) = u.split_at_mut(i * bv);
        let ui = &mut rest[..bv];
        vec_mat(c.krow(&c.a, i), h0, ui);
        for j in 0..i {
            axpy(f.l_ak[i * n + j], c.vrow(&c.v, j), ui);
            axpy(f.l_ab[i * n + j], &done[j * bv..(j + 1) * bv], ui);
        }
    }
    u
}

/// h += B^T U + K^T V
fn advance(h: &mut [f32], c: &ChunkRows, u: &[f32]) {
    for j in 0..c.n {
        add_outer(h, c.krow(&c.b, j), c.vrow(u, j), 1.0);
        add_outer(h, c.krow(&c.k, j), c.vrow(&c.v, j), 1.0);
    }
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
    let mut ha = vec![0.0f32; len * bv];

    for (c0, c1) in chunks(len, p.chunk_size) {
        let c = ChunkRows::gather(p, u, c0, c1);
        let f = Factors::new(&c);
        let n = c.n;
        let uu = solve_u(&c, &f, &h);

        for i in 0..n {
            let oi = &mut o[(c0 + i) * bv..(c0 + i + 1) * bv];
            vec_mat(c.krow(&c.qs, i), &h, oi);
            for j in 0..=i {
                axpy(f.p_qb[i * n + j], c.vrow(&uu, j), oi);
                axpy(f.p_qk[i * n + j], c.vrow(&c.v, j), oi);
            }
        }
        advance(&mut h, &c, &uu);
        ha[c0 * bv..c1 * bv].copy_from_slice(&uu);
    }

    UnitForward { o, ha, h }
}

pub(crate) fn backward(
    p: &Problem<'_>,
    h0: Option<&[f32]>,
    ha: &[f32],
    d_o: &[f32],
    dht: Option<&[f32]>,
    need_dh0: bool,
) -> Backward {
    let units = units(p.segments, &p.dims, p.block_v);
    let results: Vec<UnitBackward> = units
        .par_iter()
        .map(|u| backward_unit(p, u, h0, ha, d_o, dht, need_dh0))
        .collect();
    p.gather_backward(&units, results, need_dh0)
}

fn backward_unit(
    p: &Problem<'_>,
    u: &Unit,
    h0: Option<&[f32]>,
    ha: &[f32],
    d_o: &[f32],
    dht: Option<&[f32]>,
    need_dh0: bool,
) -> UnitBackward {
    let (heads, kd, vd) = (p.dims.heads, p.dims.k, p.dims.v);
    let bv = u.bv();
    let len = u.len();

    // Local copies of the saved U rows and the incoming dO rows.
    let mut u_rows = vec![0.0f32; len * bv];
    let mut do_rows = vec![0.0f32; len * bv];
    for t in 0..len {
        let vr = u.row(t, heads, vd) + u.v0;
        u_rows[t * bv..(t + 1) * bv].copy_from_slice(&ha[vr..vr + bv]);
        do_rows[t * bv..(t + 1) * bv].copy_from_slice(&d_o[vr..vr + bv]);
    }

    // Chunk-start states, recomputed from the saved U.
    let mut starts = Vec::new();
    let mut h = u.load_state(h0, &p.dims);
    for (c0, c1) in chunks(len, p.chunk_size) {
        starts.push(h.clone());
        let c = ChunkRows::gather(p, u, c0, c1);
        advance(&mut h, &c, &u_rows[c0 * bv..c1 * bv]);
    }

    let mut dq = vec![0.0f32; len * kd];
    let mut dk = vec![0.0f32; len * kd];
    let mut da = vec![0.0f32; len * kd];
    let mut db = vec![0.0f32; len * kd];
    let mut dv = vec![0.0f32; len * bv];

    let mut dh = u.load_state(dht, &p.dims);
    for ((c0, c1), hs) in chunks(len, p.chunk_size).zip(&starts).rev() {
        let c = ChunkRows::gather(p, u, c0, c1);
        let f = Factors::new(&c);
        let n = c.n;
        let uu = &u_rows[c0 * bv..c1 * bv];
        let dob = &do_rows[c0 * bv..c1 * bv];

        // dU_j = Σ_{i≥j} P_qb[i,j] dO_i + dh_C^T b_j
        let mut du = vec![0.0f32; n * bv];
        for j in 0..n {
            let duj = &mut du[j * bv..(j + 1) * bv];
            vec_mat(c.krow(&c.b, j), &dh, duj);
            for i in j..n {
                axpy(f.p_qb[i * n + j], c.vrow(dob, i), duj);
            }
        }

        // dR = (I - L_ab)^{-T} dU, newest row first
        let mut dr = du;
        for j in (0..n).rev() {
            let (head, tail) = dr.split_at_mut((j + 1) * bv);
            let drj = &mut head[j * bv..];
            for i in j + 1..n {
                axpy(f.l_ab[i * n + j], &tail[(i - j - 1) * bv..(i - j) * bv], drj);
            }
        }

        // Inner products reused by several gradients.
        let mut ou = vec![0.0f32; n * n];
        let mut ov = vec![0.0f32; n * n];
        let mut ru = vec![0.0f32; n * n];
        let mut rv = vec![0.0f32; n * n];
        for i in 0..n {
            for j in 0..=i {
                ou[i * n + j] = dot(c.vrow(dob, i), c.vrow(uu, j));
                ov[i * n + j] = dot(c.vrow(dob, i), c.vrow(&c.v, j));
                if j < i {
                    ru[i * n + j] = dot(c.vrow(&dr, i), c.vrow(uu, j));
                    rv[i * n + j] = dot(c.vrow(&dr, i), c.vrow(&c.v, j));
                }
            }
        }

        for i in 0..n {
            let t = c0 + i;
            let rk = t * kd..(t + 1) * kd;

            // dqs_i = h0 dO_i + Σ_{j≤i} (dO_i·U_j) b_j + (dO_i·V_j) k_j
            let dq_t = &mut dq[rk.clone()];
            mat_vec(hs, c.vrow(dob, i), dq_t);
            for j in 0..=i {
                axpy(ou[i * n + j], c.krow(&c.b, j), dq_t);
                axpy(ov[i * n + j], c.krow(&c.k, j), dq_t);
            }
            for x in dq_t.iter_mut() {
                *x *= p.scale;
            }

            // dA_i = h0 dR_i + Σ_{j<i} (dR_i·U_j) b_j + (dR_i·V_j) k_j
            let da_t = &mut da[rk.clone()];
            mat_vec(hs, c.vrow(&dr, i), da_t);
            for j in 0..i {
                axpy(ru[i * n + j], c.krow(&c.b, j), da_t);
                axpy(rv[i * n + j], c.krow(&c.k, j), da_t);
            }

            // dB_i = Σ_{r≥i} (dO_r·U_i) qs_r + Σ_{r>i} (dR_r·U_i) a_r + dh_C U_i
            let db_t = &mut db[rk.clone()];
            mat_vec(&dh, c.vrow(uu, i), db_t);
            // dK_i = Σ_{r≥i} (dO_r·V_i) qs_r + Σ_{r>i} (dR_r·V_i) a_r + dh_C V_i
            let dk_t = &mut dk[rk];
            mat_vec(&dh, c.vrow(&c.v, i), dk_t);
            for r in i..n {
                axpy(ou[r * n + i], c.krow(&c.qs, r), db_t);
                axpy(ov[r * n + i], c.krow(&c.qs, r), dk_t);
                if r > i {
                    axpy(ru[r * n + i], c.krow(&c.a, r), db_t);
                    axpy(rv[r * n + i], c.krow(&c.a, r), dk_t);
                }
            }

            // dV_i = Σ_{r≥i} P_qk[r,i] dO_r + Σ_{r>i} L_ak[r,i] dR_r + dh_C^T k_i
            let dv_t = &mut dv[t * bv..(t + 1) * bv];
            vec_mat(c.krow(&c.k, i), &dh, dv_t);
            for r in i..n {
                axpy(f.p_qk[r * n + i], c.vrow(dob, r), dv_t);
                if r > i {
                    axpy(f.l_ak[r * n + i], c.vrow(&dr, r), dv_t);
                }
            }
        }

        // dh_0 = Qs^T dO + A^T dR + dh_C, carried into the previous chunk
        for i in 0..n {
            add_outer(&mut dh, c.krow(&c.qs, i), c.vrow(dob, i), 1.0);
            add_outer(&mut dh, c.krow(&c.a, i), c.vrow(&dr, i), 1.0);
        }
    }

    UnitBackward {
        dq,
        dk,
        da,
        db,
        dv,
        dh0: need_dh0.then_some(dh),
    }
}
