// Sequential IPLR kernel.
//
// Per unit the state h is [K, bv] and each step is
//   ha_t = h^T a_t
//   h   += b_t ⊗ ha_t + k_t ⊗ v_t
//   o_t  = h^T (q_t * scale)

use rayon::prelude::*;

use super::{Backward, Forward, Problem, UnitBackward, UnitForward};
use crate::ops::layout::{units, Unit};
use crate::ops::linalg::{add_outer, mat_vec, vec_mat};

pub(crate) fn forward(p: &Problem<'_>, h0: Option<&[f32]>, store_final: bool) -> Forward {
    let units = units(p.segments, &p.dims, p.block_v);
    let results: Vec<UnitForward> = units.par_iter().map(|u| forward_unit(p, u, h0)).collect();
    p.gather_forward(&units, results, store_final)
}

fn forward_unit(p: &Problem<'_>, u: &Unit, h0: Option<&[f32]>) -> UnitForward {
    let (heads, kd, vd) = (p.dims.heads, p.dims.k, p.dims.v);
    let bv = u.bv();
    let n = u.len();

    let mut h = u.load_state(h0, &p.dims);
    let mut o = vec![0.0f32; n * bv];
    let mut ha = vec![0.0f32; n * bv];
    let mut qs = vec![0.0f32; kd];

    for t in 0..n {
        let kr = u.row(t, heads, kd);
        let vr = u.row(t, heads, vd) + u.v0;
        let (q_t, k_t) = (&p.q[kr..kr + kd], &p.k[kr..kr + kd]);
        let (a_t, b_t) = (&p.a[kr..kr + kd], &p.b[kr..kr + kd]);
        let v_t = &p.v[vr..vr + bv];

        let ha_t = &mut ha[t * bv..(t + 1) * bv];
        vec_mat(a_t, &h, ha_t);
        add_outer(&mut h, b_t, ha_t, 1.0);
        add_outer(&mut h, k_t, v_t, 1.0);

        for (s, &x) in qs.iter_mut().zip(q_t) {
            *s = x * p.scale;
        }
        vec_mat(&qs, &h, &mut o[t * bv..(t + 1) * bv]);
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
    let n = u.len();

    let mut dq = vec![0.0f32; n * kd];
    let mut dk = vec![0.0f32; n * kd];
    let mut da = vec![0.0f32; n * kd];
    let mut db = vec![0.0f32; n * kd];
    let mut dv = vec![0.0f32; n * bv];
    let mut dha = vec![0.0f32; n * bv];

    // Pass 1: adjoint of the state, newest step first.
    let mut dh = u.load_state(dht, &p.dims);
    for t in (0..n).rev() {
        let kr = u.row(t, heads, kd);
        let vr = u.row(t, heads, vd) + u.v0;
        let (q_t, k_t) = (&p.q[kr..kr + kd], &p.k[kr..kr + kd]);
        let (a_t, b_t) = (&p.a[kr..kr + kd], &p.b[kr..kr + kd]);
        let (v_t, ha_t, do_t) = (&p.v[vr..vr + bv], &ha[vr..vr + bv], &d_o[vr..vr + bv]);

        add_outer(&mut dh, q_t, do_t, p.scale);

        let rk = t * kd..(t + 1) * kd;
        let rv = t * bv..(t + 1) * bv;
        mat_vec(&dh, v_t, &mut dk[rk.clone()]);
        vec_mat(k_t, &dh, &mut dv[rv.clone()]);
        vec_mat(b_t, &dh, &mut dha[rv.clone()]);
        mat_vec(&dh, ha_t, &mut db[rk]);

        // back through h += b ⊗ (h^T a): only after the reads above
        add_outer(&mut dh, a_t, &dha[rv], 1.0);
    }
    let dh0 = need_dh0.then_some(dh);

    // Pass 2: replay the state forward for dq and da.
    let mut h = u.load_state(h0, &p.dims);
    for t in 0..n {
        let kr = u.row(t, heads, kd);
        let vr = u.row(t, heads, vd) + u.v0;
        let (k_t, b_t) = (&p.k[kr..kr + kd], &p.b[kr..kr + kd]);
        let (v_t, ha_t, do_t) = (&p.v[vr..vr + bv], &ha[vr..vr + bv], &d_o[vr..vr + bv]);
        let rk = t * kd..(t + 1) * kd;

        mat_vec(&h, &dha[t * bv..(t + 1) * bv], &mut da[rk.clone()]);
        add_outer(&mut h, k_t, v_t, 1.0);
        add_outer(&mut h, b_t, ha_t, 1.0);

        let dq_t = &mut dq[rk];
        mat_vec(&h, do_t, dq_t);
        for x in dq_t.iter_mut() {
            *x *= p.scale;
        }
    }

    UnitBackward {
        dq,
        dk,
        da,
        db,
        dv,
        dh0,
    }
}
