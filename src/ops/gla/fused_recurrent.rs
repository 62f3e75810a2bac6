// Sequential gated recurrence, one step at a time per unit.

use rayon::prelude::*;

use super::{apply_decay, final_terms, Backward, Forward, Problem, UnitBackward, UnitForward};
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
    let mut qs = vec![0.0f32; kd];
    let mut ek = vec![1.0f32; kd];
    let mut ev = vec![1.0f32; bv];

    for t in 0..n {
        let kr = u.row(t, heads, kd);
        let vr = u.row(t, heads, vd) + u.v0;

        if p.gated() {
            p.decay(u, t, &mut ek, &mut ev);
            apply_decay(&mut h, &ek, &ev);
        }
        add_outer(&mut h, &p.k[kr..kr + kd], &p.v[vr..vr + bv], 1.0);

        for (s, &x) in qs.iter_mut().zip(&p.q[kr..kr + kd]) {
            *s = x * p.scale;
        }
        vec_mat(&qs, &h, &mut o[t * bv..(t + 1) * bv]);
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
    let n = u.len();

    let mut dq = vec![0.0f32; n * kd];
    let mut dk = vec![0.0f32; n * kd];
    let mut dv = vec![0.0f32; n * bv];
    let mut ek = vec![1.0f32; kd];
    let mut ev = vec![1.0f32; bv];

    // Pass 1: rebuild h_t for dq, ending at the final state.
    let mut h = u.load_state(h0, &p.dims);
    for t in 0..n {
        let kr = u.row(t, heads, kd);
        let vr = u.row(t, heads, vd) + u.v0;
        if p.gated() {
            p.decay(u, t, &mut ek, &mut ev);
            apply_decay(&mut h, &ek, &ev);
        }
        add_outer(&mut h, &p.k[kr..kr + kd], &p.v[vr..vr + bv], 1.0);

        let dq_t = &mut dq[t * kd..(t + 1) * kd];
        mat_vec(&h, &d_o[vr..vr + bv], dq_t);
        for x in dq_t.iter_mut() {
            *x *= p.scale;
        }
    }
    let dh_final = dht.map(|_| u.load_state(dht, &p.dims));
    let (final_k, final_v) = final_terms(&h, dh_final.as_deref(), kd, bv);

    // Pass 2: state adjoint, newest step first.
    let mut dh = dh_final.unwrap_or_else(|| vec![0.0f32; kd * bv]);
    for t in (0..n).rev() {
        let kr = u.row(t, heads, kd);
        let vr = u.row(t, heads, vd) + u.v0;
        add_outer(&mut dh, &p.q[kr..kr + kd], &d_o[vr..vr + bv], p.scale);
        mat_vec(&dh, &p.v[vr..vr + bv], &mut dk[t * kd..(t + 1) * kd]);
        vec_mat(&p.k[kr..kr + kd], &dh, &mut dv[t * bv..(t + 1) * bv]);
        if p.gated() {
            p.decay(u, t, &mut ek, &mut ev);
            apply_decay(&mut dh, &ek, &ev);
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
