// Dense helpers over row-major f32 slices used inside a unit.
// A matrix argument `m` is rows × cols with rows = x.len() / cols = y.len().

/// out[j] = Σ_i x[i] · m[i, j]
#[inline]
pub(crate) fn vec_mat(x: &[f32], m: &[f32], out: &mut [f32]) {
    let cols = out.len();
    out.fill(0.0);
    for (i, &xi) in x.iter().enumerate() {
        axpy(xi, &m[i * cols..(i + 1) * cols], out);
    }
}

/// out[i] = Σ_j m[i, j] · y[j]
#[inline]
pub(crate) fn mat_vec(m: &[f32], y: &[f32], out: &mut [f32]) {
    let cols = y.len();
    for (i, o) in out.iter_mut().enumerate() {
        *o = dot(&m[i * cols..(i + 1) * cols], y);
    }
}

/// m[i, j] += alpha · x[i] · y[j]
#[inline]
pub(crate) fn add_outer(m: &mut [f32], x: &[f32], y: &[f32], alpha: f32) {
    let cols = y.len();
    for (i, &xi) in x.iter().enumerate() {
        axpy(alpha * xi, y, &mut m[i * cols..(i + 1) * cols]);
    }
}

/// y += alpha · x
#[inline]
pub(crate) fn axpy(alpha: f32, x: &[f32], y: &mut [f32]) {
    for (yi, &xi) in y.iter_mut().zip(x) {
        *yi += alpha * xi;
    }
}

#[inline]
pub(crate) fn dot(x: &[f32], y: &[f32]) -> f32 {
    x.iter().zip(y).map(|(a, b)| a * b).sum()
}
