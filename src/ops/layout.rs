// Flat-buffer layout shared by every kernel.
//
// Notation:
// - N: number of sequences (batch size, or segments under cu_seqlens)
// - H: heads, K: key width, V: value width
// - token-major buffers are [B*T, H, D] row-major
// - state buffers are [N, H, K, V] row-major
// - a unit is one (sequence, head, V-block) triple and owns a private [K, bv] state

use crate::error::{Error, Result};

/// Feature widths of one recurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Dims {
    pub heads: usize,
    pub k: usize,
    pub v: usize,
}

impl Dims {
    pub fn new(heads: usize, k: usize, v: usize) -> Self {
        Self { heads, k, v }
    }

    /// Elements in one [K, V] state.
    pub fn state_len(&self) -> usize {
        self.k * self.v
    }
}

/// [bos, eos) time ranges of the independent sequences in a packed buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Segments {
    ranges: Vec<(usize, usize)>,
}

impl Segments {
    /// Fixed tiling: sequence n covers [n*T, n*T + T).
    pub fn fixed(batch: usize, seq_len: usize) -> Self {
        let ranges = (0..batch).map(|n| (n * seq_len, n * seq_len + seq_len)).collect();
        Self { ranges }
    }

    /// Boundaries from a cumulative length table over a packed time axis of `total` steps.
    pub fn from_cu_seqlens(cu_seqlens: &[usize], total: usize) -> Result<Self> {
        if cu_seqlens.len() < 2 {
            return Err(Error::InvalidCuSeqlens(format!(
                "expected at least 2 boundaries, got {}",
                cu_seqlens.len()
            )));
        }
        if cu_seqlens[0] != 0 {
            return Err(Error::InvalidCuSeqlens(format!(
                "first boundary must be 0, got {}",
                cu_seqlens[0]
            )));
        }
        if let Some(w) = cu_seqlens.windows(2).find(|w| w[1] < w[0]) {
            return Err(Error::InvalidCuSeqlens(format!(
                "boundaries must be non-decreasing, found {} after {}",
                w[1], w[0]
            )));
        }
        let last = cu_seqlens[cu_seqlens.len() - 1];
        if last != total {
            return Err(Error::InvalidCuSeqlens(format!(
                "last boundary {} does not match packed length {}",
                last, total
            )));
        }
        let ranges = cu_seqlens.windows(2).map(|w| (w[0], w[1])).collect();
        Ok(Self { ranges })
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn ranges(&self) -> &[(usize, usize)] {
        &self.ranges
    }
}

/// Partition [0, v) into blocks of at most `block` columns. The last block is
/// narrower when `block` does not divide `v`.
pub(crate) fn v_blocks(v: usize, block: usize) -> Vec<(usize, usize)> {
    let block = block.max(1);
    (0..v.div_ceil(block))
        .map(|i| (i * block, ((i + 1) * block).min(v)))
        .collect()
}

/// One independent execution unit.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Unit {
    /// Sequence index (batch row or segment)
    pub seq: usize,
    pub head: usize,
    pub bos: usize,
    pub eos: usize,
    /// V-block column range
    pub v0: usize,
    pub v1: usize,
}

impl Unit {
    pub fn len(&self) -> usize {
        self.eos - self.bos
    }

    pub fn bv(&self) -> usize {
        self.v1 - self.v0
    }

    /// Start of the `d`-wide row of token `t` (relative to bos) in a [.., H, d] buffer.
    #[inline]
    pub fn row(&self, t: usize, heads: usize, d: usize) -> usize {
        ((self.bos + t) * heads + self.head) * d
    }

    /// Start of this unit's [K, V] state in a [N, H, K, V] buffer.
    #[inline]
    pub fn state_base(&self, dims: &Dims) -> usize {
        (self.seq * dims.heads + self.head) * dims.state_len()
    }

    /// Copy this unit's [K, bv] slice out of a full state buffer, or zeros.
    pub fn load_state(&self, state: Option<&[f32]>, dims: &Dims) -> Vec<f32> {
        let bv = self.bv();
        let mut h = vec![0.0f32; dims.k * bv];
        if let Some(state) = state {
            let base = self.state_base(dims);
            for i in 0..dims.k {
                let src = base + i * dims.v + self.v0;
                h[i * bv..(i + 1) * bv].copy_from_slice(&state[src..src + bv]);
            }
        }
        h
    }

    /// Write a [K, bv] slice back into a full state buffer.
    pub fn store_state(&self, h: &[f32], state: &mut [f32], dims: &Dims) {
        let bv = self.bv();
        let base = self.state_base(dims);
        for i in 0..dims.k {
            let dst = base + i * dims.v + self.v0;
            state[dst..dst + bv].copy_from_slice(&h[i * bv..(i + 1) * bv]);
        }
    }

    /// Write `[len, bv]` rows into a token-major [.., H, V] buffer.
    pub fn scatter_v(&self, rows: &[f32], out: &mut [f32], dims: &Dims) {
        let bv = self.bv();
        for t in 0..self.len() {
            let dst = self.row(t, dims.heads, dims.v) + self.v0;
            out[dst..dst + bv].copy_from_slice(&rows[t * bv..(t + 1) * bv]);
        }
    }

    /// Add `[len, K]` partial rows into a token-major [.., H, K] buffer.
    pub fn accumulate_k(&self, rows: &[f32], out: &mut [f32], dims: &Dims) {
        for t in 0..self.len() {
            let dst = self.row(t, dims.heads, dims.k);
            for (o, r) in out[dst..dst + dims.k].iter_mut().zip(&rows[t * dims.k..(t + 1) * dims.k]) {
                *o += *r;
            }
        }
    }
}

/// Enumerate every (sequence, head, V-block) unit.
pub(crate) fn units(segments: &Segments, dims: &Dims, block_v: usize) -> Vec<Unit> {
    let blocks = v_blocks(dims.v, block_v);
    let mut out = Vec::with_capacity(segments.len() * dims.heads * blocks.len());
    for (seq, &(bos, eos)) in segments.ranges().iter().enumerate() {
        for head in 0..dims.heads {
            for &(v0, v1) in &blocks {
                out.push(Unit { seq, head, bos, eos, v0, v1 });
            }
        }
    }
    out
}
