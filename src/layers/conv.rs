//! Depthwise causal convolution over time
//!
//! Input `[B, T, D]`, cache `[B, D, W]` holding the last `W` inputs of each
//! sequence. Under `cu_seqlens` the batch is a single packed row and every
//! segment gets its own cache row.

use candle_core::Tensor;
use candle_nn::{init, VarBuilder};

use crate::error::{Error, Result};
use crate::ops::layout::Segments;

#[derive(Debug, Clone)]
pub struct ShortConvolution {
    /// [D, W]
    weight: Tensor,
    /// [D]
    bias: Option<Tensor>,
    hidden_size: usize,
    kernel_size: usize,
}

impl ShortConvolution {
    pub fn new(hidden_size: usize, kernel_size: usize, bias: bool, vb: VarBuilder) -> Result<Self> {
        if kernel_size == 0 {
            return Err(Error::InvalidConfig("conv_size must be positive".into()));
        }
        // Stored the way a depthwise Conv1d stores it
        let weight = vb
            .get_with_hints((hidden_size, 1, kernel_size), "weight", init::DEFAULT_KAIMING_UNIFORM)?
            .squeeze(1)?;
        let bias = if bias {
            let bound = 1.0 / (kernel_size as f64).sqrt();
            Some(vb.get_with_hints(hidden_size, "bias", init::Init::Uniform { lo: -bound, up: bound })?)
        } else {
            None
        };
        Ok(Self {
            weight,
            bias,
            hidden_size,
            kernel_size,
        })
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    /// Returns `(y, cache)`; the cache is `Some` only when `output_final_state`.
    pub fn forward(
        &self,
        x: &Tensor,
        cache: Option<&Tensor>,
        output_final_state: bool,
        cu_seqlens: Option<&[usize]>,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let (batch, seq_len, dim) = x.dims3()?;
        if dim != self.hidden_size {
            return Err(Error::shape("conv input", &[batch, seq_len, self.hidden_size], x.dims()));
        }

        let Some(cu) = cu_seqlens else {
            if let Some(c) = cache {
                crate::ops::expect_shape("conv cache", c, &[batch, dim, self.kernel_size])?;
            }
            let (y, new_cache) = self.convolve(x, cache)?;
            return Ok((y, output_final_state.then_some(new_cache)));
        };

        if batch != 1 {
            return Err(Error::VarlenBatch { batch });
        }
        let segments = Segments::from_cu_seqlens(cu, seq_len)?;
        if let Some(c) = cache {
            crate::ops::expect_shape("conv cache", c, &[segments.len(), dim, self.kernel_size])?;
        }

        let mut outputs = Vec::with_capacity(segments.len());
        let mut caches = Vec::with_capacity(segments.len());
        for (n, &(bos, eos)) in segments.ranges().iter().enumerate() {
            let xs = x.narrow(1, bos, eos - bos)?;
            let row = cache.map(|c| c.narrow(0, n, 1)).transpose()?;
            let (y, c) = self.convolve(&xs, row.as_ref())?;
            outputs.push(y);
            caches.push(c);
        }
        let y = Tensor::cat(&outputs, 1)?;
        let new_cache = if output_final_state {
            Some(Tensor::cat(&caches, 0)?)
        } else {
            None
        };
        Ok((y, new_cache))
    }

    /// One batch of sequences with a shared start position.
    fn convolve(&self, x: &Tensor, cache: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let (batch, seq_len, dim) = x.dims3()?;
        let w = self.kernel_size;
        let x_t = x.transpose(1, 2)?.contiguous()?;

        let history = match cache {
            Some(c) => c.to_dtype(x.dtype())?,
            None => Tensor::zeros((batch, dim, w), x.dtype(), x.device())?,
        };
        // [B, D, W + T]; the conv reads its last W - 1 + T columns
        let all = Tensor::cat(&[history, x_t], 2)?;
        let new_cache = all.narrow(2, seq_len, w)?.contiguous()?;

        let weight = self.weight.to_dtype(x.dtype())?;
        let mut y = Tensor::zeros((batch, dim, seq_len), x.dtype(), x.device())?;
        for j in 0..w {
            let tap = weight.narrow(1, j, 1)?.unsqueeze(0)?;
            y = (y + all.narrow(2, 1 + j, seq_len)?.broadcast_mul(&tap)?)?;
        }
        if let Some(b) = &self.bias {
            y = y.broadcast_add(&b.to_dtype(x.dtype())?.reshape((1, dim, 1))?)?;
        }
        let y = candle_nn::ops::silu(&y)?.transpose(1, 2)?.contiguous()?;
        Ok((y, new_cache))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::test_util::{assert_close, rng, uniform};
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn conv(dim: usize, width: usize, bias: bool, seed: u64) -> ShortConvolution {
        let map = VarMap::new();
        let vb = VarBuilder::from_varmap(&map, DType::F32, &Device::Cpu);
        let mut conv = ShortConvolution::new(dim, width, bias, vb).unwrap();
        let mut r = rng(seed);
        conv.weight = uniform(&mut r, &[dim, width], -1.0, 1.0);
        if bias {
            conv.bias = Some(uniform(&mut r, &[dim], -0.5, 0.5));
        }
        conv
    }

    #[test]
    fn test_conv_matches_direct_sum() {
        let c = conv(1, 3, false, 1);
        let w = c.weight.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let x = Tensor::new(&[[[1.0f32], [2.0], [3.0]]], &Device::Cpu).unwrap();
        let (y, _) = c.forward(&x, None, false, None).unwrap();
        let silu = |z: f32| z / (1.0 + (-z).exp());
        let expected = [
            silu(w[2] * 1.0),
            silu(w[1] * 1.0 + w[2] * 2.0),
            silu(w[0] * 1.0 + w[1] * 2.0 + w[2] * 3.0),
        ];
        let expected = Tensor::from_vec(expected.to_vec(), (1, 3, 1), &Device::Cpu).unwrap();
        assert_close("y", &y, &expected, 1e-5);
    }

    #[test]
    fn test_conv_cache_continues_sequence() {
        let c = conv(3, 4, true, 2);
        let x = uniform(&mut rng(3), &[2, 7, 3], -1.0, 1.0);
        let (full, full_cache) = c.forward(&x, None, true, None).unwrap();

        let (a, cache) = c.forward(&x.narrow(1, 0, 2).unwrap(), None, true, None).unwrap();
        let (b, cache) = c
            .forward(&x.narrow(1, 2, 5).unwrap(), cache.as_ref(), true, None)
            .unwrap();
        let chained = Tensor::cat(&[a, b], 1).unwrap();
        assert_close("y", &chained, &full, 1e-5);
        assert_close("cache", &cache.unwrap(), &full_cache.unwrap(), 1e-6);
    }

    #[test]
    fn test_conv_segments_isolated() {
        let c = conv(2, 3, false, 4);
        let x = uniform(&mut rng(5), &[1, 6, 2], -1.0, 1.0);
        let cu = [0usize, 2, 6];
        let (packed, cache) = c.forward(&x, None, true, Some(&cu)).unwrap();

        for (n, w) in cu.windows(2).enumerate() {
            let xs = x.narrow(1, w[0], w[1] - w[0]).unwrap();
            let (y, c_n) = c.forward(&xs, None, true, None).unwrap();
            assert_close("y", &packed.narrow(1, w[0], w[1] - w[0]).unwrap(), &y, 1e-5);
            assert_close(
                "cache",
                &cache.as_ref().unwrap().narrow(0, n, 1).unwrap(),
                &c_n.unwrap(),
                1e-6,
            );
        }
    }

    #[test]
    fn test_conv_rejects_bad_cache() {
        let c = conv(2, 3, false, 6);
        let x = uniform(&mut rng(7), &[2, 4, 2], -1.0, 1.0);
        let bad = Tensor::zeros((1, 2, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            c.forward(&x, Some(&bad), false, None),
            Err(Error::ShapeMismatch { .. })
        ));
    }
}
