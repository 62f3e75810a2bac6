//! Neural network layers built on the recurrent kernels
//!
//! - `gsa`: the gated slot attention token mixer
//! - `conv`: depthwise causal short convolution
//! - `feature_map`: query/key feature maps
//! - `norm`: RMS normalization
//! - `padding`: mask-driven packing into varlen rows

pub mod conv;
pub mod feature_map;
pub mod gsa;
pub mod norm;
pub mod padding;

pub use conv::ShortConvolution;
pub use feature_map::{FeatureMap, FeatureMapKind};
pub use gsa::GatedSlotAttention;
pub use norm::RmsNorm;
pub use padding::{index_first_axis, pad_input, unpad_indices};

use candle_core::{Result, Tensor};

/// Numerically stable `log(sigmoid(x)) = (x - |x|) / 2 - log(1 + exp(-|x|))`.
/// Uses affine for scalar ops to preserve dtype.
pub(crate) fn logsigmoid(x: &Tensor) -> Result<Tensor> {
    let abs = x.abs()?;
    let linear = (x - &abs)?.affine(0.5, 0.0)?;
    let soft = abs.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    linear - soft
}

/// Repeat each index of `dim` `repeats` times, like PyTorch's `repeat_interleave`.
pub(crate) fn repeat_interleave(tensor: &Tensor, repeats: usize, dim: usize) -> Result<Tensor> {
    if repeats == 1 {
        return Ok(tensor.clone());
    }
    let size = tensor.dim(dim)?;
    let indices: Vec<u32> = (0..size)
        .flat_map(|i| std::iter::repeat(i as u32).take(repeats))
        .collect();
    let indices = Tensor::from_vec(indices, size * repeats, tensor.device())?;
    tensor.index_select(&indices, dim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_logsigmoid_matches_naive() {
        let xs = [-30.0f32, -2.0, 0.0, 1.5, 30.0];
        let t = Tensor::new(&xs, &Device::Cpu).unwrap();
        let got = logsigmoid(&t).unwrap().to_vec1::<f32>().unwrap();
        for (x, y) in xs.iter().zip(got) {
            let expected = if *x < -20.0 { *x } else { -(1.0 + (-x).exp()).ln() };
            assert!((expected - y).abs() < 1e-5, "logsigmoid({x}) = {y}");
        }
    }

    #[test]
    fn test_repeat_interleave_heads() {
        let t = Tensor::new(&[[1f32, 2.], [3., 4.]], &Device::Cpu).unwrap();
        let r = repeat_interleave(&t, 2, 0).unwrap();
        assert_eq!(
            r.to_vec2::<f32>().unwrap(),
            vec![vec![1., 2.], vec![1., 2.], vec![3., 4.], vec![3., 4.]]
        );
    }
}
