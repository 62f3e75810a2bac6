//! Packing padded batches into one varlen row and back.

use candle_core::{DType, Tensor};

use crate::error::{Error, Result};

/// Flat positions of the valid tokens of a `[batch, seq_len]` 0/1 mask,
/// the matching `cu_seqlens`, and the longest sequence length.
pub fn unpad_indices(mask: &Tensor) -> Result<(Tensor, Vec<usize>, usize)> {
    let (_batch, seq_len) = match *mask.dims() {
        [b, t] => (b, t),
        _ => return Err(Error::MaskRank(mask.rank())),
    };
    let rows = mask.to_dtype(DType::F32)?.to_vec2::<f32>()?;

    let mut indices = Vec::new();
    let mut cu_seqlens = Vec::with_capacity(rows.len() + 1);
    cu_seqlens.push(0);
    let mut max_len = 0;
    for (b, row) in rows.iter().enumerate() {
        let before = indices.len();
        for (t, &m) in row.iter().enumerate() {
            if m != 0.0 {
                indices.push((b * seq_len + t) as u32);
            }
        }
        let len = indices.len() - before;
        max_len = max_len.max(len);
        cu_seqlens.push(indices.len());
    }
    let n = indices.len();
    let indices = Tensor::from_vec(indices, n, mask.device())?;
    Ok((indices, cu_seqlens, max_len))
}

/// Rows of `x` (flattened over its first axis) at `indices`.
pub fn index_first_axis(x: &Tensor, indices: &Tensor) -> Result<Tensor> {
    Ok(x.index_select(indices, 0)?)
}

/// Scatter packed rows `[n, ..]` back into `[batch, seq_len, ..]`; padding
/// positions are zero.
pub fn pad_input(x: &Tensor, indices: &Tensor, batch: usize, seq_len: usize) -> Result<Tensor> {
    let mut shape = x.dims().to_vec();
    shape[0] = batch * seq_len;
    let zeros = Tensor::zeros(shape.as_slice(), x.dtype(), x.device())?;
    let out = zeros.index_add(indices, x, 0)?;

    let mut padded = vec![batch, seq_len];
    padded.extend_from_slice(&x.dims()[1..]);
    Ok(out.reshape(padded)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_unpad_left_padding() {
        let mask = Tensor::new(&[[0u32, 1, 1], [1, 1, 1]], &Device::Cpu).unwrap();
        let (indices, cu, max_len) = unpad_indices(&mask).unwrap();
        assert_eq!(indices.to_vec1::<u32>().unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(cu, vec![0, 2, 5]);
        assert_eq!(max_len, 3);
    }

    #[test]
    fn test_pad_round_trip_zeroes_padding() {
        let mask = Tensor::new(&[[1u32, 1, 0], [0, 1, 0]], &Device::Cpu).unwrap();
        let (indices, _, _) = unpad_indices(&mask).unwrap();
        let x = Tensor::arange(1f32, 13., &Device::Cpu)
            .unwrap()
            .reshape((2, 3, 2))
            .unwrap();
        let packed = index_first_axis(&x.flatten_to(1).unwrap(), &indices).unwrap();
        assert_eq!(packed.dims(), &[3, 2]);
        let back = pad_input(&packed, &indices, 2, 3).unwrap();
        assert_eq!(
            back.to_vec3::<f32>().unwrap(),
            vec![
                vec![vec![1., 2.], vec![3., 4.], vec![0., 0.]],
                vec![vec![0., 0.], vec![9., 10.], vec![0., 0.]],
            ]
        );
    }

    #[test]
    fn test_mask_rank_checked() {
        let mask = Tensor::ones((1, 2, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(unpad_indices(&mask), Err(Error::MaskRank(3))));
    }
}
