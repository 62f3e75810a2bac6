//! Random inputs and tolerance comparisons
//!
//! Shared by the `check`/`bench` subcommands and the test suites.

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::Rng;

use crate::error::{Error, Result};

/// Uniform random `f32` tensor in `[lo, hi)`.
pub fn uniform(rng: &mut StdRng, shape: &[usize], lo: f32, hi: f32, device: &Device) -> Result<Tensor> {
    let n: usize = shape.iter().product();
    let data: Vec<f32> = (0..n).map(|_| rng.gen_range(lo..hi)).collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

/// Largest elementwise relative difference, `|a - b| / (1 + max(|a|, |b|))`.
///
/// NaN in either input yields NaN.
pub fn max_rel_diff(a: &Tensor, b: &Tensor) -> Result<f64> {
    if a.dims() != b.dims() {
        return Err(Error::shape("max_rel_diff", a.dims(), b.dims()));
    }
    let a = a.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let b = b.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    Ok(a.iter().zip(&b).fold(0.0, |acc: f64, (x, y)| {
        let err = ((x - y).abs() / (1.0 + x.abs().max(y.abs()))) as f64;
        if err.is_nan() || acc.is_nan() {
            f64::NAN
        } else {
            acc.max(err)
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_uniform_in_range() {
        let mut rng = StdRng::seed_from_u64(0);
        let t = uniform(&mut rng, &[4, 8], 0.25, 0.5, &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[4, 8]);
        let data = t.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(data.iter().all(|&x| (0.25..0.5).contains(&x)));
    }

    #[test]
    fn test_max_rel_diff() {
        let a = Tensor::new(&[1f32, 2., 3.], &Device::Cpu).unwrap();
        let b = Tensor::new(&[1f32, 2., 1.], &Device::Cpu).unwrap();
        assert_eq!(max_rel_diff(&a, &a).unwrap(), 0.0);
        assert!((max_rel_diff(&a, &b).unwrap() - 0.5).abs() < 1e-9);

        let nan = Tensor::new(&[f32::NAN, 2., 3.], &Device::Cpu).unwrap();
        assert!(max_rel_diff(&nan, &a).unwrap().is_nan());

        let short = Tensor::new(&[1f32, 2.], &Device::Cpu).unwrap();
        assert!(matches!(max_rel_diff(&a, &short), Err(Error::ShapeMismatch { .. })));
    }
}
