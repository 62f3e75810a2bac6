use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::VarBuilder;

/// RMS normalization over the last dimension, computed in f32.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    /// Absent when the norm has no elementwise affine
    weight: Option<Tensor>,
    eps: f64,
}

impl RmsNorm {
    pub fn new(size: usize, eps: f64, elementwise_affine: bool, vb: VarBuilder) -> Result<Self> {
        let weight = if elementwise_affine {
            Some(vb.get_with_hints(size, "weight", candle_nn::init::Init::Const(1.0))?)
        } else {
            None
        };
        Ok(Self { weight, eps })
    }
}

impl Module for RmsNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x_dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let variance = x.sqr()?.mean_keepdim(D::Minus1)?;
        let x_normed = x.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        match &self.weight {
            Some(w) => x_normed.broadcast_mul(&w.to_dtype(DType::F32)?)?.to_dtype(x_dtype),
            None => x_normed.to_dtype(x_dtype),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn test_rms_norm_unit_rms() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let norm = RmsNorm::new(4, 1e-6, true, vb).unwrap();
        let x = Tensor::new(&[[1.0f32, -2.0, 3.0, -4.0]], &Device::Cpu).unwrap();
        let y = norm.forward(&x).unwrap();
        let ms: f32 = y.sqr().unwrap().mean_all().unwrap().to_scalar().unwrap();
        assert!((ms - 1.0).abs() < 1e-4);
    }
}
