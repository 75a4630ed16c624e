//! RMS Normalization implementation.
//!
//! Root Mean Square Layer Normalization only rescales inputs by their RMS
//! value, without centering (no mean subtraction).
//!
//! Reference: <https://arxiv.org/abs/1910.07467>

use candle_core::{D, DType, Device, Result, Tensor};
use candle_nn::{Init, VarBuilder};

/// RMS Normalization layer.
///
/// Formula: `output = (x / rms(x)) * weight`
/// where `rms(x) = sqrt(mean(x^2) + eps)`.
///
/// Statistics are computed in f32 whatever the input dtype, then cast back
/// before the weight is applied.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    /// Learnable scale parameter [hidden_size].
    weight: Tensor,
    /// Small constant for numerical stability.
    eps: f64,
}

impl RmsNorm {
    /// Creates a new RmsNorm from an existing weight tensor.
    pub fn new(weight: Tensor, eps: f64) -> Self {
        Self { weight, eps }
    }

    /// Loads `weight` from the VarBuilder.
    ///
    /// When the builder is backed by a `VarMap` the weight is created as a
    /// trainable variable initialized to ones.
    pub fn load(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
        Ok(Self { weight, eps })
    }

    /// Creates a new RmsNorm layer with ones as weights.
    pub fn new_ones(size: usize, eps: f64, dtype: DType, device: &Device) -> Result<Self> {
        let weight = Tensor::ones(size, dtype, device)?;
        Ok(Self { weight, eps })
    }

    /// Returns a reference to the weight tensor.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Returns the epsilon value.
    pub fn eps(&self) -> f64 {
        self.eps
    }

    /// Applies RMS normalization over the last dimension.
    ///
    /// ```text
    /// rms = sqrt(mean(x^2, dim=-1, keepdim=True) + eps)
    /// output = (x / rms) * weight
    /// ```
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x32 = x.to_dtype(DType::F32)?;

        let variance = x32.sqr()?.mean_keepdim(D::Minus1)?;
        let rms = (variance + self.eps)?.sqrt()?;
        let normalized = x32.broadcast_div(&rms)?.to_dtype(dtype)?;

        normalized.broadcast_mul(&self.weight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    #[test]
    fn test_rmsnorm_load_from_varmap_is_ones() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = RmsNorm::load(8, 1e-6, vb.pp("norm")).unwrap();

        assert_eq!(norm.weight().to_vec1::<f32>().unwrap(), vec![1.0; 8]);
        assert!(varmap.data().lock().unwrap().contains_key("norm.weight"));
    }

    #[test]
    fn test_rmsnorm_forward_values() {
        let device = Device::Cpu;
        let norm = RmsNorm::new_ones(4, 1e-6, DType::F32, &device).unwrap();

        let x = Tensor::new(&[1.0f32, 2.0, 3.0, 4.0], &device)
            .unwrap()
            .reshape((1, 1, 4))
            .unwrap();
        let output: Vec<f32> = norm.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();

        // RMS = sqrt((1 + 4 + 9 + 16) / 4 + eps)
        let rms = (7.5f32 + 1e-6).sqrt();
        for (i, v) in output.iter().enumerate() {
            assert!((v - (i as f32 + 1.0) / rms).abs() < 1e-5);
        }
    }

    #[test]
    fn test_rmsnorm_keeps_input_dtype() {
        let device = Device::Cpu;
        let norm = RmsNorm::new_ones(16, 1e-6, DType::BF16, &device).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (2, 3, 16), &device)
            .unwrap()
            .to_dtype(DType::BF16)
            .unwrap();

        let y = norm.forward(&x).unwrap();
        assert_eq!(y.dtype(), DType::BF16);
        assert_eq!(y.dims(), &[2, 3, 16]);
    }

    #[test]
    fn test_rmsnorm_with_custom_weight() {
        let device = Device::Cpu;
        let weight = Tensor::new(&[2.0f32, 2.0, 2.0, 2.0], &device).unwrap();
        let norm = RmsNorm::new(weight, 1e-6);

        let x = Tensor::new(&[[1.0f32, 2.0, 3.0, 4.0]], &device).unwrap();
        let output: Vec<f32> = norm.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();

        let rms = (7.5f32 + 1e-6).sqrt();
        assert!((output[0] - 2.0 / rms).abs() < 1e-5);
        assert!((output[1] - 4.0 / rms).abs() < 1e-5);
    }
}
