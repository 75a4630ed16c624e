//! Rotary Position Embeddings (RoPE) implementation.
//!
//! RoPE encodes position information by rotating pairs of elements in the
//! query and key vectors. The dot product of two rotated vectors depends only
//! on their relative position.
//!
//! Reference: <https://arxiv.org/abs/2104.09864>

use candle_core::{DType, Device, Result, Tensor};

/// Rotary Position Embedding with precomputed cos/sin tables.
///
/// Uses the "rotate half" pairing: element `i` is rotated together with
/// element `i + dim/2`.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    /// Precomputed cosine values [max_seq_len, head_dim].
    cos_cache: Tensor,
    /// Precomputed sine values [max_seq_len, head_dim].
    sin_cache: Tensor,
    /// Head dimension (must be even for rotation pairs).
    dim: usize,
    /// Number of positions in the tables.
    max_seq_len: usize,
}

impl RotaryEmbedding {
    /// Creates a new RotaryEmbedding.
    ///
    /// # Arguments
    ///
    /// * `dim` - Head dimension (must be even)
    /// * `max_seq_len` - Number of positions to precompute
    /// * `theta` - Base frequency (1_000_000 for Qwen3)
    /// * `dtype` - Data type for the cache tensors
    /// * `device` - Device to create tensors on
    pub fn new(
        dim: usize,
        max_seq_len: usize,
        theta: f64,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        if !dim.is_multiple_of(2) {
            candle_core::bail!("RoPE dimension must be even, got {dim}");
        }

        // inv_freq[i] = 1 / theta^(2i/dim)
        let half_dim = dim / 2;
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| 1.0 / theta.powf(2.0 * i as f64 / dim as f64) as f32)
            .collect();
        let inv_freq = Tensor::new(inv_freq.as_slice(), device)?;

        let positions = Tensor::arange(0u32, max_seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_seq_len, 1))?;

        // [max_seq_len, dim/2] -> [max_seq_len, dim]
        let freqs = positions.broadcast_mul(&inv_freq)?;
        let freqs = Tensor::cat(&[&freqs, &freqs], 1)?;

        Ok(Self {
            cos_cache: freqs.cos()?.to_dtype(dtype)?,
            sin_cache: freqs.sin()?.to_dtype(dtype)?,
            dim,
            max_seq_len,
        })
    }

    /// Returns the head dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Returns the number of precomputed positions.
    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Returns a reference to the cosine cache.
    pub fn cos_cache(&self) -> &Tensor {
        &self.cos_cache
    }

    /// Returns a reference to the sine cache.
    pub fn sin_cache(&self) -> &Tensor {
        &self.sin_cache
    }

    /// Applies rotary embedding to query and key tensors.
    ///
    /// # Arguments
    ///
    /// * `q` - Query tensor [batch, seq_len, num_heads, head_dim]
    /// * `k` - Key tensor [batch, seq_len, num_kv_heads, head_dim]
    /// * `start_pos` - Position of the first token
    pub fn apply(&self, q: &Tensor, k: &Tensor, start_pos: usize) -> Result<(Tensor, Tensor)> {
        let (_, seq_len, _, _) = q.dims4()?;
        if start_pos + seq_len > self.max_seq_len {
            candle_core::bail!(
                "positions {start_pos}..{} exceed the RoPE table ({})",
                start_pos + seq_len,
                self.max_seq_len
            );
        }

        // [seq_len, dim] -> [1, seq_len, 1, dim]
        let cos = self.cos_cache.narrow(0, start_pos, seq_len)?;
        let sin = self.sin_cache.narrow(0, start_pos, seq_len)?;
        let cos = cos.unsqueeze(0)?.unsqueeze(2)?.to_dtype(q.dtype())?;
        let sin = sin.unsqueeze(0)?.unsqueeze(2)?.to_dtype(q.dtype())?;

        let q_rot = Self::apply_rotation(q, &cos, &sin)?;
        let k_rot = Self::apply_rotation(k, &cos, &sin)?;
        Ok((q_rot, k_rot))
    }

    /// `x_rot = x * cos + rotate_half(x) * sin`
    fn apply_rotation(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let x_cos = x.broadcast_mul(cos)?;
        let x_sin = Self::rotate_half(x)?.broadcast_mul(sin)?;
        x_cos + x_sin
    }

    /// `[x1, x2] -> [-x2, x1]` over the last dimension.
    fn rotate_half(x: &Tensor) -> Result<Tensor> {
        let last = x.rank() - 1;
        let half = x.dim(last)? / 2;
        let x1 = x.narrow(last, 0, half)?;
        let x2 = x.narrow(last, half, half)?;
        Tensor::cat(&[&x2.neg()?, &x1], last)
    }
}
