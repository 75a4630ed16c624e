//! Draft attention with test-time-training (TTT) caching.
//!
//! During training the draft model is unrolled `ttt_length` times over the
//! same sequence. Step `j` sees:
//! - the step-0 keys/values causally (position `t` attends to `0..=t`)
//! - for every later step `i in 1..=j`, only the key/value at its own
//!   position `t`
//!
//! Two backends compute the same result:
//!
//! ```text
//! Sdpa:           [ causal block S×S | diag_1 | diag_2 | ... ]   one column per extra step
//! FlexAttention:  [ causal block S×S | S×S block, diagonal only | ... ]   explicit block mask
//! ```

use std::fmt;
use std::str::FromStr;

use candle_core::{D, DType, Device, Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder, linear_no_bias};
use serde::{Deserialize, Serialize};

use super::config::Eagle3DraftConfig;
use crate::error::Error;
use crate::model::{MASK_VALUE, RmsNorm, RotaryEmbedding, repeat_kv};

/// Draft attention implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttentionBackend {
    /// Causal block plus one score column per cached step.
    #[serde(rename = "sdpa")]
    Sdpa,
    /// Keys of all steps concatenated, masked with the EAGLE3 block mask.
    #[serde(rename = "flex_attention")]
    FlexAttention,
}

impl FromStr for AttentionBackend {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Error> {
        match s {
            "sdpa" => Ok(AttentionBackend::Sdpa),
            "flex_attention" | "flex" => Ok(AttentionBackend::FlexAttention),
            other => Err(Error::Config(format!("unknown attention backend {other}"))),
        }
    }
}

impl fmt::Display for AttentionBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttentionBackend::Sdpa => f.write_str("sdpa"),
            AttentionBackend::FlexAttention => f.write_str("flex_attention"),
        }
    }
}

/// Per-step keys and values, already expanded to all query heads.
#[derive(Debug, Clone, Default)]
pub struct TttCache {
    keys: Vec<Tensor>,
    values: Vec<Tensor>,
}

impl TttCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of steps cached so far.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn push(&mut self, k: Tensor, v: Tensor) {
        self.keys.push(k);
        self.values.push(v);
    }
}

/// Masks derived from one batch's padding, shared by every TTT step.
#[derive(Debug, Clone)]
pub struct AttentionMask {
    /// Causal + padding additive mask [batch, 1, seq_len, seq_len] (f32).
    causal: Tensor,
    /// Real tokens per row.
    lengths: Vec<usize>,
    seq_len: usize,
}

impl AttentionMask {
    /// Builds the mask from a [batch, seq_len] 0/1 attention mask.
    pub fn from_attention_mask(attention_mask: &Tensor) -> Result<Self> {
        let (_, seq_len) = attention_mask.dims2()?;
        let lengths: Vec<usize> = attention_mask
            .to_dtype(DType::U32)?
            .sum(1)?
            .to_vec1::<u32>()?
            .into_iter()
            .map(|l| l as usize)
            .collect();
        let causal = eagle3_block_mask(&lengths, seq_len, seq_len, attention_mask.device())?;
        Ok(Self {
            causal,
            lengths,
            seq_len,
        })
    }

    /// Mask for sequences without padding.
    pub fn full(batch: usize, seq_len: usize, device: &Device) -> Result<Self> {
        let lengths = vec![seq_len; batch];
        let causal = eagle3_block_mask(&lengths, seq_len, seq_len, device)?;
        Ok(Self {
            causal,
            lengths,
            seq_len,
        })
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    /// The causal + padding block [batch, 1, seq_len, seq_len].
    pub fn causal(&self) -> &Tensor {
        &self.causal
    }
}

/// EAGLE3 block mask [batch, 1, q_len, kv_len] as an additive f32 tensor.
///
/// ```text
/// kv <  q_len:  visible iff q >= kv and kv < lengths[b]
/// kv >= q_len:  visible iff kv % q_len == q
/// ```
pub fn eagle3_block_mask(
    lengths: &[usize],
    q_len: usize,
    kv_len: usize,
    device: &Device,
) -> Result<Tensor> {
    let batch = lengths.len();
    let mut mask = Vec::with_capacity(batch * q_len * kv_len);
    for &len in lengths {
        for q in 0..q_len {
            for kv in 0..kv_len {
                let visible = if kv < q_len {
                    q >= kv && kv < len
                } else {
                    kv % q_len == q
                };
                mask.push(if visible { 0.0f32 } else { MASK_VALUE });
            }
        }
    }
    Tensor::from_vec(mask, (batch, 1, q_len, kv_len), device)
}

/// Attention of the EAGLE3 draft layer.
///
/// Projections read the concatenation `[input_emb ; hidden]` (2 × hidden).
#[derive(Debug, Clone)]
pub struct Eagle3Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    q_norm: RmsNorm,
    k_norm: RmsNorm,
    rotary_emb: RotaryEmbedding,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    scale: f64,
    backend: AttentionBackend,
}

impl Eagle3Attention {
    pub fn new(
        config: &Eagle3DraftConfig,
        backend: AttentionBackend,
        vb: VarBuilder,
    ) -> Result<Self> {
        let in_features = config.hidden_size * 2;
        let num_heads = config.num_attention_heads;
        let num_kv_heads = config.num_key_value_heads;
        let head_dim = config.head_dim();

        let q_proj = linear_no_bias(in_features, num_heads * head_dim, vb.pp("q_proj"))?;
        let k_proj = linear_no_bias(in_features, num_kv_heads * head_dim, vb.pp("k_proj"))?;
        let v_proj = linear_no_bias(in_features, num_kv_heads * head_dim, vb.pp("v_proj"))?;
        let o_proj = linear_no_bias(num_heads * head_dim, config.hidden_size, vb.pp("o_proj"))?;

        let q_norm = RmsNorm::load(head_dim, config.rms_norm_eps, vb.pp("q_norm"))?;
        let k_norm = RmsNorm::load(head_dim, config.rms_norm_eps, vb.pp("k_norm"))?;

        let rotary_emb = RotaryEmbedding::new(
            head_dim,
            config.max_position_embeddings,
            config.rope_theta,
            vb.dtype(),
            vb.device(),
        )?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            q_norm,
            k_norm,
            rotary_emb,
            num_heads,
            num_kv_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
            backend,
        })
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Forward pass for one TTT step.
    ///
    /// # Arguments
    ///
    /// * `hidden_states` - `[batch, seq_len, 2 * hidden]`
    /// * `mask` - padding/causal mask of the batch
    /// * `cache` - TTT cache; `None` runs plain causal attention at position 0
    ///
    /// # Returns
    ///
    /// `[batch, seq_len, hidden]`
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        mask: &AttentionMask,
        cache: Option<&mut TttCache>,
    ) -> Result<Tensor> {
        let (batch, seq_len, _) = hidden_states.dims3()?;
        if seq_len != mask.seq_len {
            candle_core::bail!(
                "attention mask covers {} positions, input has {seq_len}",
                mask.seq_len
            );
        }

        let q = self.q_proj.forward(hidden_states)?;
        let k = self.k_proj.forward(hidden_states)?;
        let v = self.v_proj.forward(hidden_states)?;

        let q = q.reshape((batch, seq_len, self.num_heads, self.head_dim))?;
        let k = k.reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?;
        let v = v.reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?;

        // Qwen3 head-wise norm before RoPE.
        let q = self.q_norm.forward(&q)?;
        let k = self.k_norm.forward(&k)?;

        let step = cache.as_ref().map_or(0, |c| c.len());
        let (q, k) = self.rotary_emb.apply(&q, &k, step)?;

        let n_rep = self.num_heads / self.num_kv_heads;
        let q = q.transpose(1, 2)?.contiguous()?;
        let k = repeat_kv(&k.transpose(1, 2)?.contiguous()?, n_rep)?;
        let v = repeat_kv(&v.transpose(1, 2)?.contiguous()?, n_rep)?;

        let out = match cache {
            None => self.causal_attention(&q, &k, &v, mask)?,
            Some(cache) => {
                cache.push(k, v);
                match self.backend {
                    AttentionBackend::Sdpa => self.sdpa_ttt(&q, cache, mask)?,
                    AttentionBackend::FlexAttention => self.block_masked_ttt(&q, cache, mask)?,
                }
            }
        };

        // [batch, heads, seq, head_dim] -> [batch, seq, heads * head_dim]
        let out = out
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&out)
    }

    fn scores(&self, q: &Tensor, k: &Tensor) -> Result<Tensor> {
        let kt = k.transpose(D::Minus2, D::Minus1)?.contiguous()?;
        (q.matmul(&kt)? * self.scale)?.to_dtype(DType::F32)
    }

    fn causal_attention(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: &AttentionMask,
    ) -> Result<Tensor> {
        let scores = self.scores(q, k)?.broadcast_add(mask.causal())?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?.to_dtype(v.dtype())?;
        probs.matmul(v)
    }

    /// Causal block against step-0 keys plus one diagonal column per later step.
    fn sdpa_ttt(&self, q: &Tensor, cache: &TttCache, mask: &AttentionMask) -> Result<Tensor> {
        let seq_len = mask.seq_len;
        let mut columns = vec![self.scores(q, &cache.keys[0])?.broadcast_add(mask.causal())?];
        for ki in &cache.keys[1..] {
            // [batch, heads, seq] -> [batch, heads, seq, 1]
            let diag = ((q * ki)?.sum(D::Minus1)? * self.scale)?
                .to_dtype(DType::F32)?
                .unsqueeze(D::Minus1)?;
            columns.push(diag);
        }
        let scores = Tensor::cat(&columns, D::Minus1)?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?.to_dtype(q.dtype())?;

        let mut out = probs
            .narrow(D::Minus1, 0, seq_len)?
            .contiguous()?
            .matmul(&cache.values[0])?;
        for (i, vi) in cache.values.iter().enumerate().skip(1) {
            let w = probs.narrow(D::Minus1, seq_len + i - 1, 1)?;
            out = (out + vi.broadcast_mul(&w)?)?;
        }
        Ok(out)
    }

    /// All cached keys concatenated along the sequence, EAGLE3 block mask.
    fn block_masked_ttt(
        &self,
        q: &Tensor,
        cache: &TttCache,
        mask: &AttentionMask,
    ) -> Result<Tensor> {
        let seq_len = mask.seq_len;
        let kv_len = seq_len * cache.len();
        let keys = Tensor::cat(&cache.keys, 2)?;
        let values = Tensor::cat(&cache.values, 2)?;

        let block_mask = if cache.len() == 1 {
            mask.causal().clone()
        } else {
            eagle3_block_mask(mask.lengths(), seq_len, kv_len, q.device())?
        };
        let scores = self.scores(q, &keys)?.broadcast_add(&block_mask)?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?.to_dtype(values.dtype())?;
        probs.matmul(&values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parse_and_display() {
        assert_eq!("sdpa".parse::<AttentionBackend>().unwrap(), AttentionBackend::Sdpa);
        assert_eq!(
            "flex_attention".parse::<AttentionBackend>().unwrap(),
            AttentionBackend::FlexAttention
        );
        assert!("fa3".parse::<AttentionBackend>().is_err());
        assert_eq!(AttentionBackend::FlexAttention.to_string(), "flex_attention");
    }

    #[test]
    fn test_block_mask_single_block_is_causal_with_padding() {
        let mask = eagle3_block_mask(&[2], 3, 3, &Device::Cpu).unwrap();
        let m = mask.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2::<f32>().unwrap();
        let visible: Vec<Vec<bool>> = m
            .iter()
            .map(|row| row.iter().map(|&v| v == 0.0).collect())
            .collect();
        assert_eq!(
            visible,
            vec![
                vec![true, false, false],
                vec![true, true, false],
                // kv 2 is padding
                vec![true, true, false],
            ]
        );
    }

    #[test]
    fn test_block_mask_later_blocks_are_diagonal() {
        let mask = eagle3_block_mask(&[3], 3, 9, &Device::Cpu).unwrap();
        let m = mask.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2::<f32>().unwrap();
        for (q, row) in m.iter().enumerate() {
            for (kv, &v) in row.iter().enumerate().skip(3) {
                assert_eq!(v == 0.0, kv % 3 == q, "q={q} kv={kv}");
            }
        }
    }

    #[test]
    fn test_attention_mask_lengths() {
        let am = Tensor::new(&[[1u8, 1, 1, 0], [1, 1, 0, 0]], &Device::Cpu).unwrap();
        let mask = AttentionMask::from_attention_mask(&am).unwrap();
        assert_eq!(mask.lengths(), &[3, 2]);
        assert_eq!(mask.causal().dims(), &[2, 1, 4, 4]);
    }
}
