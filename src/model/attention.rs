//! Qwen3 Attention implementation.
//!
//! Grouped Query Attention (GQA) with:
//! - Per-head RMSNorm on Q and K (Qwen3 specific)
//! - Rotary Position Embeddings (RoPE)
//! - Causal masking over full sequences (training-time prefill only)

use candle_core::{D, DType, Device, Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder, linear_no_bias};

use super::loader::Qwen3Config;
use super::norm::RmsNorm;
use super::rope::RotaryEmbedding;

/// Value added to masked attention scores.
///
/// Finite so that a fully masked row softmaxes to a uniform row instead of NaN.
pub const MASK_VALUE: f32 = -1e9;

/// Repeats KV heads to match the number of query heads.
///
/// `[batch, num_kv_heads, seq, head_dim] -> [batch, num_kv_heads * n_rep, seq, head_dim]`
pub fn repeat_kv(x: &Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x.clone());
    }
    let (batch, num_kv_heads, seq_len, head_dim) = x.dims4()?;
    x.unsqueeze(2)?
        .expand((batch, num_kv_heads, n_rep, seq_len, head_dim))?
        .reshape((batch, num_kv_heads * n_rep, seq_len, head_dim))
}

/// Additive causal mask `[1, 1, seq_len, seq_len]` in f32.
pub fn causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|q| (0..seq_len).map(move |k| if k > q { MASK_VALUE } else { 0.0 }))
        .collect();
    Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)
}

/// Qwen3 Attention with Grouped Query Attention (GQA).
#[derive(Debug, Clone)]
pub struct Qwen3Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    /// Per-head Q normalization.
    q_norm: RmsNorm,
    /// Per-head K normalization.
    k_norm: RmsNorm,
    rotary_emb: RotaryEmbedding,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    /// 1 / sqrt(head_dim).
    scale: f64,
}

impl Qwen3Attention {
    /// Creates a new Qwen3Attention from a VarBuilder.
    ///
    /// `rotary_emb` is shared by all layers; cloning it shares the tables.
    pub fn new(config: &Qwen3Config, rotary_emb: &RotaryEmbedding, vb: VarBuilder) -> Result<Self> {
        let hidden_size = config.hidden_size;
        let num_heads = config.num_attention_heads;
        let num_kv_heads = config.num_key_value_heads;
        let head_dim = config.head_dim;

        let q_proj = linear_no_bias(hidden_size, num_heads * head_dim, vb.pp("q_proj"))?;
        let k_proj = linear_no_bias(hidden_size, num_kv_heads * head_dim, vb.pp("k_proj"))?;
        let v_proj = linear_no_bias(hidden_size, num_kv_heads * head_dim, vb.pp("v_proj"))?;
        let o_proj = linear_no_bias(num_heads * head_dim, hidden_size, vb.pp("o_proj"))?;

        let q_norm = RmsNorm::load(head_dim, config.rms_norm_eps, vb.pp("q_norm"))?;
        let k_norm = RmsNorm::load(head_dim, config.rms_norm_eps, vb.pp("k_norm"))?;

        if rotary_emb.dim() != head_dim {
            candle_core::bail!(
                "RoPE table has dim {}, attention expects head_dim {head_dim}",
                rotary_emb.dim()
            );
        }

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            q_norm,
            k_norm,
            rotary_emb: rotary_emb.clone(),
            num_heads,
            num_kv_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    /// Returns the number of query heads.
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Returns the number of KV heads.
    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    /// Returns the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn rotary_emb(&self) -> &RotaryEmbedding {
        &self.rotary_emb
    }

    /// Forward pass over full sequences.
    ///
    /// # Arguments
    ///
    /// * `hidden_states` - Input tensor [batch, seq_len, hidden_size]
    /// * `mask` - Additive mask broadcastable to [batch, heads, seq_len, seq_len]
    ///
    /// # Returns
    ///
    /// Output tensor [batch, seq_len, hidden_size]
    pub fn forward(&self, hidden_states: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, _) = hidden_states.dims3()?;

        let q = self.q_proj.forward(hidden_states)?;
        let k = self.k_proj.forward(hidden_states)?;
        let v = self.v_proj.forward(hidden_states)?;

        // [batch, seq_len, heads, head_dim]
        let q = q.reshape((batch_size, seq_len, self.num_heads, self.head_dim))?;
        let k = k.reshape((batch_size, seq_len, self.num_kv_heads, self.head_dim))?;
        let v = v.reshape((batch_size, seq_len, self.num_kv_heads, self.head_dim))?;

        let q = self.q_norm.forward(&q)?;
        let k = self.k_norm.forward(&k)?;
        let (q, k) = self.rotary_emb.apply(&q, &k, 0)?;

        // [batch, heads, seq_len, head_dim]
        let n_rep = self.num_heads / self.num_kv_heads;
        let q = q.transpose(1, 2)?.contiguous()?;
        let k = repeat_kv(&k.transpose(1, 2)?.contiguous()?, n_rep)?;
        let v = repeat_kv(&v.transpose(1, 2)?.contiguous()?, n_rep)?;

        let scores = (q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)? * self.scale)?;
        let scores = scores
            .to_dtype(DType::F32)?
            .broadcast_add(mask)?;
        let probs = candle_nn::ops::softmax_last_dim(&scores)?.to_dtype(v.dtype())?;

        let out = probs.matmul(&v)?;
        let out = out
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch_size, seq_len, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&out)
    }
}
