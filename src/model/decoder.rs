//! Qwen3 Decoder Layer implementation.
//!
//! Pre-norm transformer block: self-attention and MLP, each wrapped in a
//! residual connection.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use super::attention::Qwen3Attention;
use super::loader::Qwen3Config;
use super::mlp::Qwen3Mlp;
use super::norm::RmsNorm;
use super::rope::RotaryEmbedding;

/// Qwen3 Decoder Layer.
///
/// ```text
/// x ──► input_layernorm ──► self_attn ──► (+x) ──► post_attention_layernorm ──► mlp ──► (+) ──► out
/// ```
#[derive(Debug, Clone)]
pub struct Qwen3DecoderLayer {
    input_layernorm: RmsNorm,
    self_attn: Qwen3Attention,
    post_attention_layernorm: RmsNorm,
    mlp: Qwen3Mlp,
}

impl Qwen3DecoderLayer {
    /// Creates a new Qwen3DecoderLayer from a VarBuilder.
    pub fn new(config: &Qwen3Config, rotary_emb: &RotaryEmbedding, vb: VarBuilder) -> Result<Self> {
        let input_layernorm =
            RmsNorm::load(config.hidden_size, config.rms_norm_eps, vb.pp("input_layernorm"))?;
        let self_attn = Qwen3Attention::new(config, rotary_emb, vb.pp("self_attn"))?;
        let post_attention_layernorm = RmsNorm::load(
            config.hidden_size,
            config.rms_norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;
        let mlp = Qwen3Mlp::new(config.hidden_size, config.intermediate_size, vb.pp("mlp"))?;

        Ok(Self {
            input_layernorm,
            self_attn,
            post_attention_layernorm,
            mlp,
        })
    }

    /// Returns a reference to the attention module.
    pub fn self_attn(&self) -> &Qwen3Attention {
        &self.self_attn
    }

    /// Forward pass: `[batch, seq_len, hidden] -> [batch, seq_len, hidden]`.
    pub fn forward(&self, hidden_states: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let residual = hidden_states;
        let x = self.input_layernorm.forward(hidden_states)?;
        let x = self.self_attn.forward(&x, mask)?;
        let x = (residual + x)?;

        let residual = &x;
        let h = self.post_attention_layernorm.forward(&x)?;
        let h = self.mlp.forward(&h)?;
        residual + h
    }
}
