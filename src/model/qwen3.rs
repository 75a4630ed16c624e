//! Qwen3 Model implementation.
//!
//! The frozen target model used during draft training. Besides logits it can
//! return the outputs of selected intermediate layers, which EAGLE3 fuses
//! into the draft model's input features.
//!
//! ## Architecture
//!
//! ```text
//! Input Token IDs
//!       │
//!       ▼
//! ┌───────────────┐
//! │  Embedding    │  vocab_size → hidden_size
//! └───────────────┘
//!       │
//!       ▼
//! ┌───────────────┐
//! │ DecoderLayer  │ × num_hidden_layers ──► aux hidden states (selected layers)
//! └───────────────┘
//!       │
//!       ▼
//! ┌───────────────┐
//! │   RMSNorm     │
//! └───────────────┘
//!       │
//!       ▼
//! ┌───────────────┐
//! │   LM Head     │  hidden_size → vocab_size
//! └───────────────┘
//! ```

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{Embedding, Linear, VarBuilder, embedding, linear_no_bias};

use super::attention::causal_mask;
use super::decoder::Qwen3DecoderLayer;
use super::loader::Qwen3Config;
use super::norm::RmsNorm;
use super::rope::RotaryEmbedding;

/// Target layers whose outputs feed the EAGLE3 draft model: one low, one
/// middle and one high layer, `[1, n/2 - 1, n - 4]`, clamped to valid
/// indices for shallow models.
pub fn eagle3_aux_layers(num_layers: usize) -> [usize; 3] {
    let last = num_layers.saturating_sub(1);
    [
        1.min(last),
        (num_layers / 2).saturating_sub(1).min(last),
        num_layers.saturating_sub(4).min(last),
    ]
}

/// Qwen3 transformer model.
#[derive(Debug, Clone)]
pub struct Qwen3Model {
    embed_tokens: Embedding,
    layers: Vec<Qwen3DecoderLayer>,
    norm: RmsNorm,
    device: Device,
    dtype: DType,
}

impl Qwen3Model {
    /// Creates a new Qwen3Model from a VarBuilder rooted at the checkpoint.
    pub fn new(config: &Qwen3Config, vb: VarBuilder) -> Result<Self> {
        let embed_tokens = embedding(
            config.vocab_size,
            config.hidden_size,
            vb.pp("model.embed_tokens"),
        )?;

        // One cos/sin table for every layer.
        let rotary_emb = RotaryEmbedding::new(
            config.head_dim,
            config.max_position_embeddings,
            config.rope_theta,
            vb.dtype(),
            vb.device(),
        )?;
        let layers = (0..config.num_hidden_layers)
            .map(|i| Qwen3DecoderLayer::new(config, &rotary_emb, vb.pp(format!("model.layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;

        let norm = RmsNorm::load(config.hidden_size, config.rms_norm_eps, vb.pp("model.norm"))?;

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    /// Forward pass through the transformer (without LM head).
    ///
    /// # Arguments
    ///
    /// * `input_ids` - Token IDs [batch, seq_len]
    /// * `capture` - Layer indices whose outputs are returned
    ///
    /// # Returns
    ///
    /// Final normalized hidden states [batch, seq_len, hidden_size] and the
    /// captured layer outputs in `capture` order.
    pub fn forward_with_hidden(
        &self,
        input_ids: &Tensor,
        capture: &[usize],
    ) -> Result<(Tensor, Vec<Tensor>)> {
        let (_, seq_len) = input_ids.dims2()?;
        let mask = causal_mask(seq_len, &self.device)?;

        let mut hidden_states = self.embed_tokens.forward(input_ids)?;
        let mut captured: Vec<Option<Tensor>> = vec![None; capture.len()];
        for (i, layer) in self.layers.iter().enumerate() {
            hidden_states = layer.forward(&hidden_states, &mask)?;
            for (slot, &layer_idx) in captured.iter_mut().zip(capture) {
                if layer_idx == i {
                    *slot = Some(hidden_states.clone());
                }
            }
        }

        let captured = captured
            .into_iter()
            .zip(capture)
            .map(|(t, idx)| {
                t.ok_or_else(|| candle_core::Error::Msg(format!("layer {idx} out of range")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((self.norm.forward(&hidden_states)?, captured))
    }

    /// Forward pass returning final normalized hidden states.
    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        Ok(self.forward_with_hidden(input_ids, &[])?.0)
    }

    /// Returns the device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Returns the data type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Returns the number of layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layers(&self) -> &[Qwen3DecoderLayer] {
        &self.layers
    }

    /// Returns the embedding layer.
    pub fn embed_tokens(&self) -> &Embedding {
        &self.embed_tokens
    }
}

/// Qwen3 model for causal language modeling.
#[derive(Debug, Clone)]
pub struct Qwen3ForCausalLM {
    model: Qwen3Model,
    lm_head: Linear,
}

impl Qwen3ForCausalLM {
    /// Creates a new Qwen3ForCausalLM from a VarBuilder.
    pub fn new(config: &Qwen3Config, vb: VarBuilder) -> Result<Self> {
        let model = Qwen3Model::new(config, vb.clone())?;

        let lm_head = if config.tie_word_embeddings {
            Linear::new(model.embed_tokens.embeddings().clone(), None)
        } else {
            linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("lm_head"))?
        };

        Ok(Self { model, lm_head })
    }

    /// Logits for all positions [batch, seq_len, vocab_size].
    pub fn forward_all(&self, input_ids: &Tensor) -> Result<Tensor> {
        let hidden_states = self.model.forward(input_ids)?;
        self.lm_head.forward(&hidden_states)
    }

    /// Logits plus EAGLE3 auxiliary hidden states.
    ///
    /// # Returns
    ///
    /// `(logits [batch, seq_len, vocab], aux [batch, seq_len, 3 * hidden])`,
    /// both detached from any autograd graph.
    pub fn forward_with_aux(&self, input_ids: &Tensor) -> Result<(Tensor, Tensor)> {
        let layers = eagle3_aux_layers(self.model.num_layers());
        let (hidden_states, aux) = self.model.forward_with_hidden(input_ids, &layers)?;
        let logits = self.lm_head.forward(&hidden_states)?;
        let aux = Tensor::cat(&aux, candle_core::D::Minus1)?;
        Ok((logits.detach(), aux.detach()))
    }

    /// Returns reference to the base model.
    pub fn model(&self) -> &Qwen3Model {
        &self.model
    }

    /// Returns the device.
    pub fn device(&self) -> &Device {
        self.model.device()
    }

    /// Returns the data type.
    pub fn dtype(&self) -> DType {
        self.model.dtype()
    }
}
