//! EAGLE3 draft model (Qwen3 flavour).
//!
//! ## Architecture
//!
//! ```text
//! aux hidden [B,S,3*Ht]        input ids [B,S]
//!       │                            │
//!       ▼                            ▼
//! ┌───────────┐              ┌──────────────┐
//! │    fc     │ 3*Ht → H     │ embed_tokens │ frozen, from target
//! └───────────┘              └──────────────┘
//!       │ hidden_norm                │ input_layernorm
//!       └──────────► concat ◄────────┘
//!                      │ [B,S,2H]
//!                      ▼
//!               ┌─────────────┐
//!               │  attention  │ + residual(hidden)
//!               │     MLP     │ + residual
//!               └─────────────┘
//!                      │ ──► next TTT step's hidden
//!                      ▼
//!               norm → lm_head   H → draft_vocab
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::MutexGuard;

use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{Embedding, Linear, VarBuilder, VarMap, embedding, linear_no_bias};
use tracing::{debug, info};

use super::attention::{AttentionBackend, AttentionMask, Eagle3Attention, TttCache};
use super::config::Eagle3DraftConfig;
use super::vocab::VocabMapping;
use crate::error::{Error, Result};
use crate::model::{Qwen3Mlp, RmsNorm};

/// Name of the frozen embedding in the checkpoint.
pub const EMBED_TOKENS_KEY: &str = "embed_tokens.weight";
pub const T2D_KEY: &str = "t2d";
pub const D2T_KEY: &str = "d2t";

/// The single decoder layer of the draft model.
#[derive(Debug, Clone)]
pub struct Eagle3DecoderLayer {
    self_attn: Eagle3Attention,
    mlp: Qwen3Mlp,
    hidden_norm: RmsNorm,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl Eagle3DecoderLayer {
    pub fn new(
        config: &Eagle3DraftConfig,
        backend: AttentionBackend,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let h = config.hidden_size;
        let eps = config.rms_norm_eps;
        Ok(Self {
            self_attn: Eagle3Attention::new(config, backend, vb.pp("self_attn"))?,
            mlp: Qwen3Mlp::new(h, config.intermediate_size, vb.pp("mlp"))?,
            hidden_norm: RmsNorm::load(h, eps, vb.pp("hidden_norm"))?,
            input_layernorm: RmsNorm::load(h, eps, vb.pp("input_layernorm"))?,
            post_attention_layernorm: RmsNorm::load(h, eps, vb.pp("post_attention_layernorm"))?,
        })
    }

    /// One layer pass; the residual stream is the un-normalized `hidden_states`.
    pub fn forward(
        &self,
        input_emb: &Tensor,
        hidden_states: &Tensor,
        mask: &AttentionMask,
        cache: Option<&mut TttCache>,
    ) -> candle_core::Result<Tensor> {
        let residual = hidden_states;
        let hidden = self.hidden_norm.forward(hidden_states)?;
        let emb = self.input_layernorm.forward(input_emb)?;
        let x = Tensor::cat(&[&emb, &hidden], candle_core::D::Minus1)?;

        let x = (residual + self.self_attn.forward(&x, mask, cache)?)?;
        let residual = &x;
        let h = self.post_attention_layernorm.forward(&x)?;
        residual + self.mlp.forward(&h)?
    }
}

/// Trainable EAGLE3 draft model backed by a [`VarMap`].
pub struct Eagle3DraftModel {
    config: Eagle3DraftConfig,
    varmap: VarMap,
    embed_tokens: Embedding,
    fc: Linear,
    midlayer: Eagle3DecoderLayer,
    norm: RmsNorm,
    lm_head: Linear,
    /// Target-id membership in the draft vocabulary [vocab_size] (u8).
    t2d: Tensor,
    /// Draft-id to target-id offsets [draft_vocab_size] (i64).
    d2t: Tensor,
    device: Device,
    dtype: DType,
}

impl Eagle3DraftModel {
    /// Creates a randomly initialized draft model.
    pub fn new(
        config: Eagle3DraftConfig,
        backend: AttentionBackend,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);

        let h = config.hidden_size;
        let embed_tokens = embedding(config.vocab_size, h, vb.pp("embed_tokens"))?;
        let fc = linear_no_bias(config.target_hidden_size() * 3, h, vb.pp("fc"))?;
        let midlayer = Eagle3DecoderLayer::new(&config, backend, vb.pp("midlayer"))?;
        let norm = RmsNorm::load(h, config.rms_norm_eps, vb.pp("norm"))?;
        let lm_head = linear_no_bias(h, config.draft_vocab_size, vb.pp("lm_head"))?;

        let t2d = Tensor::zeros(config.vocab_size, DType::U8, device)?;
        let d2t = Tensor::zeros(config.draft_vocab_size, DType::I64, device)?;

        debug!(
            hidden = h,
            draft_vocab = config.draft_vocab_size,
            %backend,
            "built draft model"
        );
        Ok(Self {
            config,
            varmap,
            embed_tokens,
            fc,
            midlayer,
            norm,
            lm_head,
            t2d,
            d2t,
            device: device.clone(),
            dtype,
        })
    }

    /// Overwrites the embedding with the target's `[vocab_size, hidden]` table.
    pub fn set_embedding(&mut self, weight: &Tensor) -> Result<()> {
        let expected = [self.config.vocab_size, self.config.hidden_size];
        if weight.dims() != expected {
            return Err(Error::Config(format!(
                "embedding has shape {:?}, draft expects {expected:?}",
                weight.dims()
            )));
        }
        let weight = weight.to_dtype(self.dtype)?.to_device(&self.device)?;
        self.varmap.set_one(EMBED_TOKENS_KEY, &weight)?;
        Ok(())
    }

    /// Installs the draft vocabulary buffers.
    pub fn set_vocab_mapping(&mut self, mapping: &VocabMapping) -> Result<()> {
        if mapping.vocab_size() != self.config.vocab_size
            || mapping.draft_vocab_size() != self.config.draft_vocab_size
        {
            return Err(Error::Config(format!(
                "vocab mapping is {}→{}, draft expects {}→{}",
                mapping.vocab_size(),
                mapping.draft_vocab_size(),
                self.config.vocab_size,
                self.config.draft_vocab_size
            )));
        }
        let (t2d, d2t) = mapping.tensors(&self.device)?;
        self.t2d = t2d;
        self.d2t = d2t;
        Ok(())
    }

    /// Token embeddings [batch, seq, hidden], detached: the table is frozen.
    pub fn embed_input_ids(&self, input_ids: &Tensor) -> Result<Tensor> {
        Ok(self.embed_tokens.forward(input_ids)?.detach())
    }

    /// Fuses the target's aux hidden states [batch, seq, 3*target_hidden].
    pub fn project_hidden_states(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let expected = self.config.target_hidden_size() * 3;
        let got = hidden_states.dim(candle_core::D::Minus1)?;
        if got != expected {
            return Err(Error::Config(format!(
                "aux hidden states have width {got}, expected {expected}"
            )));
        }
        Ok(self.fc.forward(&hidden_states.to_dtype(self.dtype)?)?)
    }

    /// One decoder pass; output is the pre-norm hidden state.
    pub fn backbone(
        &self,
        input_emb: &Tensor,
        hidden_states: &Tensor,
        mask: &AttentionMask,
        cache: Option<&mut TttCache>,
    ) -> Result<Tensor> {
        Ok(self.midlayer.forward(input_emb, hidden_states, mask, cache)?)
    }

    /// Draft-vocabulary logits [batch, seq, draft_vocab_size].
    pub fn compute_logits(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let h = self.norm.forward(hidden_states)?;
        Ok(self.lm_head.forward(&h)?)
    }

    /// Single-step pass: fc, backbone, final norm.
    pub fn forward(
        &self,
        aux_hidden_states: &Tensor,
        input_emb: &Tensor,
        mask: &AttentionMask,
    ) -> Result<Tensor> {
        let hidden = self.project_hidden_states(aux_hidden_states)?;
        let hidden = self.backbone(input_emb, &hidden, mask, None)?;
        Ok(self.norm.forward(&hidden)?)
    }

    /// Maps draft token ids to target token ids (`id + d2t[id]`).
    pub fn draft_to_target(&self, draft_ids: &Tensor) -> Result<Tensor> {
        let offsets = self
            .d2t
            .index_select(&draft_ids.flatten_all()?, 0)?
            .reshape(draft_ids.shape())?;
        let target = (draft_ids.to_dtype(DType::I64)? + offsets)?;
        Ok(target.to_dtype(DType::U32)?)
    }

    /// Every variable except the frozen embedding, sorted by name.
    pub fn trainable_vars(&self) -> Result<Vec<Var>> {
        let data = self.lock_vars()?;
        let mut named: Vec<(&String, &Var)> = data
            .iter()
            .filter(|(name, _)| name.as_str() != EMBED_TOKENS_KEY)
            .collect();
        named.sort_by(|a, b| a.0.cmp(b.0));
        Ok(named.into_iter().map(|(_, v)| v.clone()).collect())
    }

    /// Names of all stored variables, sorted.
    pub fn var_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.lock_vars()?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn lock_vars(&self) -> Result<MutexGuard<'_, HashMap<String, Var>>> {
        self.varmap
            .data()
            .lock()
            .map_err(|_| Error::ModelLoad("draft variable map is poisoned".into()))
    }

    /// Writes `model.safetensors` and `config.json` into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let mut tensors: HashMap<String, Tensor> = {
            let data = self.lock_vars()?;
            data.iter()
                .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
                .collect()
        };
        tensors.insert(T2D_KEY.to_string(), self.t2d.clone());
        tensors.insert(D2T_KEY.to_string(), self.d2t.clone());

        let weights = dir.join("model.safetensors");
        candle_core::safetensors::save(&tensors, &weights)?;
        self.config.save(&dir.join("config.json"))?;
        info!(path = %weights.display(), tensors = tensors.len(), "saved draft model");
        Ok(())
    }

    /// Restores variables and vocabulary buffers from a saved `model.safetensors`.
    pub fn load_weights(&mut self, path: &Path) -> Result<()> {
        let mut tensors = candle_core::safetensors::load(path, &self.device)?;
        {
            let data = self.lock_vars()?;
            for (name, var) in data.iter() {
                let tensor = tensors.remove(name).ok_or_else(|| {
                    Error::ModelLoad(format!("{} is missing '{name}'", path.display()))
                })?;
                var.set(&tensor.to_dtype(self.dtype)?)?;
            }
        }
        if let Some(t2d) = tensors.remove(T2D_KEY) {
            self.t2d = t2d.to_dtype(DType::U8)?;
        }
        if let Some(d2t) = tensors.remove(D2T_KEY) {
            self.d2t = d2t.to_dtype(DType::I64)?;
        }
        info!(path = %path.display(), "loaded draft weights");
        Ok(())
    }

    pub fn config(&self) -> &Eagle3DraftConfig {
        &self.config
    }

    pub fn t2d(&self) -> &Tensor {
        &self.t2d
    }

    pub fn d2t(&self) -> &Tensor {
        &self.d2t
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }
}
