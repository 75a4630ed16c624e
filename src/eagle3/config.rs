//! EAGLE3 draft model configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::Qwen3Config;

/// Draft model configuration, read from the `--draft-model-config` JSON.
///
/// Qwen3 architecture fields plus the reduced draft vocabulary and the
/// target hidden size that sizes the `fc` fusion layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Eagle3DraftConfig {
    /// Target vocabulary size (embedding rows).
    pub vocab_size: usize,
    /// Draft vocabulary size (LM head rows).
    pub draft_vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    /// Defaults to `hidden_size / num_attention_heads`.
    #[serde(default)]
    pub head_dim: Option<usize>,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    /// Hidden size of the target model when it differs from the draft.
    #[serde(default)]
    pub target_hidden_size: Option<usize>,
    #[serde(default)]
    pub pad_token_id: Option<u32>,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    /// Always 1: the draft has a single decoder layer.
    #[serde(default = "default_num_hidden_layers")]
    pub num_hidden_layers: usize,
    #[serde(default = "default_architectures")]
    pub architectures: Vec<String>,
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f64 {
    1000000.0
}

fn default_max_position_embeddings() -> usize {
    40960
}

fn default_hidden_act() -> String {
    "silu".to_string()
}

fn default_num_hidden_layers() -> usize {
    1
}

fn default_architectures() -> Vec<String> {
    vec!["Qwen3ForCausalLMEagle3".to_string()]
}

impl Eagle3DraftConfig {
    /// Reads and validates a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read draft config {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the config as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Derives a draft config from the target: same widths, one layer.
    pub fn from_target(target: &Qwen3Config, draft_vocab_size: usize) -> Self {
        Self {
            vocab_size: target.vocab_size,
            draft_vocab_size,
            hidden_size: target.hidden_size,
            intermediate_size: target.intermediate_size,
            num_attention_heads: target.num_attention_heads,
            num_key_value_heads: target.num_key_value_heads,
            head_dim: Some(target.head_dim),
            rms_norm_eps: target.rms_norm_eps,
            rope_theta: target.rope_theta,
            max_position_embeddings: target.max_position_embeddings,
            target_hidden_size: Some(target.hidden_size),
            pad_token_id: None,
            hidden_act: default_hidden_act(),
            num_hidden_layers: 1,
            architectures: default_architectures(),
        }
    }

    /// Checks internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.hidden_act != "silu" {
            return Err(Error::Config(format!(
                "unsupported hidden_act '{}' (only silu)",
                self.hidden_act
            )));
        }
        if self.num_hidden_layers != 1 {
            return Err(Error::Config(format!(
                "EAGLE3 drafts have exactly one layer, got {}",
                self.num_hidden_layers
            )));
        }
        if self.num_key_value_heads == 0
            || !self
                .num_attention_heads
                .is_multiple_of(self.num_key_value_heads)
        {
            return Err(Error::Config(format!(
                "num_attention_heads ({}) must be a multiple of num_key_value_heads ({})",
                self.num_attention_heads, self.num_key_value_heads
            )));
        }
        if self.head_dim.is_none() && !self.hidden_size.is_multiple_of(self.num_attention_heads) {
            return Err(Error::Config(
                "hidden_size must divide by num_attention_heads when head_dim is unset".into(),
            ));
        }
        if !self.head_dim().is_multiple_of(2) {
            return Err(Error::Config("head_dim must be even".into()));
        }
        if self.draft_vocab_size == 0 || self.draft_vocab_size > self.vocab_size {
            return Err(Error::Config(format!(
                "draft_vocab_size ({}) must be in 1..={}",
                self.draft_vocab_size, self.vocab_size
            )));
        }
        Ok(())
    }

    /// Checks that the draft fits the target it will be trained against.
    pub fn check_target(&self, target: &Qwen3Config) -> Result<()> {
        if self.vocab_size != target.vocab_size {
            return Err(Error::Config(format!(
                "draft vocab_size ({}) differs from target ({})",
                self.vocab_size, target.vocab_size
            )));
        }
        if self.target_hidden_size() != target.hidden_size {
            return Err(Error::Config(format!(
                "draft expects target hidden size {}, target has {}",
                self.target_hidden_size(),
                target.hidden_size
            )));
        }
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    pub fn target_hidden_size(&self) -> usize {
        self.target_hidden_size.unwrap_or(self.hidden_size)
    }

    pub fn num_kv_groups(&self) -> usize {
        self.num_attention_heads / self.num_key_value_heads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qwen3_8b_draft_json() -> &'static str {
        r#"{
            "architectures": ["LlamaForCausalLMEagle3"],
            "hidden_size": 4096,
            "intermediate_size": 12288,
            "num_attention_heads": 32,
            "num_key_value_heads": 8,
            "num_hidden_layers": 1,
            "vocab_size": 151936,
            "draft_vocab_size": 32000,
            "max_position_embeddings": 40960,
            "rms_norm_eps": 1e-6,
            "rope_theta": 1000000,
            "hidden_act": "silu"
        }"#
    }

    #[test]
    fn test_parse_qwen3_8b_draft() {
        let config: Eagle3DraftConfig = serde_json::from_str(qwen3_8b_draft_json()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.head_dim(), 128);
        assert_eq!(config.target_hidden_size(), 4096);
        assert_eq!(config.num_kv_groups(), 4);
        assert_eq!(config.draft_vocab_size, 32000);
    }

    #[test]
    fn test_draft_vocab_larger_than_vocab_rejected() {
        let mut config: Eagle3DraftConfig = serde_json::from_str(qwen3_8b_draft_json()).unwrap();
        config.draft_vocab_size = config.vocab_size + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_multi_layer_rejected() {
        let mut config: Eagle3DraftConfig = serde_json::from_str(qwen3_8b_draft_json()).unwrap();
        config.num_hidden_layers = 2;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_from_target_matches_target() {
        let target: Qwen3Config = serde_json::from_value(serde_json::json!({
            "vocab_size": 1000,
            "hidden_size": 64,
            "intermediate_size": 128,
            "num_hidden_layers": 4,
            "num_attention_heads": 4,
            "num_key_value_heads": 2,
            "head_dim": 16
        }))
        .unwrap();

        let draft = Eagle3DraftConfig::from_target(&target, 100);
        draft.validate().unwrap();
        draft.check_target(&target).unwrap();
        assert_eq!(draft.head_dim(), 16);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config: Eagle3DraftConfig = serde_json::from_str(qwen3_8b_draft_json()).unwrap();

        config.save(&path).unwrap();
        assert_eq!(Eagle3DraftConfig::from_file(&path).unwrap(), config);
    }
}
