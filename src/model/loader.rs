//! Model loading utilities.
//!
//! This module provides functions for:
//! - Resolving model files from a local directory or the HuggingFace Hub
//! - Loading SafeTensors weights (whole models or single tensors)
//! - Parsing Qwen3 `config.json`

use std::path::{Path, PathBuf};

use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Paths to model files.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    /// Path to config.json.
    pub config: PathBuf,
    /// Paths to weight files (SafeTensors).
    pub weights: Vec<PathBuf>,
    /// Path to tokenizer.json.
    pub tokenizer: PathBuf,
}

impl ModelFiles {
    /// Uses `path_or_id` as a local model directory if it exists, otherwise
    /// downloads it from the Hub at `revision`.
    pub fn resolve(path_or_id: &str, revision: &str) -> Result<Self> {
        let dir = Path::new(path_or_id);
        if dir.is_dir() {
            Self::from_dir(dir)
        } else {
            download_model(path_or_id, revision)
        }
    }

    /// Collects model files from a local directory.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let config = dir.join("config.json");
        let tokenizer = dir.join("tokenizer.json");
        for required in [&config, &tokenizer] {
            if !required.is_file() {
                return Err(Error::ModelLoad(format!("missing {}", required.display())));
            }
        }

        let single = dir.join("model.safetensors");
        let index = dir.join("model.safetensors.index.json");
        let weights = if single.is_file() {
            vec![single]
        } else if index.is_file() {
            let content = std::fs::read_to_string(&index)?;
            shard_files_from_index(&content)?
                .into_iter()
                .map(|name| dir.join(name))
                .collect()
        } else {
            let mut shards: Vec<PathBuf> = std::fs::read_dir(dir)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
                .collect();
            shards.sort();
            shards
        };
        if weights.is_empty() {
            return Err(Error::ModelLoad(format!(
                "no SafeTensors weights in {}",
                dir.display()
            )));
        }

        debug!(dir = %dir.display(), shards = weights.len(), "resolved local model");
        Ok(Self {
            config,
            weights,
            tokenizer,
        })
    }
}

/// Downloads model files from HuggingFace Hub.
///
/// # Arguments
///
/// * `model_id` - HuggingFace model ID (e.g., "Qwen/Qwen3-8B")
/// * `revision` - Git revision (branch, tag, or commit hash)
pub fn download_model(model_id: &str, revision: &str) -> Result<ModelFiles> {
    info!(model_id, revision, "fetching model from the hub");
    let api = Api::new().map_err(|e| Error::Hub(format!("failed to create HF API: {e}")))?;

    let repo = api.repo(Repo::with_revision(
        model_id.to_string(),
        RepoType::Model,
        revision.to_string(),
    ));

    let config = repo
        .get("config.json")
        .map_err(|e| Error::Hub(format!("failed to download config.json: {e}")))?;
    let weights = download_weights(&repo)?;
    let tokenizer = repo
        .get("tokenizer.json")
        .map_err(|e| Error::Hub(format!("failed to download tokenizer.json: {e}")))?;

    Ok(ModelFiles {
        config,
        weights,
        tokenizer,
    })
}

/// Unique shard file names listed in a `model.safetensors.index.json`.
pub fn shard_files_from_index(content: &str) -> Result<Vec<String>> {
    let index: serde_json::Value = serde_json::from_str(content)?;
    let weight_map = index["weight_map"]
        .as_object()
        .ok_or_else(|| Error::ModelLoad("invalid safetensors index: missing weight_map".into()))?;

    let mut shards: Vec<String> = weight_map
        .values()
        .filter_map(|v| v.as_str())
        .map(str::to_string)
        .collect();
    shards.sort();
    shards.dedup();
    Ok(shards)
}

fn download_weights(repo: &ApiRepo) -> Result<Vec<PathBuf>> {
    if let Ok(path) = repo.get("model.safetensors") {
        return Ok(vec![path]);
    }

    let index_path = repo.get("model.safetensors.index.json").map_err(|_| {
        Error::ModelLoad("no SafeTensors weights found (only SafeTensors is supported)".into())
    })?;
    let content = std::fs::read_to_string(&index_path)?;

    shard_files_from_index(&content)?
        .into_iter()
        .map(|name| {
            repo.get(&name)
                .map_err(|e| Error::Hub(format!("failed to download {name}: {e}")))
        })
        .collect()
}

/// Creates a VarBuilder from SafeTensors files.
///
/// # Safety
///
/// Uses memory-mapped file access. This is safe as long as the files are not
/// modified while being read.
#[allow(unsafe_code)]
pub fn load_safetensors(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
    Ok(vb)
}

/// Loads a single named tensor from a set of SafeTensors shards.
#[allow(unsafe_code)]
pub fn load_tensor(paths: &[PathBuf], name: &str, dtype: DType, device: &Device) -> Result<Tensor> {
    let tensors = unsafe { MmapedSafetensors::multi(paths)? };
    let tensor = tensors
        .load(name, device)
        .map_err(|e| Error::ModelLoad(format!("tensor '{name}' not found: {e}")))?;
    Ok(tensor.to_dtype(dtype)?)
}

/// Loads Qwen3 configuration from config.json.
pub fn load_config(path: &Path) -> Result<Qwen3Config> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::ModelLoad(format!("failed to read {}: {e}", path.display())))?;
    let config: Qwen3Config = serde_json::from_str(&content)
        .map_err(|e| Error::ModelLoad(format!("failed to parse {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Qwen3 model configuration from HuggingFace config.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Qwen3Config {
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Hidden dimension.
    pub hidden_size: usize,
    /// Intermediate dimension (MLP).
    pub intermediate_size: usize,
    /// Number of transformer layers.
    pub num_hidden_layers: usize,
    /// Number of attention heads.
    pub num_attention_heads: usize,
    /// Number of key-value heads (for GQA).
    pub num_key_value_heads: usize,
    /// Dimension per attention head.
    #[serde(default = "default_head_dim")]
    pub head_dim: usize,
    /// RMSNorm epsilon.
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    /// RoPE theta.
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    /// Maximum sequence length.
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    /// Whether to tie word embeddings with lm_head.
    #[serde(default = "default_tie_word_embeddings")]
    pub tie_word_embeddings: bool,
}

fn default_head_dim() -> usize {
    128
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

fn default_tie_word_embeddings() -> bool {
    true
}

impl Qwen3Config {
    /// Checks head counts.
    pub fn validate(&self) -> Result<()> {
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
        if self.num_hidden_layers == 0 {
            return Err(Error::Config("num_hidden_layers must be positive".into()));
        }
        Ok(())
    }

    /// Number of query heads per KV head.
    pub fn num_kv_groups(&self) -> usize {
        self.num_attention_heads / self.num_key_value_heads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_files_from_index() {
        let index = r#"{
            "metadata": {"total_size": 1},
            "weight_map": {
                "a": "model-00002-of-00002.safetensors",
                "b": "model-00001-of-00002.safetensors",
                "c": "model-00001-of-00002.safetensors"
            }
        }"#;
        assert_eq!(
            shard_files_from_index(index).unwrap(),
            vec![
                "model-00001-of-00002.safetensors".to_string(),
                "model-00002-of-00002.safetensors".to_string()
            ]
        );
    }

    #[test]
    fn test_shard_index_without_weight_map() {
        assert!(matches!(
            shard_files_from_index("{}"),
            Err(Error::ModelLoad(_))
        ));
    }

    #[test]
    fn test_from_dir_requires_config() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ModelFiles::from_dir(dir.path()),
            Err(Error::ModelLoad(_))
        ));
    }
}
