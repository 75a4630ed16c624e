//! Configuration types for eagle3-train.

use std::path::PathBuf;

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

use crate::eagle3::AttentionBackend;
use crate::error::{Error, Result};

/// Largest supported test-time-training unroll.
pub const MAX_TTT_LENGTH: usize = 16;

/// Floating point precision used for both models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    F32,
    Bf16,
    F16,
}

impl Precision {
    /// The candle dtype for this precision.
    pub fn dtype(self) -> DType {
        match self {
            Precision::F32 => DType::F32,
            Precision::Bf16 => DType::BF16,
            Precision::F16 => DType::F16,
        }
    }
}

impl std::str::FromStr for Precision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "f32" | "fp32" => Ok(Precision::F32),
            "bf16" => Ok(Precision::Bf16),
            "f16" | "fp16" => Ok(Precision::F16),
            other => Err(Error::Config(format!("unknown precision '{other}'"))),
        }
    }
}

/// Where tensors live during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Cuda,
    /// CUDA device 0 when compiled with CUDA support, CPU otherwise.
    #[default]
    Auto,
}

impl DeviceKind {
    /// Opens the device.
    pub fn open(self) -> Result<Device> {
        let device = match self {
            DeviceKind::Cpu => Device::Cpu,
            DeviceKind::Cuda => Device::new_cuda(0)?,
            DeviceKind::Auto => Device::cuda_if_available(0)?,
        };
        Ok(device)
    }
}

impl std::str::FromStr for DeviceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cpu" => Ok(DeviceKind::Cpu),
            "cuda" | "gpu" => Ok(DeviceKind::Cuda),
            "auto" => Ok(DeviceKind::Auto),
            other => Err(Error::Config(format!("unknown device '{other}'"))),
        }
    }
}

/// Online EAGLE3 training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Target model directory or HuggingFace model ID.
    pub target_model_path: String,
    /// Hub revision used when the target is downloaded.
    pub target_revision: String,
    /// Draft model JSON configuration.
    pub draft_model_config: PathBuf,
    /// Conversation JSONL file used for training.
    pub train_data_path: PathBuf,
    /// Optional conversation JSONL file used for evaluation.
    pub eval_data_path: Option<PathBuf>,
    /// Directory that receives checkpoints.
    pub output_dir: PathBuf,
    /// Number of passes over the training data.
    pub num_epochs: usize,
    /// Sequences per optimizer step.
    pub batch_size: usize,
    /// Peak learning rate.
    pub learning_rate: f64,
    /// Sequences are truncated to this many tokens.
    pub max_length: usize,
    /// Chat template name.
    pub chat_template: String,
    /// Root of the processed-dataset and vocab-mapping caches.
    pub cache_dir: PathBuf,
    /// Tensor name of the target embedding copied into the draft model.
    pub embedding_key: String,
    /// Tensor-parallel degree (only 1 is supported).
    pub tp_size: usize,
    /// Number of unrolled draft steps per training position.
    pub ttt_length: usize,
    /// Draft attention implementation.
    pub attention_backend: AttentionBackend,
    /// Fraction of total steps spent in linear warmup.
    pub warmup_ratio: f64,
    /// Global gradient norm clip.
    pub max_grad_norm: f64,
    /// Seed for shuffling.
    pub seed: u64,
    /// Log every N optimizer steps.
    pub log_interval: usize,
    /// Evaluate every N epochs.
    pub eval_interval: usize,
    /// Save a checkpoint every N epochs.
    pub save_interval: usize,
    /// Restart from the newest checkpoint in `output_dir`.
    pub resume: bool,
    /// Model precision.
    pub precision: Precision,
    /// Training device.
    pub device: DeviceKind,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            target_model_path: "Qwen/Qwen3-8B".to_string(),
            target_revision: "main".to_string(),
            draft_model_config: PathBuf::from("configs/qwen3-8b-eagle3.json"),
            train_data_path: PathBuf::from("cache/dataset/sharegpt.jsonl"),
            eval_data_path: None,
            output_dir: PathBuf::from("outputs/qwen3-8b-eagle3"),
            num_epochs: 10,
            batch_size: 1,
            learning_rate: 1e-4,
            max_length: 2048,
            chat_template: "qwen".to_string(),
            cache_dir: PathBuf::from("cache"),
            embedding_key: "model.embed_tokens.weight".to_string(),
            tp_size: 1,
            ttt_length: 7,
            attention_backend: AttentionBackend::FlexAttention,
            warmup_ratio: 0.015,
            max_grad_norm: 0.5,
            seed: 0,
            log_interval: 50,
            eval_interval: 1,
            save_interval: 1,
            resume: false,
            precision: Precision::F32,
            device: DeviceKind::Auto,
        }
    }
}

impl TrainConfig {
    /// Set the number of epochs.
    pub fn epochs(mut self, n: usize) -> Self {
        self.num_epochs = n;
        self
    }

    /// Set the batch size.
    pub fn batch(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    /// Set the peak learning rate.
    pub fn lr(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    /// Set the test-time-training length.
    pub fn ttt(mut self, n: usize) -> Self {
        self.ttt_length = n;
        self
    }

    /// Set the attention backend.
    pub fn backend(mut self, backend: AttentionBackend) -> Self {
        self.attention_backend = backend;
        self
    }

    /// Checks values that do not depend on the model configs.
    pub fn validate(&self) -> Result<()> {
        if self.num_epochs == 0 {
            return Err(Error::Config("num_epochs must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".into()));
        }
        if self.max_length < 2 {
            return Err(Error::Config("max_length must be at least 2".into()));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(Error::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.ttt_length == 0 || self.ttt_length > MAX_TTT_LENGTH {
            return Err(Error::Config(format!(
                "ttt_length must be in 1..={MAX_TTT_LENGTH}, got {}",
                self.ttt_length
            )));
        }
        if self.tp_size != 1 {
            return Err(Error::Config(format!(
                "tensor parallelism is not supported (tp_size = {})",
                self.tp_size
            )));
        }
        if !(0.0..1.0).contains(&self.warmup_ratio) {
            return Err(Error::Config("warmup_ratio must be in [0, 1)".into()));
        }
        if self.max_grad_norm <= 0.0 {
            return Err(Error::Config("max_grad_norm must be positive".into()));
        }
        if self.log_interval == 0 || self.eval_interval == 0 || self.save_interval == 0 {
            return Err(Error::Config("intervals must be positive".into()));
        }
        Ok(())
    }

    /// Checks that positions used by the unrolled draft fit the RoPE table.
    pub fn validate_positions(&self, max_position_embeddings: usize) -> Result<()> {
        if self.max_length + self.ttt_length > max_position_embeddings {
            return Err(Error::Config(format!(
                "max_length ({}) + ttt_length ({}) exceeds max_position_embeddings ({})",
                self.max_length, self.ttt_length, max_position_embeddings
            )));
        }
        Ok(())
    }
}

/// Dataset preparation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareConfig {
    /// `sharegpt` or a path to a local JSON / JSONL file.
    pub dataset: String,
    /// Directory receiving `<name>.jsonl`.
    pub output_path: PathBuf,
    /// Keep at most this many conversations.
    pub sample_size: Option<usize>,
    /// Seed for sampling.
    pub seed: u64,
}

impl Default for PrepareConfig {
    fn default() -> Self {
        Self {
            dataset: "sharegpt".to_string(),
            output_path: PathBuf::from("cache/dataset"),
            sample_size: None,
            seed: 42,
        }
    }
}

/// How many lines a JSONL sample keeps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleMode {
    /// Exactly this many lines (or all valid lines if fewer).
    Size(usize),
    /// Each valid line independently with this probability.
    Fraction(f64),
}

/// JSONL sampling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    pub mode: SampleMode,
    pub seed: u64,
    /// Skip lines that are not valid JSON.
    pub validate: bool,
}
