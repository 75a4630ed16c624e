//! eagle3-train: online EAGLE3 draft-model training in Rust.
//!
//! The crate covers the whole pipeline:
//! - Dataset preparation and sampling (ShareGPT or local JSON/JSONL)
//! - Chat templating, tokenization and loss masks with an on-disk cache
//! - A frozen Qwen3 target model exposing auxiliary hidden states
//! - A single-layer EAGLE3 draft model with test-time-training attention
//! - The training loop with AdamW, warmup + cosine schedule and checkpoints

pub mod config;
pub mod error;
pub mod logging;

pub mod data;
pub mod eagle3;
pub mod model;
pub mod train;

pub use config::{DeviceKind, PrepareConfig, Precision, SampleConfig, SampleMode, TrainConfig};
pub use data::{DatasetSource, prepare_dataset, sample_fixed_size, sample_fraction, sample_jsonl};
pub use eagle3::{AttentionBackend, Eagle3DraftConfig, Eagle3DraftModel, VocabMapping};
pub use error::{Error, Result};
pub use model::{ModelFiles, Qwen3Config, Qwen3ForCausalLM, download_model, load_config};
pub use train::{CosineWarmupScheduler, Eagle3Trainer, TrainSummary};
