//! Qwen3 target model.
//!
//! This module contains:
//! - Model loading from local directories or the HuggingFace Hub
//! - Qwen3 components (RMSNorm, RoPE, GQA attention, SwiGLU)
//! - The causal LM with auxiliary hidden-state capture for EAGLE3

pub mod attention;
pub mod decoder;
pub mod loader;
pub mod mlp;
pub mod norm;
pub mod qwen3;
pub mod rope;

pub use attention::{MASK_VALUE, Qwen3Attention, causal_mask, repeat_kv};
pub use decoder::Qwen3DecoderLayer;
pub use loader::{
    ModelFiles, Qwen3Config, download_model, load_config, load_safetensors, load_tensor,
};
pub use mlp::Qwen3Mlp;
pub use norm::RmsNorm;
pub use qwen3::{Qwen3ForCausalLM, Qwen3Model, eagle3_aux_layers};
pub use rope::RotaryEmbedding;
