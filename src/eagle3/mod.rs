//! EAGLE3 draft model.
//!
//! - [`config`]: draft JSON config
//! - [`attention`]: draft attention with the test-time-training cache
//! - [`model`]: the single-layer draft model and its checkpoint format
//! - [`vocab`]: draft vocabulary selection and caching

pub mod attention;
pub mod config;
pub mod model;
pub mod vocab;

pub use attention::{AttentionBackend, AttentionMask, Eagle3Attention, TttCache, eagle3_block_mask};
pub use config::Eagle3DraftConfig;
pub use model::{Eagle3DecoderLayer, Eagle3DraftModel};
pub use vocab::{VocabMapping, load_or_build_vocab_mapping, vocab_mapping_path};
