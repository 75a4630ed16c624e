//! Training data pipeline.
//!
//! ```text
//! raw dataset ──prepare──► conversation JSONL ──preprocess──► token samples ──loader──► batches
//!                              │
//!                              └──sample──► smaller JSONL
//! ```

pub mod loader;
pub mod prepare;
pub mod preprocess;
pub mod sample;
pub mod template;

use serde::{Deserialize, Serialize};

pub use loader::{Batch, DataLoader};
pub use prepare::{DatasetSource, PrepareStats, prepare_dataset};
pub use preprocess::{Sample, build_dataset, tokenize_conversation};
pub use sample::{Reservoir, SampleStats, sample_fixed_size, sample_fraction, sample_jsonl};
pub use template::{ChatTemplate, Segment};

/// Speaker of one conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A normalized conversation, one per line of a prepared dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub conversations: Vec<Message>,
}
