//! Tokenization and loss masks.
//!
//! Conversations are rendered through a chat template and tokenized one
//! segment at a time, so the loss mask lines up exactly with the segments
//! marked trainable. Tokenized datasets are cached under
//! `<cache_dir>/processed_dataset/<key>.jsonl`.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use super::prepare::read_conversations;
use super::{ChatTemplate, Conversation};
use crate::error::{Error, Result};

/// One tokenized training sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub input_ids: Vec<u32>,
    /// 1 where the token is part of an assistant reply.
    pub loss_mask: Vec<u8>,
}

impl Sample {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Number of tokens that contribute to the loss.
    pub fn num_trainable(&self) -> usize {
        self.loss_mask.iter().filter(|&&m| m == 1).count()
    }
}

/// A tokenized dataset plus the cache key it was stored under.
#[derive(Debug, Clone)]
pub struct ProcessedDataset {
    pub samples: Vec<Sample>,
    pub key: String,
}

/// Tokenizes one conversation. Returns `None` when nothing is trainable
/// after truncation to `max_length`.
pub fn tokenize_conversation(
    tokenizer: &Tokenizer,
    template: &ChatTemplate,
    conversation: &Conversation,
    max_length: usize,
) -> Result<Option<Sample>> {
    let mut input_ids = Vec::new();
    let mut loss_mask = Vec::new();

    for segment in template.render(conversation) {
        if input_ids.len() >= max_length {
            break;
        }
        let encoding = tokenizer
            .encode(segment.text.as_str(), false)
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        let ids = encoding.get_ids();
        input_ids.extend_from_slice(ids);
        loss_mask.extend(std::iter::repeat_n(u8::from(segment.trainable), ids.len()));
    }

    input_ids.truncate(max_length);
    loss_mask.truncate(max_length);

    let sample = Sample {
        input_ids,
        loss_mask,
    };
    if sample.num_trainable() == 0 {
        return Ok(None);
    }
    Ok(Some(sample))
}

/// Cache key for a tokenized dataset.
///
/// Covers the data file identity (path, size, mtime), the tokenizer, the
/// template and the truncation length.
pub fn cache_key(
    data_path: &Path,
    tokenizer_path: &Path,
    template: &ChatTemplate,
    max_length: usize,
) -> Result<String> {
    let meta = std::fs::metadata(data_path)?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut hasher = Sha256::new();
    hasher.update(data_path.to_string_lossy().as_bytes());
    hasher.update(meta.len().to_le_bytes());
    hasher.update(mtime.to_le_bytes());
    hasher.update(tokenizer_path.to_string_lossy().as_bytes());
    hasher.update(template.name.as_bytes());
    hasher.update((max_length as u64).to_le_bytes());
    Ok(hex::encode(hasher.finalize()))
}

fn cache_path(cache_dir: &Path, key: &str) -> PathBuf {
    cache_dir
        .join("processed_dataset")
        .join(format!("{key}.jsonl"))
}

fn read_samples(path: &Path) -> Result<Vec<Sample>> {
    let reader = BufReader::new(File::open(path)?);
    let mut samples = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let sample = serde_json::from_str(&line?).map_err(|e| Error::Dataset {
            line: line_no + 1,
            message: e.to_string(),
        })?;
        samples.push(sample);
    }
    Ok(samples)
}

fn write_samples(path: &Path, samples: &[Sample]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // Readers only ever see a complete file.
    let tmp = path.with_extension("jsonl.tmp");
    let mut out = BufWriter::new(File::create(&tmp)?);
    for sample in samples {
        serde_json::to_writer(&mut out, sample)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    drop(out);
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Tokenizes a conversation JSONL file, reusing the cache when possible.
pub fn build_dataset(
    data_path: &Path,
    tokenizer: &Tokenizer,
    tokenizer_path: &Path,
    template: &ChatTemplate,
    max_length: usize,
    cache_dir: &Path,
) -> Result<ProcessedDataset> {
    let key = cache_key(data_path, tokenizer_path, template, max_length)?;
    let path = cache_path(cache_dir, &key);

    if path.is_file() {
        let samples = read_samples(&path)?;
        info!(
            samples = samples.len(),
            cache = %path.display(),
            "loaded tokenized dataset from cache"
        );
        return Ok(ProcessedDataset { samples, key });
    }

    let conversations = read_conversations(data_path)?;
    let mut samples = Vec::with_capacity(conversations.len());
    for conversation in &conversations {
        match tokenize_conversation(tokenizer, template, conversation, max_length)? {
            Some(sample) => samples.push(sample),
            None => debug!(id = %conversation.id, "dropping conversation without trainable tokens"),
        }
    }
    if samples.is_empty() {
        return Err(Error::Config(format!(
            "no trainable samples in {}",
            data_path.display()
        )));
    }

    write_samples(&path, &samples)?;
    info!(
        conversations = conversations.len(),
        samples = samples.len(),
        cache = %path.display(),
        "tokenized dataset"
    );
    Ok(ProcessedDataset { samples, key })
}
