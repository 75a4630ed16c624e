//! Draft vocabulary selection.
//!
//! The draft LM head only predicts the `draft_vocab_size` tokens that occur
//! most often in the trainable part of the dataset. Two lookup tables
//! connect the vocabularies:
//!
//! - `t2d[target_id]` is true when the target token is in the draft vocab
//! - `d2t[draft_id]` is the offset with `target_id = draft_id + d2t[draft_id]`

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::data::Sample;
use crate::error::{Error, Result};

/// Target-to-draft vocabulary mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VocabMapping {
    t2d: Vec<bool>,
    d2t: Vec<i64>,
}

impl VocabMapping {
    /// Builds the mapping from per-token counts (`counts.len()` is the
    /// target vocab size).
    ///
    /// Picks the `draft_vocab_size` most frequent tokens, ties broken by
    /// the smaller id. Tokens never seen are not picked by frequency; when
    /// fewer than `draft_vocab_size` tokens were seen, the smallest unused
    /// ids fill the rest.
    pub fn from_counts(counts: &[u64], draft_vocab_size: usize) -> Result<Self> {
        let vocab_size = counts.len();
        if draft_vocab_size == 0 || draft_vocab_size > vocab_size {
            return Err(Error::Config(format!(
                "draft vocab size {draft_vocab_size} must be in 1..={vocab_size}"
            )));
        }

        let mut seen: Vec<usize> = (0..vocab_size).filter(|&id| counts[id] > 0).collect();
        seen.sort_by(|&a, &b| counts[b].cmp(&counts[a]).then(a.cmp(&b)));
        seen.truncate(draft_vocab_size);

        let mut t2d = vec![false; vocab_size];
        for &id in &seen {
            t2d[id] = true;
        }
        let mut used = seen;
        if used.len() < draft_vocab_size {
            let missing = draft_vocab_size - used.len();
            let fill: Vec<usize> = (0..vocab_size).filter(|&id| !t2d[id]).take(missing).collect();
            for &id in &fill {
                t2d[id] = true;
            }
            used.extend(fill);
        }
        used.sort_unstable();

        let d2t = used
            .iter()
            .enumerate()
            .map(|(i, &id)| id as i64 - i as i64)
            .collect();
        Ok(Self { t2d, d2t })
    }

    /// Counts trainable tokens (loss mask set) over `samples`.
    pub fn from_samples(
        samples: &[Sample],
        vocab_size: usize,
        draft_vocab_size: usize,
    ) -> Result<Self> {
        let mut counts = vec![0u64; vocab_size];
        for sample in samples {
            for (&id, &m) in sample.input_ids.iter().zip(&sample.loss_mask) {
                if m == 0 {
                    continue;
                }
                let slot = counts.get_mut(id as usize).ok_or_else(|| {
                    Error::Config(format!("token id {id} outside vocab of {vocab_size}"))
                })?;
                *slot += 1;
            }
        }
        let distinct = counts.iter().filter(|&&c| c > 0).count();
        debug!(distinct, draft_vocab_size, "counted trainable tokens");
        Self::from_counts(&counts, draft_vocab_size)
    }

    pub fn vocab_size(&self) -> usize {
        self.t2d.len()
    }

    pub fn draft_vocab_size(&self) -> usize {
        self.d2t.len()
    }

    /// Target ids of the draft vocabulary, in draft order (ascending).
    pub fn draft_token_ids(&self) -> Vec<u32> {
        self.d2t
            .iter()
            .enumerate()
            .map(|(i, &off)| (i as i64 + off) as u32)
            .collect()
    }

    /// Target id of a draft id.
    pub fn draft_to_target(&self, draft_id: usize) -> Option<u32> {
        self.d2t
            .get(draft_id)
            .map(|&off| (draft_id as i64 + off) as u32)
    }

    /// Whether a target id belongs to the draft vocabulary.
    pub fn contains(&self, target_id: u32) -> bool {
        self.t2d.get(target_id as usize).copied().unwrap_or(false)
    }

    pub fn t2d(&self) -> &[bool] {
        &self.t2d
    }

    pub fn d2t(&self) -> &[i64] {
        &self.d2t
    }

    /// `(t2d [vocab] u8, d2t [draft_vocab] i64)` tensors.
    pub fn tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        let t2d: Vec<u8> = self.t2d.iter().map(|&b| u8::from(b)).collect();
        let t2d = Tensor::from_vec(t2d, self.t2d.len(), device)?;
        let d2t = Tensor::from_slice(&self.d2t, self.d2t.len(), device)?;
        Ok((t2d, d2t))
    }

    /// Rebuilds a mapping from its tensors.
    pub fn from_tensors(t2d: &Tensor, d2t: &Tensor) -> Result<Self> {
        let t2d: Vec<bool> = t2d
            .to_dtype(DType::U8)?
            .to_vec1::<u8>()?
            .into_iter()
            .map(|v| v != 0)
            .collect();
        let d2t = d2t.to_dtype(DType::I64)?.to_vec1::<i64>()?;
        let selected = t2d.iter().filter(|&&b| b).count();
        if selected != d2t.len() {
            return Err(Error::ModelLoad(format!(
                "vocab mapping marks {selected} tokens but has {} offsets",
                d2t.len()
            )));
        }
        Ok(Self { t2d, d2t })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let (t2d, d2t) = self.tensors(&Device::Cpu)?;
        let tensors: HashMap<String, Tensor> =
            HashMap::from([("t2d".to_string(), t2d), ("d2t".to_string(), d2t)]);
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
        let get = |name: &str| {
            tensors.get(name).ok_or_else(|| {
                Error::ModelLoad(format!("{} has no '{name}' tensor", path.display()))
            })
        };
        Self::from_tensors(get("t2d")?, get("d2t")?)
    }
}

/// Cache file for the mapping of one processed dataset.
pub fn vocab_mapping_path(
    cache_dir: &Path,
    dataset_key: &str,
    vocab_size: usize,
    draft_vocab_size: usize,
) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(dataset_key.as_bytes());
    hasher.update(format!("{vocab_size}:{draft_vocab_size}").as_bytes());
    let key = hex::encode(hasher.finalize());
    cache_dir
        .join("vocab_mapping")
        .join(format!("{key}.safetensors"))
}

/// Loads the cached mapping or builds and caches it.
pub fn load_or_build_vocab_mapping(
    cache_dir: &Path,
    dataset_key: &str,
    samples: &[Sample],
    vocab_size: usize,
    draft_vocab_size: usize,
) -> Result<VocabMapping> {
    let path = vocab_mapping_path(cache_dir, dataset_key, vocab_size, draft_vocab_size);
    if path.is_file() {
        let mapping = VocabMapping::load(&path)?;
        if mapping.vocab_size() == vocab_size && mapping.draft_vocab_size() == draft_vocab_size {
            info!(path = %path.display(), "reusing cached vocab mapping");
            return Ok(mapping);
        }
    }

    let mapping = VocabMapping::from_samples(samples, vocab_size, draft_vocab_size)?;
    mapping.save(&path)?;
    info!(path = %path.display(), draft_vocab_size, "built vocab mapping");
    Ok(mapping)
}
