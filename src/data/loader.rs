//! Batching.
//!
//! Samples are shuffled once per epoch (seeded by `seed + epoch`), grouped
//! into fixed-size batches and right-padded to the longest sample in the
//! batch. The final partial batch is kept.

use candle_core::{Device, Tensor};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use super::Sample;
use crate::error::{Error, Result};

/// Token id used for right padding.
pub const PAD_TOKEN_ID: u32 = 0;

/// One padded batch on the training device.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Token ids [batch, seq_len] (u32).
    pub input_ids: Tensor,
    /// 1 on real tokens, 0 on padding [batch, seq_len] (u8).
    pub attention_mask: Tensor,
    /// 1 on trainable tokens [batch, seq_len] (f32).
    pub loss_mask: Tensor,
    /// Unpadded length of each row.
    pub lengths: Vec<usize>,
}

impl Batch {
    /// Pads `samples` into a batch.
    pub fn collate(samples: &[&Sample], device: &Device) -> Result<Self> {
        if samples.is_empty() {
            return Err(Error::Config("cannot collate an empty batch".into()));
        }
        let seq_len = samples.iter().map(|s| s.len()).max().unwrap_or(0);
        let batch = samples.len();

        let mut ids = vec![PAD_TOKEN_ID; batch * seq_len];
        let mut attn = vec![0u8; batch * seq_len];
        let mut loss = vec![0f32; batch * seq_len];
        let mut lengths = Vec::with_capacity(batch);

        for (row, sample) in samples.iter().enumerate() {
            let offset = row * seq_len;
            for (i, (&id, &m)) in sample.input_ids.iter().zip(&sample.loss_mask).enumerate() {
                ids[offset + i] = id;
                attn[offset + i] = 1;
                loss[offset + i] = f32::from(m);
            }
            lengths.push(sample.len());
        }

        Ok(Self {
            input_ids: Tensor::from_vec(ids, (batch, seq_len), device)?,
            attention_mask: Tensor::from_vec(attn, (batch, seq_len), device)?,
            loss_mask: Tensor::from_vec(loss, (batch, seq_len), device)?,
            lengths,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    /// Real (unpadded) tokens in the batch.
    pub fn num_tokens(&self) -> usize {
        self.lengths.iter().sum()
    }
}

/// Epoch-wise batch iterator over tokenized samples.
#[derive(Debug)]
pub struct DataLoader {
    samples: Vec<Sample>,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
}

impl DataLoader {
    pub fn new(samples: Vec<Sample>, batch_size: usize, shuffle: bool, seed: u64) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".into()));
        }
        Ok(Self {
            samples,
            batch_size,
            shuffle,
            seed,
        })
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    /// Batches per epoch, counting the final partial batch.
    pub fn num_batches(&self) -> usize {
        self.samples.len().div_ceil(self.batch_size)
    }

    /// Sample order for `epoch`.
    pub fn epoch_order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.samples.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        order
    }

    /// Batch `index` of an epoch whose sample order is `order`.
    pub fn batch_at(&self, order: &[usize], index: usize, device: &Device) -> Result<Batch> {
        let start = index * self.batch_size;
        if start >= order.len() {
            return Err(Error::Config(format!(
                "batch {index} is past the end of the epoch ({} batches)",
                self.num_batches()
            )));
        }
        let end = (start + self.batch_size).min(order.len());
        let batch: Vec<&Sample> = order[start..end].iter().map(|&i| &self.samples[i]).collect();
        Batch::collate(&batch, device)
    }

    /// Iterates over the padded batches of one epoch.
    pub fn epoch<'a>(
        &'a self,
        epoch: usize,
        device: &'a Device,
    ) -> impl Iterator<Item = Result<Batch>> + 'a {
        let order = self.epoch_order(epoch);
        (0..self.num_batches()).map(move |b| self.batch_at(&order, b, device))
    }
}
