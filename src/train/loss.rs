//! TTT loss and accuracy.
//!
//! The draft predicts a distribution over its reduced vocabulary. The target
//! distribution is the target model's softmax restricted to the same ids,
//! and only positions where the target's top-1 token is in the draft vocab
//! (and the loss mask is set) count.

use candle_core::{D, DType, Device, Result, Tensor};

use crate::eagle3::VocabMapping;

/// Decay of the per-step loss weight.
pub const STEP_WEIGHT_DECAY: f64 = 0.8;

/// Weight of the `step`-th TTT loss: `0.8^step`.
pub fn step_weight(step: usize) -> f64 {
    STEP_WEIGHT_DECAY.powi(step as i32)
}

/// Vocabulary tensors used to build training targets.
#[derive(Debug, Clone)]
pub struct DraftVocab {
    /// Target ids of the draft vocab, ascending [draft_vocab] (u32).
    pub token_ids: Tensor,
    /// Membership mask [vocab] (u8).
    pub t2d: Tensor,
}

impl DraftVocab {
    pub fn new(mapping: &VocabMapping, device: &Device) -> Result<Self> {
        let ids = mapping.draft_token_ids();
        let token_ids = Tensor::from_vec(ids, mapping.draft_vocab_size(), device)?;
        let t2d: Vec<u8> = mapping.t2d().iter().map(|&b| u8::from(b)).collect();
        let t2d = Tensor::from_vec(t2d, mapping.vocab_size(), device)?;
        Ok(Self { token_ids, t2d })
    }
}

/// Shifts `t` one position left along dim 1, zero-padding the end.
pub fn shift_left(t: &Tensor) -> Result<Tensor> {
    let seq_len = t.dim(1)?;
    if seq_len <= 1 {
        return t.zeros_like();
    }
    let mut pad_shape = t.dims().to_vec();
    pad_shape[1] = 1;
    let pad = Tensor::zeros(pad_shape, t.dtype(), t.device())?;
    Tensor::cat(&[&t.narrow(1, 1, seq_len - 1)?, &pad], 1)
}

/// Target probabilities over the draft vocab and the position mask.
///
/// # Arguments
///
/// * `target_logits` - `[batch, seq, vocab]`
///
/// # Returns
///
/// `(target_p [batch, seq, draft_vocab] f32, position_mask [batch, seq, 1] f32)`
/// where the mask is 1 when the target's argmax is in the draft vocab.
pub fn target_distribution(target_logits: &Tensor, vocab: &DraftVocab) -> Result<(Tensor, Tensor)> {
    let (batch, seq_len, _) = target_logits.dims3()?;

    let top = target_logits.argmax_keepdim(D::Minus1)?.flatten_all()?;
    let position_mask = vocab
        .t2d
        .index_select(&top, 0)?
        .to_dtype(DType::F32)?
        .reshape((batch, seq_len, 1))?;

    let selected = target_logits
        .index_select(&vocab.token_ids, 2)?
        .to_dtype(DType::F32)?;
    let target_p = candle_nn::ops::softmax_last_dim(&selected)?.detach();
    Ok((target_p, position_mask.detach()))
}

/// Inputs and supervision of one unrolled draft step.
///
/// Built from the batch and the target distribution with one left shift,
/// then shifted again by [`TttTargets::advance`] before each later step.
/// At step `k`, position `t` embeds token `t + k + 1` and is scored against
/// the target distribution at position `t + k + 1`.
#[derive(Debug, Clone)]
pub struct TttTargets {
    /// [batch, seq] (u32)
    pub input_ids: Tensor,
    /// [batch, seq, draft_vocab] (f32)
    pub target_p: Tensor,
    /// [batch, seq, 1] (f32)
    pub position_mask: Tensor,
    /// [batch, seq, 1] (f32)
    pub loss_mask: Tensor,
}

impl TttTargets {
    /// `loss_mask` is `[batch, seq]` in f32.
    pub fn new(
        input_ids: &Tensor,
        target_p: &Tensor,
        position_mask: &Tensor,
        loss_mask: &Tensor,
    ) -> Result<Self> {
        Ok(Self {
            input_ids: shift_left(input_ids)?,
            target_p: shift_left(target_p)?,
            position_mask: shift_left(position_mask)?,
            loss_mask: shift_left(&loss_mask.unsqueeze(D::Minus1)?)?,
        })
    }

    /// Moves every tensor one position further left.
    pub fn advance(&mut self) -> Result<()> {
        self.input_ids = shift_left(&self.input_ids)?;
        self.target_p = shift_left(&self.target_p)?;
        self.position_mask = shift_left(&self.position_mask)?;
        self.loss_mask = shift_left(&self.loss_mask)?;
        Ok(())
    }

    /// Positions scored at this step, `[batch, seq, 1]`.
    pub fn valid_mask(&self) -> Result<Tensor> {
        self.position_mask.broadcast_mul(&self.loss_mask)
    }
}

/// Soft cross-entropy `-Σ p·log q`, averaged over positions where `mask` is 1.
///
/// `mask` is `[batch, seq, 1]`; with no valid position the loss is 0.
pub fn soft_cross_entropy(draft_logits: &Tensor, target_p: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let log_q = candle_nn::ops::log_softmax(&draft_logits.to_dtype(DType::F32)?, D::Minus1)?;
    let per_position = (target_p * log_q)?.sum_keepdim(D::Minus1)?.neg()?;
    let total = per_position.broadcast_mul(mask)?.sum_all()?;
    let valid: f32 = mask.sum_all()?.to_scalar()?;
    total / f64::from(valid.max(1.0))
}

/// Fraction of valid positions where the draft and target argmax agree.
pub fn accuracy(draft_logits: &Tensor, target_p: &Tensor, mask: &Tensor) -> Result<Option<f64>> {
    let valid: f32 = mask.sum_all()?.to_scalar()?;
    if valid <= 0.0 {
        return Ok(None);
    }
    let draft_top = draft_logits.argmax_keepdim(D::Minus1)?;
    let target_top = target_p.argmax_keepdim(D::Minus1)?;
    let correct: f32 = draft_top
        .eq(&target_top)?
        .to_dtype(DType::F32)?
        .broadcast_mul(mask)?
        .sum_all()?
        .to_scalar()?;
    Ok(Some(f64::from(correct) / f64::from(valid)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_weights() {
        assert_eq!(step_weight(0), 1.0);
        assert!((step_weight(1) - 0.8).abs() < 1e-12);
        assert!((step_weight(3) - 0.512).abs() < 1e-12);
    }

    #[test]
    fn test_shift_left_pads_with_zero() {
        let t = Tensor::new(&[[1u32, 2, 3], [4, 5, 6]], &Device::Cpu).unwrap();
        let s = shift_left(&t).unwrap();
        assert_eq!(s.to_vec2::<u32>().unwrap(), vec![vec![2, 3, 0], vec![5, 6, 0]]);

        let t = Tensor::ones((1, 3, 2), DType::F32, &Device::Cpu).unwrap();
        let s = shift_left(&t).unwrap();
        assert_eq!(s.dims(), &[1, 3, 2]);
        let last: f32 = s.narrow(1, 2, 1).unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(last, 0.0);
    }

    #[test]
    fn test_target_distribution_restricts_vocab() {
        let device = Device::Cpu;
        let mapping = VocabMapping::from_counts(&[0, 1, 0, 1], 2).unwrap();
        let vocab = DraftVocab::new(&mapping, &device).unwrap();

        // Position 0 argmax = 3 (in draft), position 1 argmax = 0 (not in draft).
        let logits = Tensor::new(&[[[0f32, 1.0, 0.0, 5.0], [9.0, 0.0, 0.0, 0.0]]], &device).unwrap();
        let (p, mask) = target_distribution(&logits, &vocab).unwrap();

        assert_eq!(p.dims(), &[1, 2, 2]);
        assert_eq!(mask.flatten_all().unwrap().to_vec1::<f32>().unwrap(), vec![1.0, 0.0]);
        let rows = p.sum(D::Minus1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for r in rows {
            assert!((r - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_ttt_targets_step_alignment() {
        let device = Device::Cpu;
        // Target id 10 + t is the argmax at position t; draft vocab = all 16 ids.
        let mapping = VocabMapping::from_counts(&[1; 16], 16).unwrap();
        let vocab = DraftVocab::new(&mapping, &device).unwrap();
        let logits: Vec<f32> = (0..5)
            .flat_map(|t| (0..16).map(move |v| if v == 10 + t { 5.0 } else { 0.0 }))
            .collect();
        let logits = Tensor::from_vec(logits, (1, 5, 16), &device).unwrap();
        let (p, position_mask) = target_distribution(&logits, &vocab).unwrap();

        let ids = Tensor::new(&[[1u32, 2, 3, 4, 5]], &device).unwrap();
        let loss_mask = Tensor::new(&[[0f32, 1.0, 1.0, 1.0, 1.0]], &device).unwrap();
        let mut targets = TttTargets::new(&ids, &p, &position_mask, &loss_mask).unwrap();

        let argmax = |t: &TttTargets| {
            t.target_p.argmax(D::Minus1).unwrap().flatten_all().unwrap().to_vec1::<u32>().unwrap()
        };
        let valid = |t: &TttTargets| {
            t.valid_mask().unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap()
        };

        assert_eq!(targets.input_ids.to_vec2::<u32>().unwrap(), vec![vec![2, 3, 4, 5, 0]]);
        assert_eq!(&argmax(&targets)[..4], &[11, 12, 13, 14]);
        assert_eq!(valid(&targets), vec![1.0, 1.0, 1.0, 1.0, 0.0]);

        targets.advance().unwrap();
        assert_eq!(targets.input_ids.to_vec2::<u32>().unwrap(), vec![vec![3, 4, 5, 0, 0]]);
        assert_eq!(&argmax(&targets)[..3], &[12, 13, 14]);
        assert_eq!(valid(&targets), vec![1.0, 1.0, 1.0, 0.0, 0.0]);

        targets.advance().unwrap();
        targets.advance().unwrap();
        assert_eq!(targets.input_ids.to_vec2::<u32>().unwrap(), vec![vec![5, 0, 0, 0, 0]]);
        assert_eq!(argmax(&targets)[0], 14);
        assert_eq!(valid(&targets), vec![1.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_ttt_targets_shift_loss_mask_with_ids() {
        let device = Device::Cpu;
        let ids = Tensor::new(&[[7u32, 8, 9, 10]], &device).unwrap();
        let p = Tensor::ones((1, 4, 2), DType::F32, &device).unwrap();
        let position_mask = Tensor::ones((1, 4, 1), DType::F32, &device).unwrap();
        let loss_mask = Tensor::new(&[[0f32, 0.0, 1.0, 0.0]], &device).unwrap();

        let mut targets = TttTargets::new(&ids, &p, &position_mask, &loss_mask).unwrap();
        let valid = |t: &TttTargets| {
            t.valid_mask().unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap()
        };
        // Token 9 is the only trainable one; it follows the ids leftwards.
        assert_eq!(valid(&targets), vec![0.0, 1.0, 0.0, 0.0]);
        assert_eq!(targets.input_ids.to_vec2::<u32>().unwrap()[0][1], 9);
        targets.advance().unwrap();
        assert_eq!(valid(&targets), vec![1.0, 0.0, 0.0, 0.0]);
        assert_eq!(targets.input_ids.to_vec2::<u32>().unwrap()[0][0], 9);
        targets.advance().unwrap();
        assert_eq!(valid(&targets), vec![0.0; 4]);
    }

    #[test]
    fn test_soft_cross_entropy_matches_manual() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[[0f32, 0.0]]], &device).unwrap();
        let p = Tensor::new(&[[[1f32, 0.0]]], &device).unwrap();
        let mask = Tensor::ones((1, 1, 1), DType::F32, &device).unwrap();

        let loss: f32 = soft_cross_entropy(&logits, &p, &mask).unwrap().to_scalar().unwrap();
        assert!((loss - std::f32::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn test_empty_mask_gives_zero_loss_and_no_accuracy() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[[1f32, 2.0], [3.0, 0.0]]], &device).unwrap();
        let p = Tensor::new(&[[[0.5f32, 0.5], [0.5, 0.5]]], &device).unwrap();
        let mask = Tensor::zeros((1, 2, 1), DType::F32, &device).unwrap();

        let loss: f32 = soft_cross_entropy(&logits, &p, &mask).unwrap().to_scalar().unwrap();
        assert_eq!(loss, 0.0);
        assert_eq!(accuracy(&logits, &p, &mask).unwrap(), None);
    }

    #[test]
    fn test_accuracy_counts_only_masked_positions() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[[2f32, 0.0], [2.0, 0.0], [0.0, 2.0]]], &device).unwrap();
        let p = Tensor::new(&[[[0.9f32, 0.1], [0.1, 0.9], [0.1, 0.9]]], &device).unwrap();
        let mask = Tensor::new(&[[[1f32], [1.0], [0.0]]], &device).unwrap();

        assert_eq!(accuracy(&logits, &p, &mask).unwrap(), Some(0.5));
    }
}
