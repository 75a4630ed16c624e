//! Online EAGLE3 training.
//!
//! The target model runs inside the training loop ("online"): every batch
//! goes through the frozen target first, whose logits and auxiliary hidden
//! states supervise the draft model unrolled `ttt_length` times.
//!
//! ```text
//! batch ──► target ──► logits ──► target_p, position mask
//!             │
//!             └──► aux hidden ──► fc ──► hidden_0
//!
//! step k:  embed(ids_k) + hidden_k ──► backbone ──► hidden_{k+1} ──► logits_k
//!          loss_k = CE(logits_k, target_p_k) on valid positions
//!          ids, target_p, masks shift left by one
//!
//! loss = Σ 0.8^k · loss_k
//! ```

use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use super::loss::{
    DraftVocab, TttTargets, accuracy, soft_cross_entropy, step_weight, target_distribution,
};
use super::scheduler::CosineWarmupScheduler;
use crate::config::TrainConfig;
use crate::data::{Batch, ChatTemplate, DataLoader, Sample, build_dataset};
use crate::eagle3::{
    AttentionMask, Eagle3DraftConfig, Eagle3DraftModel, TttCache, VocabMapping,
    load_or_build_vocab_mapping,
};
use crate::error::{Error, Result};
use crate::model::{ModelFiles, Qwen3ForCausalLM, load_config, load_safetensors, load_tensor};

const STATE_FILE: &str = "training_state.json";
const WEIGHTS_FILE: &str = "model.safetensors";

/// Metrics of one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct StepMetrics {
    /// Weighted sum of the per-step losses.
    pub loss: f64,
    /// Unweighted loss of each TTT step.
    pub step_losses: Vec<f64>,
    /// Top-1 agreement of each TTT step; `None` without valid positions.
    pub step_accuracies: Vec<Option<f64>>,
    /// Gradient norm before clipping (training only).
    pub grad_norm: Option<f64>,
    pub learning_rate: f64,
    pub tokens: usize,
}

/// Averages over an evaluation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    pub loss: f64,
    pub step_accuracies: Vec<f64>,
    pub batches: usize,
}

/// Contents of `training_state.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Last completed epoch (0-based).
    pub epoch: usize,
    pub global_step: usize,
    /// Mean training loss of the epoch.
    pub train_loss: f64,
    #[serde(default)]
    pub eval_loss: Option<f64>,
    #[serde(default)]
    pub step_accuracies: Vec<f64>,
}

/// Result of [`Eagle3Trainer::train`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    pub epochs_run: usize,
    pub global_step: usize,
    pub last_loss: Option<f64>,
    pub last_checkpoint: Option<PathBuf>,
}

/// Running per-step sums used for epoch and eval averages.
#[derive(Debug, Default)]
struct Accumulator {
    loss: f64,
    batches: usize,
    acc_sum: Vec<f64>,
    acc_count: Vec<usize>,
}

impl Accumulator {
    fn add(&mut self, metrics: &StepMetrics) {
        self.loss += metrics.loss;
        self.batches += 1;
        if self.acc_sum.len() < metrics.step_accuracies.len() {
            self.acc_sum.resize(metrics.step_accuracies.len(), 0.0);
            self.acc_count.resize(metrics.step_accuracies.len(), 0);
        }
        for (i, acc) in metrics.step_accuracies.iter().enumerate() {
            if let Some(acc) = acc {
                self.acc_sum[i] += acc;
                self.acc_count[i] += 1;
            }
        }
    }

    fn mean_loss(&self) -> Option<f64> {
        (self.batches > 0).then(|| self.loss / self.batches as f64)
    }

    fn mean_accuracies(&self) -> Vec<f64> {
        self.acc_sum
            .iter()
            .zip(&self.acc_count)
            .map(|(&s, &c)| if c == 0 { 0.0 } else { s / c as f64 })
            .collect()
    }
}

/// Trains an EAGLE3 draft model against a frozen Qwen3 target.
pub struct Eagle3Trainer {
    config: TrainConfig,
    target: Qwen3ForCausalLM,
    draft: Eagle3DraftModel,
    /// Draft vocabulary the targets are built from; always the draft's own.
    mapping: VocabMapping,
    vocab: DraftVocab,
    vars: Vec<Var>,
    optimizer: AdamW,
    scheduler: CosineWarmupScheduler,
    train_loader: DataLoader,
    eval_loader: Option<DataLoader>,
    device: Device,
    global_step: usize,
    start_epoch: usize,
}

impl Eagle3Trainer {
    /// Loads models and data described by `config`.
    pub fn new(config: TrainConfig) -> Result<Self> {
        config.validate()?;
        let device = config.device.open()?;
        let dtype = config.precision.dtype();
        info!(?device, ?dtype, target = %config.target_model_path, "setting up training");

        let files = ModelFiles::resolve(&config.target_model_path, &config.target_revision)?;
        let target_config = load_config(&files.config)?;
        let draft_config = Eagle3DraftConfig::from_file(&config.draft_model_config)?;
        draft_config.check_target(&target_config)?;
        config.validate_positions(draft_config.max_position_embeddings)?;

        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| Error::Tokenization(format!("failed to load tokenizer: {e}")))?;
        let template = ChatTemplate::by_name(&config.chat_template)?;

        let train = build_dataset(
            &config.train_data_path,
            &tokenizer,
            &files.tokenizer,
            &template,
            config.max_length,
            &config.cache_dir,
        )?;
        let eval = match &config.eval_data_path {
            Some(path) => Some(build_dataset(
                path,
                &tokenizer,
                &files.tokenizer,
                &template,
                config.max_length,
                &config.cache_dir,
            )?),
            None => None,
        };

        let mapping = load_or_build_vocab_mapping(
            &config.cache_dir,
            &train.key,
            &train.samples,
            draft_config.vocab_size,
            draft_config.draft_vocab_size,
        )?;

        let vb = load_safetensors(&files.weights, dtype, &device)?;
        let target = Qwen3ForCausalLM::new(&target_config, vb)?;
        info!(layers = target_config.num_hidden_layers, "loaded target model");

        let mut draft = Eagle3DraftModel::new(draft_config, config.attention_backend, dtype, &device)?;
        let embedding = load_tensor(&files.weights, &config.embedding_key, dtype, &device)?;
        draft.set_embedding(&embedding)?;
        draft.set_vocab_mapping(&mapping)?;

        Self::from_parts(
            config,
            target,
            draft,
            train.samples,
            eval.map(|e| e.samples),
            device,
        )
    }

    /// Assembles a trainer from already loaded models and tokenized data.
    ///
    /// The draft model must already carry its embedding and vocab mapping.
    pub fn from_parts(
        config: TrainConfig,
        target: Qwen3ForCausalLM,
        draft: Eagle3DraftModel,
        train_samples: Vec<Sample>,
        eval_samples: Option<Vec<Sample>>,
        device: Device,
    ) -> Result<Self> {
        config.validate()?;
        if train_samples.is_empty() {
            return Err(Error::Config("training set is empty".into()));
        }

        let mapping = VocabMapping::from_tensors(draft.t2d(), draft.d2t())?;
        let vocab = DraftVocab::new(&mapping, &device)?;

        let train_loader = DataLoader::new(train_samples, config.batch_size, true, config.seed)?;
        let eval_loader = eval_samples
            .filter(|s| !s.is_empty())
            .map(|s| DataLoader::new(s, config.batch_size, false, config.seed))
            .transpose()?;

        let total_steps = config.num_epochs * train_loader.num_batches();
        let scheduler =
            CosineWarmupScheduler::with_warmup_ratio(config.learning_rate, config.warmup_ratio, total_steps);

        let vars = draft.trainable_vars()?;
        let params = ParamsAdamW {
            lr: scheduler.get_lr(),
            weight_decay: 0.0,
            ..Default::default()
        };
        let optimizer = AdamW::new(vars.clone(), params)?;

        info!(
            samples = train_loader.num_samples(),
            batches_per_epoch = train_loader.num_batches(),
            total_steps,
            warmup_steps = scheduler.warmup_steps(),
            trainable_tensors = vars.len(),
            ttt_length = config.ttt_length,
            backend = %config.attention_backend,
            "trainer ready"
        );

        Ok(Self {
            config,
            target,
            draft,
            mapping,
            vocab,
            vars,
            optimizer,
            scheduler,
            train_loader,
            eval_loader,
            device,
            global_step: 0,
            start_epoch: 0,
        })
    }

    /// Runs the unrolled draft over one batch.
    ///
    /// Returns the weighted total loss (still attached to the graph), the
    /// per-step losses and accuracies.
    fn ttt_forward(&self, batch: &Batch) -> Result<(Tensor, Vec<f64>, Vec<Option<f64>>)> {
        let ttt_length = self.config.ttt_length;
        let (target_logits, aux_hidden) = self.target.forward_with_aux(&batch.input_ids)?;
        let (target_p, position_mask) = target_distribution(&target_logits, &self.vocab)?;
        let mut targets =
            TttTargets::new(&batch.input_ids, &target_p, &position_mask, &batch.loss_mask)?;

        let mask = AttentionMask::from_attention_mask(&batch.attention_mask)?;
        let mut hidden = self.draft.project_hidden_states(&aux_hidden)?;
        let mut cache = TttCache::new();

        let mut total = Tensor::zeros((), DType::F32, &self.device)?;
        let mut step_losses = Vec::with_capacity(ttt_length);
        let mut step_accuracies = Vec::with_capacity(ttt_length);

        for step in 0..ttt_length {
            let input_emb = self.draft.embed_input_ids(&targets.input_ids)?;
            let step_cache = (ttt_length > 1).then_some(&mut cache);
            hidden = self.draft.backbone(&input_emb, &hidden, &mask, step_cache)?;
            let logits = self.draft.compute_logits(&hidden)?;

            let valid = targets.valid_mask()?;
            let loss = soft_cross_entropy(&logits, &targets.target_p, &valid)?;
            step_accuracies.push(accuracy(&logits, &targets.target_p, &valid)?);
            step_losses.push(f64::from(loss.to_scalar::<f32>()?));
            total = (total + (loss * step_weight(step))?)?;

            if step + 1 < ttt_length {
                targets.advance()?;
            }
        }
        Ok((total, step_losses, step_accuracies))
    }

    /// Forward, backward and one optimizer update.
    pub fn train_step(&mut self, batch: &Batch) -> Result<StepMetrics> {
        let (total, step_losses, step_accuracies) = self.ttt_forward(batch)?;
        let loss = f64::from(total.to_scalar::<f32>()?);
        if !loss.is_finite() {
            return Err(Error::Training(format!(
                "non-finite loss at step {}",
                self.global_step
            )));
        }

        let mut grads = total.backward()?;
        let grad_norm = clip_grad_norm(&self.vars, &mut grads, self.config.max_grad_norm)?;

        let learning_rate = self.scheduler.get_lr();
        self.optimizer.set_learning_rate(learning_rate);
        self.optimizer.step(&grads)?;
        self.scheduler.step();
        self.global_step += 1;

        Ok(StepMetrics {
            loss,
            step_losses,
            step_accuracies,
            grad_norm: Some(grad_norm),
            learning_rate,
            tokens: batch.num_tokens(),
        })
    }

    /// Loss and accuracies without updating weights.
    pub fn eval_step(&self, batch: &Batch) -> Result<StepMetrics> {
        let (total, step_losses, step_accuracies) = self.ttt_forward(batch)?;
        Ok(StepMetrics {
            loss: f64::from(total.detach().to_scalar::<f32>()?),
            step_losses,
            step_accuracies,
            grad_norm: None,
            learning_rate: self.scheduler.get_lr(),
            tokens: batch.num_tokens(),
        })
    }

    /// Averages over the evaluation set, if one was given.
    pub fn evaluate(&self) -> Result<Option<EvalMetrics>> {
        let Some(loader) = &self.eval_loader else {
            return Ok(None);
        };
        let mut acc = Accumulator::default();
        for batch in loader.epoch(0, &self.device) {
            acc.add(&self.eval_step(&batch?)?);
        }
        Ok(acc.mean_loss().map(|loss| EvalMetrics {
            loss,
            step_accuracies: acc.mean_accuracies(),
            batches: acc.batches,
        }))
    }

    /// Runs all remaining epochs.
    pub fn train(&mut self) -> Result<TrainSummary> {
        if self.config.resume {
            self.resume()?;
        }

        let num_batches = self.train_loader.num_batches();
        let mut summary = TrainSummary {
            epochs_run: 0,
            global_step: self.global_step,
            last_loss: None,
            last_checkpoint: None,
        };

        for epoch in self.start_epoch..self.config.num_epochs {
            let started = Instant::now();
            let order = self.train_loader.epoch_order(epoch);
            let mut epoch_acc = Accumulator::default();

            for index in 0..num_batches {
                let batch = self.train_loader.batch_at(&order, index, &self.device)?;
                let metrics = self.train_step(&batch)?;
                epoch_acc.add(&metrics);
                summary.last_loss = Some(metrics.loss);

                if self.global_step.is_multiple_of(self.config.log_interval) {
                    info!(
                        epoch,
                        step = self.global_step,
                        loss = format_args!("{:.4}", metrics.loss),
                        acc = %format_accuracies(&metrics.step_accuracies),
                        lr = format_args!("{:.3e}", metrics.learning_rate),
                        grad_norm = format_args!("{:.3}", metrics.grad_norm.unwrap_or(0.0)),
                        "train"
                    );
                } else {
                    debug!(step = self.global_step, loss = metrics.loss, "train step");
                }
            }

            let train_loss = epoch_acc.mean_loss().unwrap_or(0.0);
            info!(
                epoch,
                loss = format_args!("{:.4}", train_loss),
                acc = ?epoch_acc.mean_accuracies(),
                secs = started.elapsed().as_secs(),
                "epoch finished"
            );

            let is_last = epoch + 1 == self.config.num_epochs;
            let mut eval_loss = None;
            if (epoch + 1).is_multiple_of(self.config.eval_interval) || is_last {
                if let Some(eval) = self.evaluate()? {
                    info!(
                        epoch,
                        loss = format_args!("{:.4}", eval.loss),
                        acc = ?eval.step_accuracies,
                        "eval"
                    );
                    eval_loss = Some(eval.loss);
                }
            }

            if (epoch + 1).is_multiple_of(self.config.save_interval) || is_last {
                let state = TrainingState {
                    epoch,
                    global_step: self.global_step,
                    train_loss,
                    eval_loss,
                    step_accuracies: epoch_acc.mean_accuracies(),
                };
                summary.last_checkpoint = Some(self.save_checkpoint(&state)?);
            }
            summary.epochs_run += 1;
        }

        summary.global_step = self.global_step;
        Ok(summary)
    }

    /// Writes `<output_dir>/epoch_<n>/`.
    pub fn save_checkpoint(&self, state: &TrainingState) -> Result<PathBuf> {
        let dir = self.config.output_dir.join(format!("epoch_{}", state.epoch));
        self.draft.save(&dir)?;
        std::fs::write(dir.join(STATE_FILE), serde_json::to_string_pretty(state)?)?;
        info!(path = %dir.display(), step = state.global_step, "saved checkpoint");
        Ok(dir)
    }

    /// Restores weights and counters from the newest checkpoint.
    ///
    /// Optimizer moments are not checkpointed and restart from zero.
    fn resume(&mut self) -> Result<()> {
        let Some((epoch, dir)) = latest_checkpoint(&self.config.output_dir)? else {
            warn!(dir = %self.config.output_dir.display(), "no checkpoint to resume from");
            return Ok(());
        };
        self.draft.load_weights(&dir.join(WEIGHTS_FILE))?;

        // `lm_head` rows follow the checkpoint's vocabulary, so targets must too.
        let mapping = VocabMapping::from_tensors(self.draft.t2d(), self.draft.d2t())?;
        if mapping != self.mapping {
            warn!(
                path = %dir.display(),
                "checkpoint vocab mapping differs from the dataset's; training with the checkpoint's"
            );
            self.vocab = DraftVocab::new(&mapping, &self.device)?;
            self.mapping = mapping;
        }
        let state: TrainingState =
            serde_json::from_str(&std::fs::read_to_string(dir.join(STATE_FILE))?)?;
        if state.epoch != epoch {
            warn!(dir_epoch = epoch, state_epoch = state.epoch, "checkpoint epoch mismatch");
        }
        self.start_epoch = epoch + 1;
        self.global_step = state.global_step;
        self.scheduler.set_step(state.global_step);
        info!(path = %dir.display(), epoch, step = self.global_step, "resumed");
        Ok(())
    }

    pub fn draft(&self) -> &Eagle3DraftModel {
        &self.draft
    }

    /// Vocabulary mapping used for the training targets.
    pub fn vocab_mapping(&self) -> &VocabMapping {
        &self.mapping
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn scheduler(&self) -> &CosineWarmupScheduler {
        &self.scheduler
    }
}

/// Scales gradients so their global L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(vars: &[Var], grads: &mut GradStore, max_norm: f64) -> Result<f64> {
    let mut sum_sq = 0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            let sq: f32 = g.to_dtype(DType::F32)?.sqr()?.sum_all()?.to_scalar()?;
            sum_sq += f64::from(sq);
        }
    }
    let norm = sum_sq.sqrt();
    if norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            if let Some(g) = grads.get(var.as_tensor()) {
                let clipped = (g * scale)?;
                grads.insert(var.as_tensor(), clipped);
            }
        }
    }
    Ok(norm)
}

/// Newest `epoch_<n>` directory under `output_dir` holding weights.
pub fn latest_checkpoint(output_dir: &Path) -> Result<Option<(usize, PathBuf)>> {
    if !output_dir.is_dir() {
        return Ok(None);
    }
    let mut best: Option<(usize, PathBuf)> = None;
    for entry in std::fs::read_dir(output_dir)? {
        let path = entry?.path();
        let Some(epoch) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("epoch_"))
            .and_then(|n| n.parse::<usize>().ok())
        else {
            continue;
        };
        if !path.join(WEIGHTS_FILE).is_file() {
            continue;
        }
        if best.as_ref().is_none_or(|(e, _)| epoch > *e) {
            best = Some((epoch, path));
        }
    }
    Ok(best)
}

fn format_accuracies(accs: &[Option<f64>]) -> String {
    let parts: Vec<String> = accs
        .iter()
        .map(|a| match a {
            Some(a) => format!("{a:.3}"),
            None => "-".to_string(),
        })
        .collect();
    format!("[{}]", parts.join(", "))
}
