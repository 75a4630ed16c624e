//! Online EAGLE3 training.
//!
//! - [`loss`]: target distribution, soft cross-entropy and accuracy per TTT step
//! - [`scheduler`]: warmup + cosine learning rate
//! - [`trainer`]: the training loop, evaluation and checkpoints

pub mod loss;
pub mod scheduler;
pub mod trainer;

pub use loss::{
    DraftVocab, STEP_WEIGHT_DECAY, TttTargets, accuracy, shift_left, soft_cross_entropy,
    step_weight, target_distribution,
};
pub use scheduler::CosineWarmupScheduler;
pub use trainer::{
    Eagle3Trainer, EvalMetrics, StepMetrics, TrainSummary, TrainingState, clip_grad_norm,
    latest_checkpoint,
};
