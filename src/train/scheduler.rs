//! Warmup + cosine decay learning rate schedule.

use std::f64::consts::PI;

/// Linear warmup from 0 to `base_lr`, then cosine decay to 0 at `total_steps`.
#[derive(Debug, Clone, PartialEq)]
pub struct CosineWarmupScheduler {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    current_step: usize,
}

impl CosineWarmupScheduler {
    pub fn new(base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps: warmup_steps.min(total_steps),
            total_steps,
            current_step: 0,
        }
    }

    /// Warmup covers `ceil(total_steps * warmup_ratio)` steps.
    pub fn with_warmup_ratio(base_lr: f64, warmup_ratio: f64, total_steps: usize) -> Self {
        let warmup = (total_steps as f64 * warmup_ratio.max(0.0)).ceil() as usize;
        Self::new(base_lr, warmup, total_steps)
    }

    /// Learning rate at an arbitrary step.
    pub fn lr_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * step as f64 / self.warmup_steps as f64;
        }
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps);
        if decay_steps == 0 {
            return self.base_lr;
        }
        let progress = ((step - self.warmup_steps) as f64 / decay_steps as f64).min(1.0);
        self.base_lr * 0.5 * (1.0 + (PI * progress).cos())
    }

    /// Learning rate for the current step.
    pub fn get_lr(&self) -> f64 {
        self.lr_at(self.current_step)
    }

    pub fn step(&mut self) {
        self.current_step += 1;
    }

    /// Jumps to `step`, used when resuming.
    pub fn set_step(&mut self, step: usize) {
        self.current_step = step;
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }
}
