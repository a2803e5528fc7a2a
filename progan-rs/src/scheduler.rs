//! Learning rate schedulers.

use serde::{Deserialize, Serialize};

use crate::config::TrainingConfig;
use crate::optimizer::Optimizer;

/// Learning rate policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LrPolicy {
    /// Base rate for `n_epochs`, then linear decay to zero over `n_epochs_decay + 1` epochs
    #[default]
    Linear,
    /// Constant learning rate
    Constant,
}

/// Per-epoch learning rate scheduler shared by both optimizers.
#[derive(Debug, Clone)]
pub struct LRScheduler {
    policy: LrPolicy,
    base_lr: f64,
    n_epochs: usize,
    n_epochs_decay: usize,
    /// Epochs completed so far
    current_epoch: usize,
}

impl LRScheduler {
    /// Create a new scheduler.
    pub fn new(policy: LrPolicy, base_lr: f64, n_epochs: usize, n_epochs_decay: usize) -> Self {
        Self {
            policy,
            base_lr,
            n_epochs,
            n_epochs_decay,
            current_epoch: 0,
        }
    }

    /// Scheduler described by the training section of a config.
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self::new(
            config.lr_policy,
            config.learning_rate,
            config.n_epochs,
            config.n_epochs_decay,
        )
    }

    /// Learning rate after `epoch` completed epochs.
    pub fn lr_at(&self, epoch: usize) -> f64 {
        match self.policy {
            LrPolicy::Constant => self.base_lr,
            LrPolicy::Linear => {
                let decayed = (epoch + 1).saturating_sub(self.n_epochs) as f64;
                let factor = 1.0 - decayed / (self.n_epochs_decay + 1) as f64;
                self.base_lr * factor.max(0.0)
            }
        }
    }

    /// Get learning rate for the current epoch.
    pub fn get_lr(&self) -> f64 {
        self.lr_at(self.current_epoch)
    }

    /// Epochs completed so far.
    pub fn current_epoch(&self) -> usize {
        self.current_epoch
    }

    /// Jump to an epoch, e.g. when resuming from a checkpoint.
    pub fn set_epoch(&mut self, epoch: usize) {
        self.current_epoch = epoch;
    }

    /// Step the scheduler and update every optimizer. Returns the new rate.
    pub fn step(&mut self, optimizers: &mut [&mut dyn Optimizer]) -> f64 {
        let old_lr = self.get_lr();
        self.current_epoch += 1;
        let lr = self.get_lr();
        for optimizer in optimizers.iter_mut() {
            optimizer.set_learning_rate(lr);
        }
        if (lr - old_lr).abs() > f64::EPSILON {
            tracing::info!("learning rate {old_lr:.7} -> {lr:.7}");
        }
        lr
    }
}
