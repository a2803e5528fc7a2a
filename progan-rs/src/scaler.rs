//! Dynamic loss scaling for reduced precision gradients.
//!
//! Losses are multiplied by a scale before backpropagation so small gradients survive
//! half precision, and gradients are divided by the same scale before the optimizer sees
//! them. When the unscaled gradients overflow the step is dropped and the scale backs off;
//! after a run of clean steps it grows again.
//!
//! The discriminator and the generator each get their own scaler, since their losses live
//! on very different magnitudes.

use serde::{Deserialize, Serialize};

/// Whether losses are scaled before backpropagation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossScaling {
    /// Plain backpropagation.
    #[default]
    None,
    /// One [`DynamicLossScaler`] per loss.
    Dynamic,
}

impl LossScaling {
    /// Build a scaler for one loss, if enabled.
    pub fn build(self) -> Option<DynamicLossScaler> {
        match self {
            Self::None => None,
            Self::Dynamic => Some(DynamicLossScaler::default()),
        }
    }
}

/// Gradient scaler capability.
pub trait GradientScaler {
    /// Factor the loss is multiplied by before backpropagation.
    fn scale(&self) -> f64;

    /// Record the outcome of a step. Returns `true` if the step should be applied.
    fn update(&mut self, found_non_finite: bool) -> bool;
}

/// Loss scaler that backs off on overflow and grows after a run of clean steps.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicLossScaler {
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    clean_steps: usize,
    skipped_steps: usize,
}

impl Default for DynamicLossScaler {
    fn default() -> Self {
        Self::new(65536.0, 2.0, 0.5, 2000)
    }
}

impl DynamicLossScaler {
    /// Create a scaler with explicit parameters.
    #[must_use]
    pub fn new(init_scale: f64, growth_factor: f64, backoff_factor: f64, growth_interval: usize) -> Self {
        Self {
            scale: init_scale,
            growth_factor,
            backoff_factor,
            growth_interval: growth_interval.max(1),
            clean_steps: 0,
            skipped_steps: 0,
        }
    }

    /// Steps dropped because of overflow.
    pub fn skipped_steps(&self) -> usize {
        self.skipped_steps
    }
}

impl GradientScaler for DynamicLossScaler {
    fn scale(&self) -> f64 {
        self.scale
    }

    fn update(&mut self, found_non_finite: bool) -> bool {
        if found_non_finite {
            self.scale = (self.scale * self.backoff_factor).max(1.0);
            self.clean_steps = 0;
            self.skipped_steps += 1;
            tracing::warn!("gradient overflow, loss scale reduced to {}", self.scale);
            return false;
        }

        self.clean_steps += 1;
        if self.clean_steps >= self.growth_interval {
            self.scale *= self.growth_factor;
            self.clean_steps = 0;
            tracing::debug!("loss scale increased to {}", self.scale);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_scaler() {
        let scaler = DynamicLossScaler::default();
        assert_eq!(scaler.scale(), 65536.0);
        assert_eq!(scaler.skipped_steps(), 0);
    }

    #[test]
    fn test_backoff_on_overflow() {
        let mut scaler = DynamicLossScaler::default();
        assert!(!scaler.update(true));
        assert_eq!(scaler.scale(), 32768.0);
        assert_eq!(scaler.skipped_steps(), 1);
    }

    #[test]
    fn test_growth_after_interval() {
        let mut scaler = DynamicLossScaler::new(8.0, 2.0, 0.5, 3);
        assert!(scaler.update(false));
        assert!(scaler.update(false));
        assert_eq!(scaler.scale(), 8.0);
        assert!(scaler.update(false));
        assert_eq!(scaler.scale(), 16.0);

        // overflow resets the clean run
        scaler.update(false);
        scaler.update(true);
        scaler.update(false);
        scaler.update(false);
        assert_eq!(scaler.scale(), 8.0);
    }

    #[test]
    fn test_scale_never_below_one() {
        let mut scaler = DynamicLossScaler::new(1.0, 2.0, 0.5, 10);
        scaler.update(true);
        assert_eq!(scaler.scale(), 1.0);
    }

    #[test]
    fn test_loss_scaling_build() {
        assert!(LossScaling::None.build().is_none());
        assert!(LossScaling::Dynamic.build().is_some());
    }
}
