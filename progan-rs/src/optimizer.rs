//! Adam optimizer over one parameter set.
//!
//! Backward passes produce a [`GradStore`] covering every variable in the graph. The model
//! decides which optimizers receive it ([`Optimizer::accumulate`]), which is how a network is
//! frozen during another network's update: its optimizer simply never sees the gradients.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};

use crate::config::TrainingConfig;
use crate::error::{ProGanError, Result};
use crate::params::ParameterSet;

/// Minimal optimizer capability used by the training step.
pub trait Optimizer {
    /// Drop accumulated gradients.
    fn zero_grad(&mut self);

    /// Add this optimizer's gradients from `grads`, multiplied by `inv_scale`.
    fn accumulate(&mut self, grads: &GradStore, inv_scale: f64) -> Result<()>;

    /// False if any accumulated gradient holds a NaN or infinity.
    fn grads_finite(&self) -> Result<bool>;

    /// Apply accumulated gradients. A step with nothing accumulated leaves parameters unchanged.
    fn step(&mut self) -> Result<()>;

    /// Current learning rate.
    fn learning_rate(&self) -> f64;

    /// Set learning rate (used by schedulers).
    fn set_learning_rate(&mut self, lr: f64);
}

/// Optimizer configuration.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 2e-4,
            beta1: 0.0,
            beta2: 0.99,
            eps: 1e-6,
        }
    }
}

impl From<&TrainingConfig> for OptimizerConfig {
    fn from(config: &TrainingConfig) -> Self {
        Self {
            learning_rate: config.learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.eps,
        }
    }
}

impl OptimizerConfig {
    /// Build an Adam optimizer over every variable currently registered in `set`.
    ///
    /// # Errors
    ///
    /// Returns an error if the set's variable map cannot be locked.
    pub fn build_adam(&self, set: &ParameterSet) -> Result<Adam> {
        Adam::new(set, self.clone())
    }
}

struct AdamSlot {
    var: Var,
    grad: Option<Tensor>,
    m: Option<Tensor>,
    v: Option<Tensor>,
    t: i32,
}

/// Adam with per-variable moment estimates and step counters.
pub struct Adam {
    set_name: String,
    config: OptimizerConfig,
    slots: Vec<(String, AdamSlot)>,
}

impl Adam {
    /// Create an optimizer over the variables of `set`.
    pub fn new(set: &ParameterSet, config: OptimizerConfig) -> Result<Self> {
        let data = set
            .varmap()
            .data()
            .lock()
            .map_err(|_| ProGanError::training(format!("{} parameters lock poisoned", set.name())))?;

        let mut slots: Vec<(String, AdamSlot)> = data
            .iter()
            .map(|(name, var)| {
                (
                    name.clone(),
                    AdamSlot {
                        var: var.clone(),
                        grad: None,
                        m: None,
                        v: None,
                        t: 0,
                    },
                )
            })
            .collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(Self {
            set_name: set.name().to_string(),
            config,
            slots,
        })
    }

    /// Name of the parameter set this optimizer updates.
    pub fn set_name(&self) -> &str {
        &self.set_name
    }

    /// Hyperparameters.
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// True if any gradient is waiting to be applied.
    pub fn has_grads(&self) -> bool {
        self.slots.iter().any(|(_, s)| s.grad.is_some())
    }
}

impl Optimizer for Adam {
    fn zero_grad(&mut self) {
        for (_, slot) in &mut self.slots {
            slot.grad = None;
        }
    }

    fn accumulate(&mut self, grads: &GradStore, inv_scale: f64) -> Result<()> {
        for (_, slot) in &mut self.slots {
            let Some(grad) = grads.get(slot.var.as_tensor()) else {
                continue;
            };
            let grad = grad.detach();
            let grad = if inv_scale == 1.0 {
                grad
            } else {
                grad.affine(inv_scale, 0.0)?
            };
            slot.grad = Some(match slot.grad.take() {
                Some(acc) => (acc + grad)?,
                None => grad,
            });
        }
        Ok(())
    }

    fn grads_finite(&self) -> Result<bool> {
        for (_, slot) in &self.slots {
            if let Some(grad) = &slot.grad {
                let total = grad.abs()?.sum_all()?.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?;
                if !total.is_finite() {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn step(&mut self) -> Result<()> {
        let OptimizerConfig {
            learning_rate,
            beta1,
            beta2,
            eps,
        } = self.config;

        for (_, slot) in &mut self.slots {
            let Some(grad) = slot.grad.as_ref() else {
                continue;
            };
            slot.t += 1;

            // Bias correction factors
            let bc1 = 1.0 - beta1.powi(slot.t);
            let bc2 = 1.0 - beta2.powi(slot.t);

            // m = β1 * m + (1 - β1) * g
            let m_new = match &slot.m {
                Some(m) => (m.affine(beta1, 0.0)? + grad.affine(1.0 - beta1, 0.0)?)?,
                None => grad.affine(1.0 - beta1, 0.0)?,
            };

            // v = β2 * v + (1 - β2) * g²
            let grad_sq = grad.sqr()?;
            let v_new = match &slot.v {
                Some(v) => (v.affine(beta2, 0.0)? + grad_sq.affine(1.0 - beta2, 0.0)?)?,
                None => grad_sq.affine(1.0 - beta2, 0.0)?,
            };

            let m_hat = m_new.affine(1.0 / bc1, 0.0)?;
            let v_hat = v_new.affine(1.0 / bc2, 0.0)?;

            // lr * m_hat / (sqrt(v_hat) + eps)
            let denom = (v_hat.sqrt()? + eps)?;
            let update = (m_hat / denom)?.affine(learning_rate, 0.0)?;

            let new_w = (slot.var.as_tensor().detach() - update)?;
            slot.var.set(&new_w)?;

            slot.m = Some(m_new);
            slot.v = Some(v_new);
        }

        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn quadratic_set() -> (ParameterSet, candle_nn::Linear) {
        let set = ParameterSet::new("net_D");
        let linear = candle_nn::linear(2, 1, set.var_builder(&Device::Cpu).pp("fc")).unwrap();
        (set, linear)
    }

    fn weights(set: &ParameterSet) -> Vec<f32> {
        let data = set.varmap().data().lock().unwrap();
        let mut names: Vec<_> = data.keys().cloned().collect();
        names.sort();
        names
            .iter()
            .flat_map(|n| data[n].flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect()
    }

    fn loss(linear: &candle_nn::Linear) -> Tensor {
        use candle_nn::Module;
        let x = Tensor::new(&[[1.0f32, 2.0], [0.5, -1.0]], &Device::Cpu).unwrap();
        linear.forward(&x).unwrap().sqr().unwrap().mean_all().unwrap()
    }

    #[test]
    fn test_optimizer_config_default() {
        let config = OptimizerConfig::default();
        assert_eq!(config.learning_rate, 2e-4);
        assert_eq!(config.beta1, 0.0);
        assert_eq!(config.beta2, 0.99);
        assert_eq!(config.eps, 1e-6);
    }

    #[test]
    fn test_step_reduces_loss() -> Result<()> {
        let (set, linear) = quadratic_set();
        let mut opt = OptimizerConfig {
            learning_rate: 1e-2,
            ..Default::default()
        }
        .build_adam(&set)?;

        let before = loss(&linear).to_scalar::<f32>()?;
        for _ in 0..20 {
            opt.zero_grad();
            let grads = loss(&linear).backward()?;
            opt.accumulate(&grads, 1.0)?;
            opt.step()?;
        }
        let after = loss(&linear).to_scalar::<f32>()?;
        assert!(after < before);
        Ok(())
    }

    #[test]
    fn test_step_without_grads_is_noop() -> Result<()> {
        let (set, _linear) = quadratic_set();
        let mut opt = OptimizerConfig::default().build_adam(&set)?;
        let before = weights(&set);
        opt.zero_grad();
        opt.step()?;
        assert_eq!(weights(&set), before);
        assert!(!opt.has_grads());
        Ok(())
    }

    #[test]
    fn test_foreign_grads_ignored() -> Result<()> {
        let (set, _linear) = quadratic_set();
        let (_other, other_linear) = quadratic_set();
        let mut opt = OptimizerConfig::default().build_adam(&set)?;
        let before = weights(&set);

        let grads = loss(&other_linear).backward()?;
        opt.accumulate(&grads, 1.0)?;
        assert!(!opt.has_grads());
        opt.step()?;
        assert_eq!(weights(&set), before);
        Ok(())
    }

    #[test]
    fn test_accumulate_scales_and_detects_overflow() -> Result<()> {
        let (set, linear) = quadratic_set();
        let mut opt = OptimizerConfig::default().build_adam(&set)?;
        let grads = loss(&linear).affine(f64::NAN, 0.0)?.backward()?;
        opt.accumulate(&grads, 1.0)?;
        assert!(!opt.grads_finite()?);

        opt.zero_grad();
        let grads = loss(&linear).backward()?;
        opt.accumulate(&grads, 0.5)?;
        assert!(opt.grads_finite()?);
        Ok(())
    }

    #[test]
    fn test_learning_rate_setter() -> Result<()> {
        let set = ParameterSet::new("net_C");
        let _ = set.var_builder(&Device::Cpu).get((2, 2), "w")?;
        let mut opt = Adam::new(&set, OptimizerConfig::default())?;
        opt.set_learning_rate(1e-3);
        assert_eq!(opt.learning_rate(), 1e-3);
        assert_eq!(opt.set_name(), "net_C");
        Ok(())
    }
}
