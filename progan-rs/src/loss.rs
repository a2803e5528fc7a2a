//! Adversarial objectives and the backpropagation guard.
//!
//! The objective is picked once, when the [`LossEngine`] is built; the training step only
//! ever calls [`LossEngine::discriminator_loss`], [`LossEngine::generator_loss`] and
//! [`LossEngine::gradient_penalty`].
//!
//! | mode       | criterion                                          |
//! |------------|----------------------------------------------------|
//! | `vanilla`  | binary cross entropy on logits                     |
//! | `lsgan`    | mean squared error against 1 / 0                   |
//! | `wgangp`   | `-mean(pred)` / `mean(pred)` plus gradient penalty |
//! | `relhinge` | relativistic hinge over real and fake jointly      |

use std::cell::Cell;
use std::fmt;
use std::str::FromStr;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::error::{ProGanError, Result};
use crate::networks::Discriminator;
use crate::schedule::TrainingState;

/// Losses whose mean magnitude exceeds this are never backpropagated.
pub const RUNAWAY_LOSS_THRESHOLD: f32 = 100.0;

/// Weight of the `mean(pred_real^2)` drift term in `wgangp` mode.
pub const DRIFT_WEIGHT: f64 = 0.001;

/// Weight of the gradient penalty in `wgangp` mode.
pub const GRADIENT_PENALTY_WEIGHT: f64 = 10.0;

/// Adversarial objective.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GanMode {
    /// Binary cross entropy on logits.
    Vanilla,
    /// Least squares.
    Lsgan,
    /// Wasserstein with gradient penalty.
    Wgangp,
    /// Relativistic hinge.
    #[default]
    #[serde(rename = "relhinge")]
    RelativisticHinge,
}

impl GanMode {
    /// Name used in configs and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vanilla => "vanilla",
            Self::Lsgan => "lsgan",
            Self::Wgangp => "wgangp",
            Self::RelativisticHinge => "relhinge",
        }
    }

    /// True for modes that score real and fake predictions jointly.
    pub fn is_relativistic(self) -> bool {
        matches!(self, Self::RelativisticHinge)
    }
}

impl fmt::Display for GanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GanMode {
    type Err = ProGanError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vanilla" => Ok(Self::Vanilla),
            "lsgan" => Ok(Self::Lsgan),
            "wgangp" => Ok(Self::Wgangp),
            "relhinge" => Ok(Self::RelativisticHinge),
            other => Err(ProGanError::config(format!(
                "gan mode {other} not implemented (expected vanilla, lsgan, wgangp or relhinge)"
            ))),
        }
    }
}

/// What a prediction is scored against.
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    /// The prediction should look real.
    Real,
    /// The prediction should look fake.
    Fake,
    /// Relativistic modes: the prediction should beat `other` on average.
    Relative(&'a Tensor),
}

/// Criterion for one adversarial mode.
#[derive(Debug, Clone, Copy)]
pub struct GanCriterion {
    mode: GanMode,
}

impl GanCriterion {
    /// Criterion for `mode`.
    pub fn new(mode: GanMode) -> Self {
        Self { mode }
    }

    /// Scalar loss of `pred` against `target`.
    ///
    /// # Errors
    ///
    /// Relativistic modes require [`Target::Relative`]; the others reject it.
    pub fn evaluate(&self, pred: &Tensor, target: Target<'_>) -> Result<Tensor> {
        match (self.mode, target) {
            (GanMode::RelativisticHinge, Target::Relative(other)) => {
                let (first, second) = relativistic_hinge_terms(pred, other)?;
                Ok((first + second)?)
            }
            (GanMode::RelativisticHinge, _) => Err(ProGanError::training(
                "relhinge criterion needs the opposing prediction",
            )),
            (mode, Target::Relative(_)) => Err(ProGanError::training(format!(
                "{mode} criterion does not take an opposing prediction"
            ))),
            (GanMode::Vanilla, target) => bce_with_logits(pred, target_value(target)),
            (GanMode::Lsgan, target) => {
                let diff = (pred - target_value(target))?;
                Ok(diff.sqr()?.mean_all()?)
            }
            (GanMode::Wgangp, Target::Real) => Ok(pred.mean_all()?.neg()?),
            (GanMode::Wgangp, _) => Ok(pred.mean_all()?),
        }
    }
}

fn target_value(target: Target<'_>) -> f64 {
    match target {
        Target::Real => 1.0,
        _ => 0.0,
    }
}

/// `max(x, 0) - x * y + log(1 + exp(-|x|))`, averaged.
fn bce_with_logits(logits: &Tensor, target: f64) -> Result<Tensor> {
    let softplus = (logits.abs()?.neg()?.exp()? + 1.0)?.log()?;
    let loss = ((logits.relu()? - logits.affine(target, 0.0)?)? + softplus)?;
    Ok(loss.mean_all()?)
}

/// `(mean(relu(1 - (pred - mean(other)))), mean(relu(1 + (other - mean(pred)))))`.
fn relativistic_hinge_terms(pred: &Tensor, other: &Tensor) -> Result<(Tensor, Tensor)> {
    let pred_mean = pred.mean_all()?;
    let other_mean = other.mean_all()?;
    let first = pred
        .broadcast_sub(&other_mean)?
        .affine(-1.0, 1.0)?
        .relu()?
        .mean_all()?;
    let second = other
        .broadcast_sub(&pred_mean)?
        .affine(1.0, 1.0)?
        .relu()?
        .mean_all()?;
    Ok((first, second))
}

/// Discriminator loss and the terms it was built from.
#[derive(Debug, Clone)]
pub struct DiscriminatorLoss {
    /// Real term (for `wgangp`, including the drift penalty).
    pub real: Tensor,
    /// Fake term.
    pub fake: Tensor,
    /// Loss to backpropagate (before any gradient penalty).
    pub total: Tensor,
}

/// Loss engine for one adversarial mode, fixed at construction.
#[derive(Debug, Clone, Copy)]
pub struct LossEngine {
    criterion: GanCriterion,
}

impl LossEngine {
    /// Engine for `mode`.
    pub fn new(mode: GanMode) -> Self {
        Self {
            criterion: GanCriterion::new(mode),
        }
    }

    /// Engine for a mode name.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unknown name.
    pub fn from_name(name: &str) -> Result<Self> {
        Ok(Self::new(name.parse()?))
    }

    /// Adversarial mode.
    pub fn mode(&self) -> GanMode {
        self.criterion.mode
    }

    /// Criterion used by this engine.
    pub fn criterion(&self) -> &GanCriterion {
        &self.criterion
    }

    /// Discriminator loss from its predictions on a real sample and a detached fake one.
    pub fn discriminator_loss(&self, pred_real: &Tensor, pred_fake: &Tensor) -> Result<DiscriminatorLoss> {
        match self.mode() {
            GanMode::RelativisticHinge => {
                let (real, fake) = relativistic_hinge_terms(pred_real, pred_fake)?;
                let total = (&real + &fake)?;
                Ok(DiscriminatorLoss { real, fake, total })
            }
            mode => {
                let fake = self.criterion.evaluate(pred_fake, Target::Fake)?;
                let mut real = self.criterion.evaluate(pred_real, Target::Real)?;
                if mode == GanMode::Wgangp {
                    let drift = pred_real.sqr()?.mean_all()?.affine(DRIFT_WEIGHT, 0.0)?;
                    real = (real + drift)?;
                }
                let total = (&fake + &real)?.affine(0.5, 0.0)?;
                Ok(DiscriminatorLoss { real, fake, total })
            }
        }
    }

    /// Generator loss from the discriminator's prediction on a live fake sample.
    ///
    /// `pred_real` is only used by relativistic modes and is always detached here.
    pub fn generator_loss(&self, pred_fake: &Tensor, pred_real: &Tensor) -> Result<Tensor> {
        if self.mode().is_relativistic() {
            let pred_real = pred_real.detach();
            self.criterion.evaluate(pred_fake, Target::Relative(&pred_real))
        } else {
            self.criterion.evaluate(pred_fake, Target::Real)
        }
    }

    /// Gradient penalty on samples interpolated between `real` and `fake`.
    ///
    /// Returns `None` outside `wgangp` mode. The penalty differentiates through the gradient
    /// with respect to the interpolated sample, see [`ensure_second_order_gradients`].
    ///
    /// # Errors
    ///
    /// Returns a configuration error if second-order gradients are unavailable on this thread.
    pub fn gradient_penalty(
        &self,
        discriminator: &dyn Discriminator,
        real: &Tensor,
        fake: &Tensor,
        state: &TrainingState,
    ) -> Result<Option<Tensor>> {
        if self.mode() != GanMode::Wgangp {
            return Ok(None);
        }
        ensure_second_order_gradients()?;

        let b = fake.dim(0)?;
        let eps = Tensor::rand(0f32, 1f32, (b, 1, 1, 1), fake.device())?.to_dtype(fake.dtype())?;
        let one_minus = eps.affine(-1.0, 1.0)?;
        let mixed = (real.detach().broadcast_mul(&eps)? + fake.detach().broadcast_mul(&one_minus)?)?;
        let x_hat = Var::from_tensor(&mixed)?;

        let hat_pred = discriminator.forward(x_hat.as_tensor(), state)?;
        let grads = hat_pred.sum_all()?.backward()?;
        let grad = grads
            .get(x_hat.as_tensor())
            .ok_or_else(|| ProGanError::training("no gradient reached the interpolated sample"))?;

        let norm = grad.flatten_from(1)?.sqr()?.sum(1)?.sqrt()?;
        let penalty = (norm - 1.0)?.sqr()?.mean_all()?;
        Ok(Some(penalty.affine(GRADIENT_PENALTY_WEIGHT, 0.0)?))
    }
}

/// Environment variable that makes candle keep the graph of computed gradients.
pub const SECOND_ORDER_ENV: &str = "CANDLE_GRAD_DO_NOT_DETACH";

thread_local! {
    static SECOND_ORDER_READY: Cell<Option<bool>> = const { Cell::new(None) };
}

/// Make gradients of gradients available on the calling thread.
///
/// candle reads [`SECOND_ORDER_ENV`] once per thread, at its first backward pass, so this has
/// to run before any backward pass on the training thread. Sets the variable unless the
/// environment already defines it, then checks that a second derivative really flows.
///
/// # Errors
///
/// Returns a configuration error if this thread already runs with detached gradients.
pub fn ensure_second_order_gradients() -> Result<()> {
    let ready = match SECOND_ORDER_READY.with(Cell::get) {
        Some(ready) => ready,
        None => {
            if std::env::var_os(SECOND_ORDER_ENV).is_none() {
                std::env::set_var(SECOND_ORDER_ENV, "1");
            }
            let ready = second_derivative_flows()?;
            SECOND_ORDER_READY.with(|cell| cell.set(Some(ready)));
            ready
        }
    };
    if ready {
        Ok(())
    } else {
        Err(ProGanError::config(format!(
            "wgangp needs second-order gradients: set {SECOND_ORDER_ENV}=1 before the first backward pass"
        )))
    }
}

/// d²/dx² of x⁴ at 1 is 12; with detached gradients candle only sees 4.
fn second_derivative_flows() -> Result<bool> {
    let x = Var::new(&[1f32], &Device::Cpu)?;
    let grads = x.as_tensor().sqr()?.sqr()?.sum_all()?.backward()?;
    let Some(grad) = grads.get(x.as_tensor()) else {
        return Ok(false);
    };
    let second = grad.sum_all()?.backward()?;
    let Some(second) = second.get(x.as_tensor()) else {
        return Ok(false);
    };
    Ok(second.to_vec1::<f32>()?.first().is_some_and(|v| *v > 8.0))
}

/// True if `loss` is finite and its mean magnitude stays under [`RUNAWAY_LOSS_THRESHOLD`].
pub fn backprop_allowed(loss: &Tensor) -> Result<bool> {
    let magnitude = loss
        .abs()?
        .mean_all()?
        .to_dtype(DType::F32)?
        .to_scalar::<f32>()?;
    Ok(magnitude.is_finite() && magnitude <= RUNAWAY_LOSS_THRESHOLD)
}

/// Backpropagate `loss * scale` unless the guard rejects it.
///
/// A rejected loss is not an error: the caller gets `None` and must leave the parameters
/// of that network untouched for this step.
pub fn guarded_backward(loss: &Tensor, scale: f64) -> Result<Option<GradStore>> {
    if !backprop_allowed(loss)? {
        tracing::warn!("skipping backpropagation of unstable loss");
        return Ok(None);
    }
    let grads = if scale == 1.0 {
        loss.backward()?
    } else {
        loss.affine(scale, 0.0)?.backward()?
    };
    Ok(Some(grads))
}

/// Read a scalar loss as `f32`.
pub fn scalar(loss: &Tensor) -> Result<f32> {
    Ok(loss.to_dtype(DType::F32)?.to_scalar::<f32>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::networks::ProgressiveDiscriminator;
    use crate::params::ParameterSet;
    use candle_core::Device;

    fn preds(values: &[f32]) -> Tensor {
        Tensor::new(values, &Device::Cpu)
            .unwrap()
            .reshape((values.len(), 1))
            .unwrap()
    }

    #[test]
    fn test_unknown_mode_is_config_error() {
        let err = LossEngine::from_name("minimax").unwrap_err();
        assert!(err.is_config());
        assert_eq!(LossEngine::from_name("relhinge").unwrap().mode(), GanMode::RelativisticHinge);
        assert_eq!(GanMode::default().to_string(), "relhinge");
    }

    #[test]
    fn test_vanilla_at_zero_logit() {
        let criterion = GanCriterion::new(GanMode::Vanilla);
        let loss = criterion.evaluate(&preds(&[0.0, 0.0]), Target::Real).unwrap();
        assert!((scalar(&loss).unwrap() - std::f32::consts::LN_2).abs() < 1e-6);
    }

    #[test]
    fn test_vanilla_stable_for_large_logits() {
        let criterion = GanCriterion::new(GanMode::Vanilla);
        let loss = criterion.evaluate(&preds(&[-500.0, 500.0]), Target::Fake).unwrap();
        let value = scalar(&loss).unwrap();
        assert!(value.is_finite());
        assert!((value - 250.0).abs() < 1e-3);
    }

    #[test]
    fn test_lsgan_targets() {
        let criterion = GanCriterion::new(GanMode::Lsgan);
        let real = criterion.evaluate(&preds(&[1.0, 3.0]), Target::Real).unwrap();
        let fake = criterion.evaluate(&preds(&[1.0, 3.0]), Target::Fake).unwrap();
        assert_eq!(scalar(&real).unwrap(), 2.0);
        assert_eq!(scalar(&fake).unwrap(), 5.0);
    }

    #[test]
    fn test_wgangp_drift_and_halving() {
        let engine = LossEngine::new(GanMode::Wgangp);
        let loss = engine
            .discriminator_loss(&preds(&[2.0, 2.0]), &preds(&[1.0, 1.0]))
            .unwrap();
        // real = -2 + 0.001 * 4, fake = 1
        assert!((scalar(&loss.real).unwrap() - (-1.996)).abs() < 1e-6);
        assert!((scalar(&loss.total).unwrap() - 0.5 * (1.0 - 1.996)).abs() < 1e-6);
    }

    #[test]
    fn test_relhinge_matching_predictions() {
        let engine = LossEngine::new(GanMode::RelativisticHinge);
        let p = preds(&[0.5, -0.5]);
        let loss = engine.discriminator_loss(&p, &p).unwrap();
        assert_eq!(scalar(&loss.total).unwrap(), 2.0);
        assert_eq!(scalar(&loss.real).unwrap(), 1.0);
        assert_eq!(scalar(&loss.fake).unwrap(), 1.0);
    }

    #[test]
    fn test_relhinge_finite_for_normal_predictions() {
        let engine = LossEngine::new(GanMode::RelativisticHinge);
        for batch in [2, 4, 16] {
            let real = Tensor::randn(0f32, 1.0, (batch, 1), &Device::Cpu).unwrap();
            let fake = Tensor::randn(0f32, 1.0, (batch, 1), &Device::Cpu).unwrap();
            let d = engine.discriminator_loss(&real, &fake).unwrap();
            let g = engine.generator_loss(&fake, &real).unwrap();
            let joint = engine
                .criterion()
                .evaluate(&real, Target::Relative(&fake))
                .unwrap();
            let total = scalar(&d.total).unwrap();
            assert!((total - scalar(&joint).unwrap()).abs() < 1e-5);
            assert!((total - scalar(&d.real).unwrap() - scalar(&d.fake).unwrap()).abs() < 1e-5);
            assert!(total.is_finite());
            assert!(scalar(&g).unwrap().is_finite());
        }
    }

    #[test]
    fn test_relhinge_generator_flips_roles() {
        let engine = LossEngine::new(GanMode::RelativisticHinge);
        let real = preds(&[3.0, 3.0]);
        let fake = preds(&[-3.0, -3.0]);
        // discriminator separates perfectly, the generator is far from fooling it
        assert_eq!(scalar(&engine.discriminator_loss(&real, &fake).unwrap().total).unwrap(), 0.0);
        assert_eq!(scalar(&engine.generator_loss(&fake, &real).unwrap()).unwrap(), 14.0);
    }

    #[test]
    fn test_criterion_rejects_wrong_target() {
        let hinge = GanCriterion::new(GanMode::RelativisticHinge);
        assert!(hinge.evaluate(&preds(&[1.0]), Target::Real).is_err());
        let lsgan = GanCriterion::new(GanMode::Lsgan);
        let other = preds(&[1.0]);
        assert!(lsgan.evaluate(&preds(&[1.0]), Target::Relative(&other)).is_err());
    }

    #[test]
    fn test_guard_rejects_non_finite_without_raising() {
        let nan = Tensor::new(f32::NAN, &Device::Cpu).unwrap();
        let inf = Tensor::new(f32::INFINITY, &Device::Cpu).unwrap();
        assert!(guarded_backward(&nan, 1.0).unwrap().is_none());
        assert!(guarded_backward(&inf, 1.0).unwrap().is_none());
    }

    #[test]
    fn test_guard_rejects_runaway_loss() {
        let big = Tensor::new(150f32, &Device::Cpu).unwrap();
        assert!(!backprop_allowed(&big).unwrap());
        let ok = Tensor::new(-99f32, &Device::Cpu).unwrap();
        assert!(backprop_allowed(&ok).unwrap());
    }

    #[test]
    fn test_guarded_backward_scales() {
        let w = Var::new(&[1f32, 2.0], &Device::Cpu).unwrap();
        let loss = w.as_tensor().sum_all().unwrap();
        let grads = guarded_backward(&loss, 4.0).unwrap().unwrap();
        let g = grads.get(w.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(g, vec![4.0, 4.0]);
    }

    #[test]
    fn test_gradient_penalty_only_in_wgangp() {
        let config = ModelConfig {
            z_dim: 4,
            max_stages: 1,
            ngf: 4,
            ndf: 4,
            input_nc: 3,
            crop_size: 8,
        };
        let set = ParameterSet::new("net_D");
        let net = ProgressiveDiscriminator::new(&config, set.var_builder(&Device::Cpu)).unwrap();
        let state = TrainingState {
            stage: 1,
            progress: 1,
            blend: 0.5,
            total_epochs: 10,
        };
        let real = Tensor::randn(0f32, 1.0, (2, 3, 8, 8), &Device::Cpu).unwrap();
        let fake = Tensor::randn(0f32, 1.0, (2, 3, 8, 8), &Device::Cpu).unwrap();

        let none = LossEngine::new(GanMode::Lsgan)
            .gradient_penalty(&net, &real, &fake, &state)
            .unwrap();
        assert!(none.is_none());

        let gp = LossEngine::new(GanMode::Wgangp)
            .gradient_penalty(&net, &real, &fake, &state)
            .unwrap()
            .unwrap();
        let value = scalar(&gp).unwrap();
        assert!(value.is_finite());
        assert!(value >= 0.0);
    }

    #[test]
    fn test_gradient_penalty_trains_discriminator() {
        let config = ModelConfig {
            z_dim: 4,
            max_stages: 1,
            ngf: 4,
            ndf: 4,
            input_nc: 3,
            crop_size: 8,
        };
        let set = ParameterSet::new("net_D");
        let net = ProgressiveDiscriminator::new(&config, set.var_builder(&Device::Cpu)).unwrap();
        let state = TrainingState {
            stage: 1,
            progress: 0,
            blend: 1.0,
            total_epochs: 10,
        };
        let real = Tensor::randn(0f32, 1.0, (2, 3, 8, 8), &Device::Cpu).unwrap();
        let fake = Tensor::randn(0f32, 1.0, (2, 3, 8, 8), &Device::Cpu).unwrap();

        let gp = LossEngine::new(GanMode::Wgangp)
            .gradient_penalty(&net, &real, &fake, &state)
            .unwrap()
            .unwrap();
        let grads = gp.backward().unwrap();

        let vars = set.varmap().all_vars();
        let reached = vars.iter().filter(|v| grads.get(v.as_tensor()).is_some()).count();
        // only the active stage's layers take part, but more than the linear head
        assert!(reached > 1, "penalty reached {reached} of {} variables", vars.len());
        let head_weight = set
            .varmap()
            .data()
            .lock()
            .unwrap()
            .get("head.conv.weight")
            .cloned()
            .unwrap();
        assert!(grads.get(head_weight.as_tensor()).is_some());
    }

    #[test]
    fn test_second_order_gradients_enabled() {
        ensure_second_order_gradients().unwrap();
        assert!(std::env::var_os(SECOND_ORDER_ENV).is_some());
        assert!(second_derivative_flows().unwrap());
    }
}
