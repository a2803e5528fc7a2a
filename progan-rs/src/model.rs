//! The progressive GAN model: three parameter sets, two optimizers, one training step.
//!
//! `net_G` is the inference generator and only ever changes through
//! [`crate::ema::update_average`]. `net_C` is the generator that is trained, `net_D` the
//! discriminator. In inference mode only `net_G` exists.

use std::path::{Path, PathBuf};

use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor};

use crate::config::ProGanConfig;
use crate::dataset::ImageBatch;
use crate::ema::update_average;
use crate::error::{ProGanError, Result};
use crate::loss::{ensure_second_order_gradients, guarded_backward, scalar, GanMode, LossEngine};
use crate::networks::{Discriminator, Generator, ProgressiveDiscriminator, ProgressiveGenerator};
use crate::optimizer::{Adam, Optimizer, OptimizerConfig};
use crate::params::ParameterSet;
use crate::resolution::progressive_downsample;
use crate::scaler::{DynamicLossScaler, GradientScaler};
use crate::scheduler::LRScheduler;
use crate::schedule::{StageSchedule, TrainingState, BASE_RESOLUTION};

/// Whether the model is built for training or only for sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Build all three networks and the optimizers.
    Train,
    /// Build only the inference generator.
    Inference,
}

/// Losses of the last training step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossRecord {
    /// Discriminator loss on real samples.
    pub d_real: f32,
    /// Discriminator loss on generated samples.
    pub d_fake: f32,
    /// Total discriminator loss, gradient penalty included.
    pub d_total: f32,
    /// Generator adversarial loss.
    pub g_total: f32,
    /// Gradient penalty (`wgangp` only).
    pub d_gradient_penalty: Option<f32>,
    /// The discriminator update was skipped this step.
    pub d_skipped: bool,
    /// The generator update was skipped this step.
    pub g_skipped: bool,
}

impl LossRecord {
    /// Named loss values for logging.
    pub fn named(&self) -> Vec<(&'static str, f32)> {
        let mut named = vec![
            ("G_GAN", self.g_total),
            ("D_real", self.d_real),
            ("D_fake", self.d_fake),
            ("D", self.d_total),
        ];
        if let Some(gp) = self.d_gradient_penalty {
            named.push(("D_gradpen", gp));
        }
        named
    }
}

/// Latest generated and real samples at the working resolution.
#[derive(Debug, Clone)]
pub struct Visuals {
    /// Generated batch.
    pub fake: Tensor,
    /// Real batch after resolution matching.
    pub real: Tensor,
}

struct TrainingParts {
    net_c: ProgressiveGenerator,
    params_c: ParameterSet,
    net_d: ProgressiveDiscriminator,
    params_d: ParameterSet,
    optimizer_c: Adam,
    optimizer_d: Adam,
    scaler_d: Option<DynamicLossScaler>,
    scaler_g: Option<DynamicLossScaler>,
    lr_scheduler: LRScheduler,
}

impl TrainingParts {
    /// Hand a backward pass to every optimizer whose set currently takes gradients.
    fn route(&mut self, grads: &GradStore, inv_scale: f64) -> Result<()> {
        if self.params_d.requires_grad() {
            self.optimizer_d.accumulate(grads, inv_scale)?;
        }
        if self.params_c.requires_grad() {
            self.optimizer_c.accumulate(grads, inv_scale)?;
        }
        Ok(())
    }
}

/// Progressive GAN model.
///
/// # Example
///
/// ```no_run
/// use candle_core::Device;
/// use progan_rs::{Mode, ProGanConfig, ProGanModel};
///
/// # fn main() -> progan_rs::Result<()> {
/// let config = ProGanConfig::from_preset("tiny")?;
/// let model = ProGanModel::new(&config, &Device::Cpu, Mode::Inference)?;
/// let samples = model.generate(4)?;
/// assert_eq!(samples.dims(), &[4, 3, 16, 16]);
/// # Ok(())
/// # }
/// ```
pub struct ProGanModel {
    config: ProGanConfig,
    device: Device,
    mode: Mode,
    net_g: ProgressiveGenerator,
    params_g: ParameterSet,
    training: Option<TrainingParts>,
    losses: LossEngine,
    schedule: StageSchedule,
    state: TrainingState,
    real: Option<Tensor>,
    image_paths: Vec<PathBuf>,
    fake: Option<Tensor>,
    record: LossRecord,
}

impl ProGanModel {
    /// Build the model.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the image size does not match the stage count,
    /// `beta1` is not 0 (training only), or the epoch budget cannot cover the schedule.
    /// Training in `wgangp` mode also fails if second-order gradients cannot be enabled on
    /// this thread.
    pub fn new(config: &ProGanConfig, device: &Device, mode: Mode) -> Result<Self> {
        config.model.validate()?;
        if mode == Mode::Train {
            config.training.validate()?;
            if config.training.gan_mode == GanMode::Wgangp {
                ensure_second_order_gradients()?;
            }
        }
        let schedule = config.stage_schedule()?;
        let losses = LossEngine::new(config.training.gan_mode);

        let mut params_g = ParameterSet::new("net_G");
        let net_g = ProgressiveGenerator::new(&config.model, params_g.var_builder(device))?;
        params_g.set_requires_grad(false);

        let training = match mode {
            Mode::Train => Some(Self::build_training_parts(config, device)?),
            Mode::Inference => None,
        };

        if let Some(parts) = &training {
            tracing::info!(
                "net_C: {} parameters, net_D: {} parameters",
                parts.params_c.parameter_count(),
                parts.params_d.parameter_count()
            );
            update_average(&params_g, &parts.params_c, 0.0)?;
        }
        tracing::info!(
            "net_G: {} parameters, gan mode {}",
            params_g.parameter_count(),
            losses.mode()
        );

        Ok(Self {
            config: config.clone(),
            device: device.clone(),
            mode,
            net_g,
            params_g,
            training,
            losses,
            state: schedule.initial_state(),
            schedule,
            real: None,
            image_paths: Vec::new(),
            fake: None,
            record: LossRecord::default(),
        })
    }

    fn build_training_parts(config: &ProGanConfig, device: &Device) -> Result<TrainingParts> {
        let params_c = ParameterSet::new("net_C");
        let net_c = ProgressiveGenerator::new(&config.model, params_c.var_builder(device))?;
        let params_d = ParameterSet::new("net_D");
        let net_d = ProgressiveDiscriminator::new(&config.model, params_d.var_builder(device))?;

        let opt_config = OptimizerConfig::from(&config.training);
        let optimizer_c = opt_config.build_adam(&params_c)?;
        let optimizer_d = opt_config.build_adam(&params_d)?;

        Ok(TrainingParts {
            net_c,
            params_c,
            net_d,
            params_d,
            optimizer_c,
            optimizer_d,
            scaler_d: config.training.loss_scaling.build(),
            scaler_g: config.training.loss_scaling.build(),
            lr_scheduler: LRScheduler::from_config(&config.training),
        })
    }

    fn parts(&self) -> Result<&TrainingParts> {
        self.training
            .as_ref()
            .ok_or_else(|| ProGanError::training("model was built for inference only"))
    }

    /// Take a full resolution real batch and match it to the current stage.
    pub fn set_input(&mut self, batch: &ImageBatch) -> Result<()> {
        let images = batch.images.to_device(&self.device)?;
        let real = progressive_downsample(&images, &self.state, self.schedule.max_stage())?;
        self.real = Some(real);
        self.image_paths = batch.paths.clone();
        Ok(())
    }

    /// Generate a batch the size of the current input.
    ///
    /// Training mode uses `net_C` at the current stage; inference mode uses `net_G` fully grown.
    pub fn forward(&mut self) -> Result<()> {
        let real = self
            .real
            .as_ref()
            .ok_or_else(|| ProGanError::training("forward called before set_input"))?;
        let batch_size = real.dim(0)?;
        let z = self.sample_latent(batch_size)?;

        let fake = match &self.training {
            Some(parts) => parts.net_c.forward(&z, &self.state)?,
            None => self
                .net_g
                .forward(&z, &self.schedule.terminal_state())?
                .detach(),
        };
        self.fake = Some(fake);
        Ok(())
    }

    /// One full optimization step: discriminator update, generator update, weight averaging.
    pub fn optimize_parameters(&mut self) -> Result<()> {
        self.forward()?;

        let state = self.state;
        let losses = self.losses;
        let ema_decay = self.config.training.ema_decay;
        let (Some(real), Some(fake)) = (self.real.clone(), self.fake.clone()) else {
            return Err(ProGanError::training("no batch to optimize on"));
        };
        let parts = self
            .training
            .as_mut()
            .ok_or_else(|| ProGanError::training("model was built for inference only"))?;

        // discriminator
        parts.params_d.set_requires_grad(true);
        parts.optimizer_d.zero_grad();
        let pred_fake = parts.net_d.forward(&fake.detach(), &state)?;
        let pred_real = parts.net_d.forward(&real, &state)?;
        let d_loss = losses.discriminator_loss(&pred_real, &pred_fake)?;
        let penalty = losses.gradient_penalty(&parts.net_d, &real, &fake, &state)?;
        let d_total = match &penalty {
            Some(gp) => (&d_loss.total + gp)?,
            None => d_loss.total.clone(),
        };

        let d_scale = parts.scaler_d.as_ref().map_or(1.0, |s| s.scale());
        let mut d_skipped = true;
        if let Some(grads) = guarded_backward(&d_total, d_scale)? {
            parts.route(&grads, 1.0 / d_scale)?;
            d_skipped = !accept_step(&mut parts.optimizer_d, parts.scaler_d.as_mut())?;
        }
        parts.optimizer_d.step()?;

        // generator
        parts.params_d.set_requires_grad(false);
        parts.optimizer_c.zero_grad();
        let pred_fake = parts.net_d.forward(&fake, &state)?;
        let g_loss = losses.generator_loss(&pred_fake, &pred_real)?;

        let g_scale = parts.scaler_g.as_ref().map_or(1.0, |s| s.scale());
        let mut g_skipped = true;
        if let Some(grads) = guarded_backward(&g_loss, g_scale)? {
            parts.route(&grads, 1.0 / g_scale)?;
            g_skipped = !accept_step(&mut parts.optimizer_c, parts.scaler_g.as_mut())?;
        }
        parts.optimizer_c.step()?;

        update_average(&self.params_g, &parts.params_c, ema_decay)?;

        self.record = LossRecord {
            d_real: scalar(&d_loss.real)?,
            d_fake: scalar(&d_loss.fake)?,
            d_total: scalar(&d_total)?,
            g_total: scalar(&g_loss)?,
            d_gradient_penalty: penalty.as_ref().map(scalar).transpose()?,
            d_skipped,
            g_skipped,
        };
        tracing::debug!("optimization step: {:?}", self.record);
        Ok(())
    }

    /// End of epoch: step the learning rates, then advance the stage schedule.
    pub fn advance_epoch(&mut self) -> Result<TrainingState> {
        if let Some(parts) = self.training.as_mut() {
            let TrainingParts {
                optimizer_c,
                optimizer_d,
                lr_scheduler,
                ..
            } = parts;
            let mut optimizers: [&mut dyn Optimizer; 2] = [optimizer_c, optimizer_d];
            lr_scheduler.step(&mut optimizers);
        }
        self.state = self.schedule.advance(&self.state);
        Ok(self.state)
    }

    /// Losses of the last optimization step.
    pub fn current_losses(&self) -> LossRecord {
        self.record.clone()
    }

    /// Last generated batch and the matching real batch.
    pub fn current_visuals(&self) -> Result<Visuals> {
        match (&self.fake, &self.real) {
            (Some(fake), Some(real)) => Ok(Visuals {
                fake: fake.detach(),
                real: real.clone(),
            }),
            _ => Err(ProGanError::training("no visuals before the first forward pass")),
        }
    }

    /// Paths of the samples in the current input.
    pub fn image_paths(&self) -> &[PathBuf] {
        &self.image_paths
    }

    /// Sample `count` images from the inference generator at full resolution.
    pub fn generate(&self, count: usize) -> Result<Tensor> {
        if count == 0 {
            return Err(ProGanError::training("cannot generate an empty batch"));
        }
        let z = self.sample_latent(count)?;
        Ok(self
            .net_g
            .forward(&z, &self.schedule.terminal_state())?
            .detach())
    }

    fn sample_latent(&self, batch_size: usize) -> Result<Tensor> {
        Ok(Tensor::randn(
            0f32,
            1f32,
            (
                batch_size,
                self.config.model.z_dim,
                BASE_RESOLUTION,
                BASE_RESOLUTION,
            ),
            &self.device,
        )?)
    }

    fn parameter_sets(&self) -> Vec<&ParameterSet> {
        let mut sets = vec![&self.params_g];
        if let Some(parts) = &self.training {
            sets.push(&parts.params_c);
            sets.push(&parts.params_d);
        }
        sets
    }

    /// Save every network of this mode as `<dir>/<name>.safetensors`.
    pub fn save_networks(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        for set in self.parameter_sets() {
            let path = dir.join(format!("{}.safetensors", set.name()));
            set.save(&path)?;
            tracing::debug!("saved {} to {}", set.name(), path.display());
        }
        Ok(())
    }

    /// Load every network of this mode from `<dir>/<name>.safetensors`.
    pub fn load_networks(&mut self, dir: &Path) -> Result<()> {
        self.params_g.load(&dir.join("net_G.safetensors"))?;
        if let Some(parts) = self.training.as_mut() {
            parts.params_c.load(&dir.join("net_C.safetensors"))?;
            parts.params_d.load(&dir.join("net_D.safetensors"))?;
        }
        tracing::info!("loaded networks from {}", dir.display());
        Ok(())
    }

    /// Continue from a saved position: `epochs_done` completed epochs ending at `state`.
    pub fn restore_state(&mut self, state: TrainingState, epochs_done: usize) -> Result<()> {
        if state.stage > self.schedule.max_stage() || !(0.0..=1.0).contains(&state.blend) {
            return Err(ProGanError::checkpoint(format!(
                "saved state {state:?} does not fit a schedule with max stage {}",
                self.schedule.max_stage()
            )));
        }
        if state.total_epochs != self.schedule.total_epochs() {
            tracing::warn!(
                "checkpoint was trained with an epoch budget of {}, config says {}",
                state.total_epochs,
                self.schedule.total_epochs()
            );
        }
        self.state = TrainingState {
            total_epochs: self.schedule.total_epochs(),
            ..state
        };
        if let Some(parts) = self.training.as_mut() {
            parts.lr_scheduler.set_epoch(epochs_done);
            let lr = parts.lr_scheduler.get_lr();
            parts.optimizer_c.set_learning_rate(lr);
            parts.optimizer_d.set_learning_rate(lr);
        }
        Ok(())
    }

    /// Current position in the stage schedule.
    pub fn state(&self) -> TrainingState {
        self.state
    }

    /// Stage schedule of this run.
    pub fn schedule(&self) -> &StageSchedule {
        &self.schedule
    }

    /// Build mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Adversarial mode.
    pub fn gan_mode(&self) -> GanMode {
        self.losses.mode()
    }

    /// Device the networks live on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Configuration the model was built from.
    pub fn config(&self) -> &ProGanConfig {
        &self.config
    }

    /// Learning rate of the generator optimizer, if training.
    pub fn learning_rate(&self) -> Option<f64> {
        self.training.as_ref().map(|p| p.optimizer_c.learning_rate())
    }

    /// Inference generator parameters.
    pub fn inference_parameters(&self) -> &ParameterSet {
        &self.params_g
    }

    /// Trained generator parameters.
    pub fn generator_parameters(&self) -> Result<&ParameterSet> {
        Ok(&self.parts()?.params_c)
    }

    /// Discriminator parameters.
    pub fn discriminator_parameters(&self) -> Result<&ParameterSet> {
        Ok(&self.parts()?.params_d)
    }
}

impl std::fmt::Debug for ProGanModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProGanModel")
            .field("mode", &self.mode)
            .field("gan_mode", &self.losses.mode())
            .field("device", &self.device)
            .field("state", &self.state)
            .field("parameter_sets", &self.parameter_sets())
            .finish()
    }
}

/// Decide whether accumulated gradients may be applied, consulting the loss scaler.
///
/// Rejected gradients are dropped so the following `step` leaves parameters unchanged.
fn accept_step(optimizer: &mut Adam, scaler: Option<&mut DynamicLossScaler>) -> Result<bool> {
    let Some(scaler) = scaler else {
        return Ok(true);
    };
    let finite = optimizer.grads_finite()?;
    if scaler.update(!finite) {
        Ok(true)
    } else {
        optimizer.zero_grad();
        Ok(false)
    }
}
