//! Configuration parsing and validation.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ProGanError, Result};
use crate::loss::GanMode;
use crate::scaler::LossScaling;
use crate::schedule::{resolution_for, SchedulePolicy, StageSchedule};
use crate::scheduler::LrPolicy;

/// Main configuration for a progressive GAN run.
///
/// # Example
///
/// ```rust
/// use progan_rs::ProGanConfig;
///
/// # fn main() -> progan_rs::Result<()> {
/// let mut config = ProGanConfig::from_preset("tiny")?;
/// config.training.n_epochs = 30;
/// config.validate()?;
/// assert_eq!(config.training.total_epochs(), 30 + config.training.n_epochs_decay + 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProGanConfig {
    /// Network shapes.
    #[serde(default)]
    pub model: ModelConfig,

    /// Training hyperparameters.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Dataset configuration.
    pub dataset: DatasetConfig,

    /// Output directory for checkpoints and visuals.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Random seed.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_output_dir() -> String {
    "./outputs".into()
}

fn default_seed() -> u64 {
    42
}

/// Network shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Latent channels; noise is sampled as `(B, z_dim, 4, 4)`.
    #[serde(default = "default_z_dim")]
    pub z_dim: usize,

    /// Number of growing steps; the run has `max_stages + 1` stages.
    #[serde(default = "default_max_stages")]
    pub max_stages: usize,

    /// Generator feature width.
    #[serde(default = "default_width")]
    pub ngf: usize,

    /// Discriminator feature width.
    #[serde(default = "default_width")]
    pub ndf: usize,

    /// Image channels (3 for RGB, 1 for grayscale).
    #[serde(default = "default_input_nc")]
    pub input_nc: usize,

    /// Final image size; must equal `4 * 2^max_stages`.
    #[serde(default = "default_crop_size")]
    pub crop_size: usize,
}

fn default_z_dim() -> usize {
    128
}
fn default_max_stages() -> usize {
    6
}
fn default_width() -> usize {
    512
}
fn default_input_nc() -> usize {
    3
}
fn default_crop_size() -> usize {
    256
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            z_dim: default_z_dim(),
            max_stages: default_max_stages(),
            ngf: default_width(),
            ndf: default_width(),
            input_nc: default_input_nc(),
            crop_size: default_crop_size(),
        }
    }
}

impl ModelConfig {
    /// Check network shapes.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `crop_size != 4 * 2^max_stages` or any width is zero.
    pub fn validate(&self) -> Result<()> {
        if self.z_dim == 0 || self.ngf == 0 || self.ndf == 0 {
            return Err(ProGanError::config("z_dim, ngf and ndf must be positive"));
        }
        if self.input_nc != 1 && self.input_nc != 3 {
            return Err(ProGanError::config(format!(
                "input_nc must be 1 or 3, got {}",
                self.input_nc
            )));
        }
        if self.max_stages >= 16 {
            return Err(ProGanError::config(format!(
                "max_stages {} is out of range",
                self.max_stages
            )));
        }
        let expected = resolution_for(self.max_stages);
        if self.crop_size != expected {
            return Err(ProGanError::config(format!(
                "crop_size {} does not match max_stages {} (expected 4 * 2^{} = {expected})",
                self.crop_size, self.max_stages, self.max_stages
            )));
        }
        Ok(())
    }
}

/// Training hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Epochs at the base learning rate.
    #[serde(default = "default_n_epochs")]
    pub n_epochs: usize,

    /// Epochs of linear learning-rate decay after `n_epochs`.
    #[serde(default = "default_n_epochs")]
    pub n_epochs_decay: usize,

    /// Batch size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Adam learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Adam momentum term; this family of objectives requires 0.
    #[serde(default)]
    pub beta1: f64,

    /// Adam second moment decay.
    #[serde(default = "default_beta2")]
    pub beta2: f64,

    /// Adam epsilon.
    #[serde(default = "default_eps")]
    pub eps: f64,

    /// Adversarial objective.
    #[serde(default)]
    pub gan_mode: GanMode,

    /// How epochs are split across stages.
    #[serde(default)]
    pub stage_schedule: SchedulePolicy,

    /// Decay of the inference generator's moving average.
    #[serde(default = "default_ema_decay")]
    pub ema_decay: f64,

    /// Learning-rate policy.
    #[serde(default)]
    pub lr_policy: LrPolicy,

    /// Loss scaling for reduced precision gradients.
    #[serde(default)]
    pub loss_scaling: LossScaling,

    /// Log losses every N optimization steps.
    #[serde(default = "default_print_freq")]
    pub print_freq: usize,

    /// Save a checkpoint every N epochs.
    #[serde(default = "default_save_epoch_freq")]
    pub save_epoch_freq: usize,
}

fn default_n_epochs() -> usize {
    100
}
fn default_batch_size() -> usize {
    16
}
fn default_lr() -> f64 {
    2e-4
}
fn default_beta2() -> f64 {
    0.99
}
fn default_eps() -> f64 {
    1e-6
}
fn default_ema_decay() -> f64 {
    crate::ema::DEFAULT_EMA_DECAY
}
fn default_print_freq() -> usize {
    100
}
fn default_save_epoch_freq() -> usize {
    5
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            n_epochs: default_n_epochs(),
            n_epochs_decay: default_n_epochs(),
            batch_size: default_batch_size(),
            learning_rate: default_lr(),
            beta1: 0.0,
            beta2: default_beta2(),
            eps: default_eps(),
            gan_mode: GanMode::default(),
            stage_schedule: SchedulePolicy::default(),
            ema_decay: default_ema_decay(),
            lr_policy: LrPolicy::default(),
            loss_scaling: LossScaling::default(),
            print_freq: default_print_freq(),
            save_epoch_freq: default_save_epoch_freq(),
        }
    }
}

impl TrainingConfig {
    /// Epoch budget handed to the stage schedule.
    pub fn total_epochs(&self) -> usize {
        self.n_epochs + self.n_epochs_decay + 1
    }

    /// Check optimizer and loop settings.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a non-zero `beta1` or any out-of-range value.
    pub fn validate(&self) -> Result<()> {
        if self.beta1 != 0.0 {
            return Err(ProGanError::config(format!(
                "beta1 must be 0 for progressive GAN training, got {}",
                self.beta1
            )));
        }
        if !(0.0..1.0).contains(&self.beta2) {
            return Err(ProGanError::config(format!("beta2 must be in [0, 1), got {}", self.beta2)));
        }
        if self.eps <= 0.0 {
            return Err(ProGanError::config("eps must be positive"));
        }
        if self.learning_rate <= 0.0 {
            return Err(ProGanError::config("learning_rate must be positive"));
        }
        if self.batch_size == 0 {
            return Err(ProGanError::config("batch_size must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.ema_decay) {
            return Err(ProGanError::config(format!(
                "ema_decay must be in [0, 1], got {}",
                self.ema_decay
            )));
        }
        if self.print_freq == 0 || self.save_epoch_freq == 0 {
            return Err(ProGanError::config("print_freq and save_epoch_freq must be at least 1"));
        }
        Ok(())
    }
}

/// Dataset configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Directory of training images (searched recursively).
    pub path: String,

    /// Disable random horizontal flips.
    #[serde(default)]
    pub no_flip: bool,

    /// Use at most this many images.
    #[serde(default)]
    pub max_dataset_size: Option<usize>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            path: "./data/images".into(),
            no_flip: false,
            max_dataset_size: None,
        }
    }
}

impl ProGanConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Available presets:
    /// - `"ffhq-256"` - 256x256 RGB, seven stages, 512-wide networks
    /// - `"celeba-128"` - 128x128 RGB, six stages, fibonacci schedule
    /// - `"tiny"` - 16x16, three stages, for smoke tests
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "ffhq-256" => Ok(Self::ffhq_256_preset()),
            "celeba-128" => Ok(Self::celeba_128_preset()),
            "tiny" => Ok(Self::tiny_preset()),
            _ => Err(ProGanError::config(format!("Unknown preset: {preset}"))),
        }
    }

    /// 256x256 preset with the default relativistic hinge objective.
    #[must_use]
    pub fn ffhq_256_preset() -> Self {
        Self {
            model: ModelConfig::default(),
            training: TrainingConfig::default(),
            dataset: DatasetConfig {
                path: "./data/ffhq".into(),
                ..Default::default()
            },
            output_dir: "./outputs/ffhq-256".into(),
            seed: default_seed(),
        }
    }

    /// 128x128 preset using the fibonacci stage schedule.
    #[must_use]
    pub fn celeba_128_preset() -> Self {
        Self {
            model: ModelConfig {
                max_stages: 5,
                crop_size: 128,
                ngf: 256,
                ndf: 256,
                ..Default::default()
            },
            training: TrainingConfig {
                stage_schedule: SchedulePolicy::Fibonacci,
                batch_size: 32,
                ..Default::default()
            },
            dataset: DatasetConfig {
                path: "./data/celeba".into(),
                ..Default::default()
            },
            output_dir: "./outputs/celeba-128".into(),
            seed: default_seed(),
        }
    }

    /// Small preset for smoke tests.
    #[must_use]
    pub fn tiny_preset() -> Self {
        Self {
            model: ModelConfig {
                z_dim: 8,
                max_stages: 2,
                ngf: 8,
                ndf: 8,
                input_nc: 3,
                crop_size: 16,
            },
            training: TrainingConfig {
                n_epochs: 10,
                n_epochs_decay: 9,
                batch_size: 4,
                print_freq: 10,
                save_epoch_freq: 10,
                ..Default::default()
            },
            dataset: DatasetConfig {
                path: "./data/tiny".into(),
                ..Default::default()
            },
            output_dir: "./outputs/tiny".into(),
            seed: default_seed(),
        }
    }

    /// Validate the whole configuration, including the stage schedule's epoch budget.
    ///
    /// # Errors
    ///
    /// Returns the first configuration error found.
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.training.validate()?;
        if self.dataset.path.is_empty() {
            return Err(ProGanError::config("dataset.path must not be empty"));
        }
        self.stage_schedule()?;
        Ok(())
    }

    /// Build the stage schedule described by this configuration.
    pub fn stage_schedule(&self) -> Result<StageSchedule> {
        StageSchedule::new(
            self.training.stage_schedule,
            self.model.max_stages,
            self.training.total_epochs(),
        )
    }
}
