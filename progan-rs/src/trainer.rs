//! Training loop, checkpoints and sampling.

use std::path::{Path, PathBuf};

use candle_core::Device;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::config::ProGanConfig;
use crate::dataset::{DataSource, ImageFolderDataset};
use crate::error::{ProGanError, Result};
use crate::model::{LossRecord, Mode, ProGanModel};
use crate::schedule::TrainingState;
use crate::visuals::save_images;

/// Name of the checkpoint directory rewritten at the end of every run.
pub const LATEST_CHECKPOINT: &str = "checkpoint-latest";

/// Contents of `training_state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Completed epochs.
    pub epoch: usize,
    /// Completed optimization steps.
    pub step: usize,
    /// Position in the stage schedule for the next epoch.
    pub state: TrainingState,
    /// Learning rate for the next epoch.
    pub learning_rate: Option<f64>,
}

/// Pick the training device.
///
/// `PROGAN_FORCE_CPU=1` forces the CPU; `PROGAN_CUDA_DEVICE` selects the GPU ordinal.
pub fn select_device() -> Device {
    let force_cpu = std::env::var("PROGAN_FORCE_CPU")
        .ok()
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    let cuda_device = std::env::var("PROGAN_CUDA_DEVICE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);

    if force_cpu {
        tracing::warn!("CPU mode forced via PROGAN_FORCE_CPU=1");
        return Device::Cpu;
    }
    if !cfg!(feature = "cuda") {
        tracing::warn!("CUDA feature disabled; running on CPU. Enable with --features cuda.");
        return Device::Cpu;
    }
    match Device::cuda_if_available(cuda_device) {
        Ok(device @ Device::Cuda(_)) => {
            tracing::info!("Training device: CUDA (device {})", cuda_device);
            device
        }
        Ok(_) => {
            tracing::warn!("CUDA not available; falling back to CPU");
            Device::Cpu
        }
        Err(err) => {
            tracing::warn!("CUDA init failed ({err}); falling back to CPU");
            Device::Cpu
        }
    }
}

/// Training orchestrator.
///
/// # Example
///
/// ```no_run
/// use progan_rs::{ProGanConfig, Trainer};
///
/// # fn main() -> progan_rs::Result<()> {
/// let config = ProGanConfig::from_file("config.yaml")?;
/// let mut trainer = Trainer::new(config)?;
/// trainer.train()?;
/// # Ok(())
/// # }
/// ```
pub struct Trainer {
    config: ProGanConfig,
    device: Device,
    /// Completed epochs
    epoch: usize,
    /// Completed optimization steps
    step: usize,
    model: Option<ProGanModel>,
    /// Losses of every step of the last run
    pub loss_history: Vec<LossRecord>,
}

impl Trainer {
    /// Create a trainer on the device picked by [`select_device`].
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: ProGanConfig) -> Result<Self> {
        let device = select_device();
        Self::with_device(config, device)
    }

    /// Create a trainer on an explicit device.
    pub fn with_device(config: ProGanConfig, device: Device) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            device,
            epoch: 0,
            step: 0,
            model: None,
            loss_history: Vec::new(),
        })
    }

    fn model_mut(&mut self) -> Result<&mut ProGanModel> {
        if self.model.is_none() {
            self.model = Some(ProGanModel::new(&self.config, &self.device, Mode::Train)?);
        }
        self.model
            .as_mut()
            .ok_or_else(|| ProGanError::training("model not initialized"))
    }

    /// The model, once training or resuming has built it.
    pub fn model(&self) -> Option<&ProGanModel> {
        self.model.as_ref()
    }

    /// Completed epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Completed optimization steps.
    pub fn step(&self) -> usize {
        self.step
    }

    /// Resume training from a checkpoint directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint cannot be read or does not match the config.
    pub fn resume_from<P: AsRef<Path>>(&mut self, checkpoint: P) -> Result<()> {
        let dir = checkpoint.as_ref();
        let state_path = dir.join("training_state.json");
        let json = std::fs::read_to_string(&state_path).map_err(|e| {
            ProGanError::checkpoint(format!("failed to read {}: {e}", state_path.display()))
        })?;
        let saved: CheckpointState = serde_json::from_str(&json)?;

        let model = self.model_mut()?;
        model.load_networks(dir)?;
        model.restore_state(saved.state, saved.epoch)?;

        self.epoch = saved.epoch;
        self.step = saved.step;
        tracing::info!(
            "Loaded checkpoint from: {} (epoch={}, step={}, stage={}, blend={:.3})",
            dir.display(),
            saved.epoch,
            saved.step,
            saved.state.stage,
            saved.state.blend
        );
        Ok(())
    }

    /// Train on the image folder named in the config.
    ///
    /// # Errors
    ///
    /// Returns an error if the dataset cannot be loaded, a step fails, or a checkpoint
    /// cannot be written.
    pub fn train(&mut self) -> Result<()> {
        let mut dataset = ImageFolderDataset::open(&self.config.dataset, &self.config.model, self.config.seed)?;
        self.train_with(&mut dataset)
    }

    /// Train on any data source.
    pub fn train_with(&mut self, data: &mut dyn DataSource) -> Result<()> {
        if data.is_empty() {
            return Err(ProGanError::dataset("data source is empty"));
        }
        let last_epoch = self.config.training.n_epochs + self.config.training.n_epochs_decay;
        let batch_size = self.config.training.batch_size;
        let print_freq = self.config.training.print_freq;
        let save_freq = self.config.training.save_epoch_freq;
        let output_dir = PathBuf::from(&self.config.output_dir);
        let device = self.device.clone();
        let seed = self.config.seed;

        tracing::info!("Starting training");
        tracing::info!("  Gan mode: {}", self.config.training.gan_mode);
        tracing::info!("  Epochs: {} (+1 budget)", last_epoch);
        tracing::info!("  Images: {}", data.len());

        std::fs::create_dir_all(&output_dir)?;

        let batches_per_epoch = data.len().div_ceil(batch_size);
        let remaining = last_epoch.saturating_sub(self.epoch);
        let pb = ProgressBar::new((remaining * batches_per_epoch) as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}")?
                .progress_chars("#>-"),
        );

        self.loss_history.clear();
        let mut indices: Vec<usize> = (0..data.len()).collect();

        for epoch in (self.epoch + 1)..=last_epoch {
            let state = self.model_mut()?.state();
            tracing::info!(
                "Starting epoch {}/{} (stage {}, {}x{}, blend {:.3})",
                epoch,
                last_epoch,
                state.stage,
                state.resolution(),
                state.resolution(),
                state.blend
            );

            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
            indices.shuffle(&mut rng);

            for chunk in indices.chunks(batch_size) {
                let batch = data.load_batch(chunk, &device)?;
                let model = self.model_mut()?;
                model.set_input(&batch)?;
                model.optimize_parameters()?;
                let record = model.current_losses();
                self.step += 1;

                pb.set_message(format!("D {:.4} G {:.4}", record.d_total, record.g_total));
                pb.inc(1);

                if self.step % print_freq == 0 {
                    let losses: Vec<String> = record
                        .named()
                        .iter()
                        .map(|(name, value)| format!("{name}: {value:.4}"))
                        .collect();
                    tracing::info!(
                        "Step {}, Epoch {}, {}{}{}",
                        self.step,
                        epoch,
                        losses.join(", "),
                        if record.d_skipped { " (D skipped)" } else { "" },
                        if record.g_skipped { " (G skipped)" } else { "" }
                    );
                }
                self.loss_history.push(record);
            }

            let model = self.model_mut()?;
            let visuals = model.current_visuals()?;
            let image_dir = output_dir.join("images").join(format!("epoch_{epoch:04}"));
            save_images(&visuals.fake, &image_dir, "fake")?;
            save_images(&visuals.real, &image_dir, "real")?;

            model.advance_epoch()?;
            self.epoch = epoch;

            if epoch % save_freq == 0 {
                self.save_checkpoint(&format!("checkpoint-{epoch}"))?;
            }
        }

        pb.finish_with_message("Training complete");
        self.save_checkpoint(LATEST_CHECKPOINT)?;
        Ok(())
    }

    /// Save networks, position and config under `output_dir/<name>`.
    pub fn save_checkpoint(&mut self, name: &str) -> Result<PathBuf> {
        let dir = PathBuf::from(&self.config.output_dir).join(name);
        let (epoch, step) = (self.epoch, self.step);
        let model = self.model_mut()?;
        model.save_networks(&dir)?;

        let saved = CheckpointState {
            epoch,
            step,
            state: model.state(),
            learning_rate: model.learning_rate(),
        };
        std::fs::write(dir.join("training_state.json"), serde_json::to_string_pretty(&saved)?)?;
        self.config.to_file(dir.join("config.yaml"))?;

        tracing::info!("Saved checkpoint to: {}", dir.display());
        Ok(dir)
    }
}

/// Load the inference generator from `checkpoint` and write `count` samples to `output`.
pub fn sample(config: &ProGanConfig, checkpoint: &Path, output: &Path, count: usize, device: &Device) -> Result<Vec<PathBuf>> {
    let mut model = ProGanModel::new(config, device, Mode::Inference)?;
    model.load_networks(checkpoint)?;
    let samples = model.generate(count)?;
    let written = save_images(&samples, output, "sample")?;
    tracing::info!("Wrote {} samples to {}", written.len(), output.display());
    Ok(written)
}
