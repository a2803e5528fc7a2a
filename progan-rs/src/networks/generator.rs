//! Progressive generator.

use candle_core::Tensor;
use candle_nn::{Conv2d, Module, VarBuilder};

use super::{conv1x1, fade, ConvPair, Generator};
use crate::config::ModelConfig;
use crate::error::{ProGanError, Result};
use crate::resolution::upsample2x;
use crate::schedule::TrainingState;

/// Generator that grows from 4x4 to `4 * 2^max_stages`.
///
/// ```text
/// z (B, z_dim, 4, 4) -> initial -> [up -> block_1] -> ... -> [up -> block_s] -> to_rgb_s
///                                                  \-> to_rgb_{s-1} -> up ---/ (faded by blend)
/// ```
pub struct ProgressiveGenerator {
    initial: ConvPair,
    blocks: Vec<ConvPair>,
    to_rgb: Vec<Conv2d>,
    z_dim: usize,
}

impl ProgressiveGenerator {
    /// Build the generator, registering its variables under `vb`.
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let ngf = config.ngf;
        let initial = ConvPair::new(config.z_dim, ngf, true, vb.pp("initial"))?;

        let mut blocks = Vec::with_capacity(config.max_stages);
        for stage in 1..=config.max_stages {
            blocks.push(ConvPair::new(ngf, ngf, true, vb.pp(format!("blocks.{stage}")))?);
        }

        let mut to_rgb = Vec::with_capacity(config.max_stages + 1);
        for stage in 0..=config.max_stages {
            to_rgb.push(conv1x1(ngf, config.input_nc, vb.pp(format!("to_rgb.{stage}")))?);
        }

        Ok(Self {
            initial,
            blocks,
            to_rgb,
            z_dim: config.z_dim,
        })
    }

    /// Latent channels expected by [`Generator::forward`].
    pub fn z_dim(&self) -> usize {
        self.z_dim
    }

    /// Highest stage this generator can produce.
    pub fn max_stage(&self) -> usize {
        self.blocks.len()
    }
}

impl Generator for ProgressiveGenerator {
    fn forward(&self, latent: &Tensor, state: &TrainingState) -> Result<Tensor> {
        let stage = state.stage;
        if stage > self.max_stage() {
            return Err(ProGanError::training(format!(
                "generator has {} stages, asked for stage {stage}",
                self.max_stage()
            )));
        }

        let mut h = self.initial.forward(latent)?;
        if stage == 0 {
            return Ok(self.to_rgb[0].forward(&h)?);
        }

        for block in &self.blocks[..stage - 1] {
            h = block.forward(&upsample2x(&h)?)?;
        }

        let previous = upsample2x(&self.to_rgb[stage - 1].forward(&h)?)?;
        let h = self.blocks[stage - 1].forward(&upsample2x(&h)?)?;
        let current = self.to_rgb[stage].forward(&h)?;

        fade(&current, &previous, state.blend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParameterSet;
    use candle_core::Device;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            z_dim: 4,
            max_stages: 2,
            ngf: 4,
            ndf: 4,
            input_nc: 3,
            crop_size: 16,
        }
    }

    fn state(stage: usize, blend: f64) -> TrainingState {
        TrainingState {
            stage,
            progress: 0,
            blend,
            total_epochs: 20,
        }
    }

    #[test]
    fn test_output_shape_per_stage() {
        let set = ParameterSet::new("net_C");
        let net = ProgressiveGenerator::new(&tiny_config(), set.var_builder(&Device::Cpu)).unwrap();
        let z = Tensor::randn(0f32, 1.0, (2, 4, 4, 4), &Device::Cpu).unwrap();
        for stage in 0..=2 {
            let out = net.forward(&z, &state(stage, 0.5)).unwrap();
            let size = 4 << stage;
            assert_eq!(out.dims(), &[2, 3, size, size]);
        }
    }

    #[test]
    fn test_stage_out_of_range() {
        let set = ParameterSet::new("net_C");
        let net = ProgressiveGenerator::new(&tiny_config(), set.var_builder(&Device::Cpu)).unwrap();
        let z = Tensor::randn(0f32, 1.0, (1, 4, 4, 4), &Device::Cpu).unwrap();
        assert!(net.forward(&z, &state(3, 1.0)).is_err());
    }

    #[test]
    fn test_identically_built_generators_share_names() {
        let a = ParameterSet::new("net_G");
        let b = ParameterSet::new("net_C");
        let _ = ProgressiveGenerator::new(&tiny_config(), a.var_builder(&Device::Cpu)).unwrap();
        let _ = ProgressiveGenerator::new(&tiny_config(), b.var_builder(&Device::Cpu)).unwrap();
        let mut na: Vec<String> = a.varmap().data().lock().unwrap().keys().cloned().collect();
        let mut nb: Vec<String> = b.varmap().data().lock().unwrap().keys().cloned().collect();
        na.sort();
        nb.sort();
        assert_eq!(na, nb);
        assert_eq!(a.parameter_count(), b.parameter_count());
    }
}
