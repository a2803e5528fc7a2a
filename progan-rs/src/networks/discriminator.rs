//! Progressive discriminator.

use candle_core::Tensor;
use candle_nn::{Conv2d, Conv2dConfig, Linear, Module, VarBuilder};

use super::{conv1x1, conv3x3, fade, leaky_relu, ConvPair, Discriminator};
use crate::config::ModelConfig;
use crate::error::{ProGanError, Result};
use crate::schedule::{resolution_for, TrainingState};

/// Discriminator mirroring [`super::ProgressiveGenerator`].
///
/// ```text
/// x (R x R) -> from_rgb_s -> block_s (down) -\
/// x -> avgpool -> from_rgb_{s-1} ------------+-> fade -> block_{s-1} ... block_1 -> head
/// ```
pub struct ProgressiveDiscriminator {
    from_rgb: Vec<Conv2d>,
    blocks: Vec<ConvPair>,
    head_conv: Conv2d,
    head_down: Conv2d,
    head_linear: Linear,
    input_nc: usize,
}

impl ProgressiveDiscriminator {
    /// Build the discriminator, registering its variables under `vb`.
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let ndf = config.ndf;

        let mut from_rgb = Vec::with_capacity(config.max_stages + 1);
        for stage in 0..=config.max_stages {
            from_rgb.push(conv1x1(config.input_nc, ndf, vb.pp(format!("from_rgb.{stage}")))?);
        }

        let mut blocks = Vec::with_capacity(config.max_stages);
        for stage in 1..=config.max_stages {
            blocks.push(ConvPair::new(ndf, ndf, false, vb.pp(format!("blocks.{stage}")))?);
        }

        // one extra channel carries the minibatch standard deviation
        let head_conv = conv3x3(ndf + 1, ndf, vb.pp("head.conv"))?;
        let head_down = candle_nn::conv2d(ndf, ndf, 4, Conv2dConfig::default(), vb.pp("head.down"))?;
        let head_linear = candle_nn::linear(ndf, 1, vb.pp("head.linear"))?;

        Ok(Self {
            from_rgb,
            blocks,
            head_conv,
            head_down,
            head_linear,
            input_nc: config.input_nc,
        })
    }

    /// Highest stage this discriminator can score.
    pub fn max_stage(&self) -> usize {
        self.blocks.len()
    }

    fn from_rgb(&self, stage: usize, xs: &Tensor) -> Result<Tensor> {
        leaky_relu(&self.from_rgb[stage].forward(xs)?)
    }

    fn down_block(&self, stage: usize, xs: &Tensor) -> Result<Tensor> {
        Ok(self.blocks[stage - 1].forward(xs)?.avg_pool2d(2)?)
    }

    fn head(&self, xs: &Tensor) -> Result<Tensor> {
        let h = minibatch_stddev(xs)?;
        let h = leaky_relu(&self.head_conv.forward(&h)?)?;
        let h = leaky_relu(&self.head_down.forward(&h)?)?;
        Ok(self.head_linear.forward(&h.flatten_from(1)?)?)
    }
}

impl Discriminator for ProgressiveDiscriminator {
    fn forward(&self, sample: &Tensor, state: &TrainingState) -> Result<Tensor> {
        let stage = state.stage;
        if stage > self.max_stage() {
            return Err(ProGanError::training(format!(
                "discriminator has {} stages, asked for stage {stage}",
                self.max_stage()
            )));
        }
        let (_, c, h, w) = sample.dims4()?;
        let expected = resolution_for(stage);
        if c != self.input_nc || h != expected || w != expected {
            return Err(ProGanError::training(format!(
                "discriminator at stage {stage} expects ({}, {expected}, {expected}), got ({c}, {h}, {w})",
                self.input_nc
            )));
        }

        let mut h = self.from_rgb(stage, sample)?;
        if stage > 0 {
            let current = self.down_block(stage, &h)?;
            let skip = self.from_rgb(stage - 1, &sample.avg_pool2d(2)?)?;
            h = fade(&current, &skip, state.blend)?;
            for s in (1..stage).rev() {
                h = self.down_block(s, &h)?;
            }
        }

        self.head(&h)
    }
}

/// Append the batch-wide feature standard deviation as one constant channel.
fn minibatch_stddev(xs: &Tensor) -> Result<Tensor> {
    let (b, _, h, w) = xs.dims4()?;
    let mean = xs.mean_keepdim(0)?;
    let var = xs.broadcast_sub(&mean)?.sqr()?.mean_keepdim(0)?;
    let std = (var + 1e-8)?.sqrt()?.mean_all()?;
    let feature = std.reshape((1, 1, 1, 1))?.broadcast_as((b, 1, h, w))?.contiguous()?;
    Ok(Tensor::cat(&[xs, &feature], 1)?)
}
