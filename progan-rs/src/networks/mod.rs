//! Progressive generator and discriminator.
//!
//! Both networks grow one block per stage. Everything stage-dependent is passed in
//! through a [`TrainingState`], never read from the network itself.

mod discriminator;
mod generator;

pub use discriminator::ProgressiveDiscriminator;
pub use generator::ProgressiveGenerator;

use candle_core::Tensor;
use candle_nn::{Conv2d, Conv2dConfig, Module, VarBuilder};

use crate::error::Result;
use crate::schedule::TrainingState;

/// Negative slope of every leaky ReLU in both networks.
pub const LEAKY_SLOPE: f64 = 0.2;

/// Anything that maps latent noise to a sample at the stage's resolution.
pub trait Generator {
    /// `latent` is `(B, z_dim, 4, 4)`; the result is `(B, C, R, R)` with `R = state.resolution()`.
    fn forward(&self, latent: &Tensor, state: &TrainingState) -> Result<Tensor>;
}

/// Anything that scores a sample at the stage's resolution.
pub trait Discriminator {
    /// `sample` is `(B, C, R, R)`; the result is `(B, 1)`.
    fn forward(&self, sample: &Tensor, state: &TrainingState) -> Result<Tensor>;
}

/// Leaky ReLU built from differentiable primitives.
pub(crate) fn leaky_relu(xs: &Tensor) -> Result<Tensor> {
    let positive = xs.relu()?;
    let negative = xs.neg()?.relu()?.affine(-LEAKY_SLOPE, 0.0)?;
    Ok((positive + negative)?)
}

/// Normalize each pixel's feature vector to unit average magnitude.
pub(crate) fn pixel_norm(xs: &Tensor) -> Result<Tensor> {
    let denom = (xs.sqr()?.mean_keepdim(1)? + 1e-8)?.sqrt()?;
    Ok(xs.broadcast_div(&denom)?)
}

/// 3x3 same-padding convolution.
pub(crate) fn conv3x3(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        ..Default::default()
    };
    Ok(candle_nn::conv2d(in_c, out_c, 3, cfg, vb)?)
}

/// 1x1 convolution used to move between image and feature space.
pub(crate) fn conv1x1(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Conv2d> {
    Ok(candle_nn::conv2d(in_c, out_c, 1, Conv2dConfig::default(), vb)?)
}

/// `blend * current + (1 - blend) * previous`.
pub(crate) fn fade(current: &Tensor, previous: &Tensor, blend: f64) -> Result<Tensor> {
    Ok((current.affine(blend, 0.0)? + previous.affine(1.0 - blend, 0.0)?)?)
}

/// Two 3x3 convolutions, each followed by leaky ReLU and optional pixel norm.
pub(crate) struct ConvPair {
    conv1: Conv2d,
    conv2: Conv2d,
    pixel_norm: bool,
}

impl ConvPair {
    pub(crate) fn new(in_c: usize, out_c: usize, pixel_norm: bool, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            conv1: conv3x3(in_c, out_c, vb.pp("conv1"))?,
            conv2: conv3x3(out_c, out_c, vb.pp("conv2"))?,
            pixel_norm,
        })
    }

    pub(crate) fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut h = leaky_relu(&self.conv1.forward(xs)?)?;
        if self.pixel_norm {
            h = pixel_norm(&h)?;
        }
        h = leaky_relu(&self.conv2.forward(&h)?)?;
        if self.pixel_norm {
            h = pixel_norm(&h)?;
        }
        Ok(h)
    }
}
