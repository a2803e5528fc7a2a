//! Matching real samples to the current stage.
//!
//! The generator produces images at the working resolution of its stage, fading the new
//! block in against an up-sampled copy of the previous stage's output. Real samples are
//! put through the same treatment so the discriminator always compares like with like.

use candle_core::Tensor;

use crate::error::{ProGanError, Result};
use crate::schedule::TrainingState;

/// Nearest-neighbour 2x up-sampling of a `(B, C, H, W)` tensor.
///
/// Shared by the generator and [`progressive_downsample`] so both sides of the
/// discriminator see the same interpolation.
pub fn upsample2x(xs: &Tensor) -> Result<Tensor> {
    let (_, _, h, w) = xs.dims4()?;
    Ok(xs.upsample_nearest2d(h * 2, w * 2)?)
}

/// Down-sample a full resolution real batch to the working resolution of `state`.
///
/// `real` must be `(B, C, S, S)` with `S = 4 * 2^max_stage`.
pub fn progressive_downsample(real: &Tensor, state: &TrainingState, max_stage: usize) -> Result<Tensor> {
    if state.stage > max_stage {
        return Err(ProGanError::training(format!(
            "stage {} is beyond max stage {max_stage}",
            state.stage
        )));
    }
    let (_, _, h, w) = real.dims4()?;
    let full = crate::schedule::resolution_for(max_stage);
    if h != full || w != full {
        return Err(ProGanError::training(format!(
            "real batch is {h}x{w}, expected {full}x{full}"
        )));
    }

    let down_factor = 1usize << (max_stage - state.stage);
    let native = pool(real, down_factor)?;

    if state.stage == 0 {
        return Ok(native);
    }

    let prior_factor = down_factor * 2;
    let prior = upsample2x(&pool(real, prior_factor)?)?;

    let blended = (native.affine(state.blend, 0.0)? + prior.affine(1.0 - state.blend, 0.0)?)?;
    Ok(blended)
}

fn pool(xs: &Tensor, factor: usize) -> Result<Tensor> {
    if factor == 1 {
        Ok(xs.clone())
    } else {
        Ok(xs.avg_pool2d(factor)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn state(stage: usize, blend: f64) -> TrainingState {
        TrainingState {
            stage,
            progress: 0,
            blend,
            total_epochs: 20,
        }
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_output_resolution_per_stage() {
        let real = Tensor::randn(0f32, 1.0, (2, 3, 16, 16), &Device::Cpu).unwrap();
        for stage in 0..=2 {
            let out = progressive_downsample(&real, &state(stage, 0.5), 2).unwrap();
            let size = 4 << stage;
            assert_eq!(out.dims(), &[2, 3, size, size]);
        }
    }

    #[test]
    fn test_stage_zero_ignores_blend() {
        let real = Tensor::randn(0f32, 1.0, (2, 3, 16, 16), &Device::Cpu).unwrap();
        let a = progressive_downsample(&real, &state(0, 0.0), 2).unwrap();
        let b = progressive_downsample(&real, &state(0, 1.0), 2).unwrap();
        let c = progressive_downsample(&real, &state(0, 0.37), 2).unwrap();
        assert!(max_abs_diff(&a, &b) < 1e-7);
        assert!(max_abs_diff(&a, &c) < 1e-7);
    }

    #[test]
    fn test_full_blend_is_native_pool() {
        let real = Tensor::randn(0f32, 1.0, (1, 1, 16, 16), &Device::Cpu).unwrap();
        let out = progressive_downsample(&real, &state(1, 1.0), 2).unwrap();
        let native = real.avg_pool2d(2).unwrap();
        assert!(max_abs_diff(&out, &native) < 1e-6);
    }

    #[test]
    fn test_zero_blend_is_previous_stage_upsampled() {
        let real = Tensor::randn(0f32, 1.0, (1, 1, 16, 16), &Device::Cpu).unwrap();
        let out = progressive_downsample(&real, &state(2, 0.0), 2).unwrap();
        let prior = upsample2x(&real.avg_pool2d(2).unwrap()).unwrap();
        assert!(max_abs_diff(&out, &prior) < 1e-6);
    }

    #[test]
    fn test_wrong_input_size_rejected() {
        let real = Tensor::zeros((1, 3, 12, 12), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(progressive_downsample(&real, &state(0, 0.0), 2).is_err());
    }

    #[test]
    fn test_upsample2x_shape() {
        let x = Tensor::ones((1, 2, 4, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert_eq!(upsample2x(&x).unwrap().dims(), &[1, 2, 8, 8]);
    }
}
