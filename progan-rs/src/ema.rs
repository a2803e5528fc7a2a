//! Exponential moving average of generator weights.
//!
//! The inference generator is never trained directly. After every optimization step its
//! parameters are pulled toward the training generator's:
//!
//! ```text
//! target = decay * target + (1 - decay) * source
//! ```
//!
//! `decay = 0` copies the source, which is how the inference generator is initialized.

use std::collections::HashMap;

use candle_core::Var;

use crate::error::{ProGanError, Result};
use crate::params::ParameterSet;

/// Decay applied after each optimization step.
pub const DEFAULT_EMA_DECAY: f64 = 0.999;

/// Fold `source` into `target` with the given decay.
///
/// Both variable maps stay locked for the whole update, so no optimizer step can
/// interleave with a half-averaged set. All reads are detached from any graph.
///
/// # Errors
///
/// Returns [`ProGanError::ParameterMismatch`] if the two sets do not have exactly the same
/// variable names and shapes, and a configuration error if `decay` is outside `[0, 1]`.
pub fn update_average(target: &ParameterSet, source: &ParameterSet, decay: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&decay) {
        return Err(ProGanError::config(format!(
            "EMA decay must be within [0, 1], got {decay}"
        )));
    }

    if std::ptr::eq(target, source) {
        return Err(ProGanError::parameter_mismatch(
            target.name(),
            source.name(),
            "cannot average a parameter set into itself",
        ));
    }

    let target_vars = target
        .varmap()
        .data()
        .lock()
        .map_err(|_| ProGanError::training(format!("{} parameters lock poisoned", target.name())))?;
    let source_vars = source
        .varmap()
        .data()
        .lock()
        .map_err(|_| ProGanError::training(format!("{} parameters lock poisoned", source.name())))?;

    check_matching(target, source, &target_vars, &source_vars)?;

    for (name, dst) in target_vars.iter() {
        let src = &source_vars[name];
        let src = src.as_tensor().detach();
        if decay == 0.0 {
            dst.set(&src)?;
        } else {
            let old = dst.as_tensor().detach();
            let averaged = (old.affine(decay, 0.0)? + src.affine(1.0 - decay, 0.0)?)?;
            dst.set(&averaged)?;
        }
    }

    Ok(())
}

fn check_matching(
    target: &ParameterSet,
    source: &ParameterSet,
    target_vars: &HashMap<String, Var>,
    source_vars: &HashMap<String, Var>,
) -> Result<()> {
    let mismatch = |detail: String| ProGanError::parameter_mismatch(target.name(), source.name(), detail);

    if target_vars.len() != source_vars.len() {
        return Err(mismatch(format!(
            "{} variables vs {}",
            target_vars.len(),
            source_vars.len()
        )));
    }

    for (name, dst) in target_vars {
        let src = source_vars
            .get(name)
            .ok_or_else(|| mismatch(format!("{name} missing from {}", source.name())))?;
        if dst.shape() != src.shape() {
            return Err(mismatch(format!(
                "{name}: {:?} vs {:?}",
                dst.dims(),
                src.dims()
            )));
        }
    }

    Ok(())
}
