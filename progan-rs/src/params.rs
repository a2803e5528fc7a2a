//! Named parameter sets.
//!
//! Each network owns its own [`VarMap`]; the inference generator, the training generator
//! and the discriminator never share storage, so an optimizer built over one set can never
//! touch another.

use std::path::Path;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};

use crate::error::{ProGanError, Result};

/// One logical set of trainable (or averaged) parameters.
pub struct ParameterSet {
    name: String,
    varmap: VarMap,
    requires_grad: bool,
}

impl ParameterSet {
    /// Create an empty set. Variables are added when a network is built from
    /// [`ParameterSet::var_builder`].
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            varmap: VarMap::new(),
            requires_grad: true,
        }
    }

    /// Set name used in logs and checkpoint file names.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Builder that registers new variables in this set.
    pub fn var_builder(&self, device: &Device) -> VarBuilder<'static> {
        VarBuilder::from_varmap(&self.varmap, DType::F32, device)
    }

    /// Underlying variable map.
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Whether backward passes should feed this set's optimizer.
    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Enable or disable gradient delivery to this set.
    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
    }

    /// Total number of scalar parameters.
    pub fn parameter_count(&self) -> usize {
        self.varmap.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Save to a safetensors file.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.varmap.save(path)?;
        Ok(())
    }

    /// Overwrite the values of an already-built set from a safetensors file.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(ProGanError::checkpoint(format!(
                "missing weights for {}: {}",
                self.name,
                path.display()
            )));
        }
        self.varmap.load(path)?;
        Ok(())
    }
}

impl std::fmt::Debug for ParameterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterSet")
            .field("name", &self.name)
            .field("parameters", &self.parameter_count())
            .field("requires_grad", &self.requires_grad)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_count() {
        let set = ParameterSet::new("net_D");
        let vb = set.var_builder(&Device::Cpu);
        let _ = candle_nn::linear(4, 3, vb.pp("head")).unwrap();
        assert_eq!(set.parameter_count(), 4 * 3 + 3);
        assert_eq!(set.name(), "net_D");
    }

    #[test]
    fn test_requires_grad_toggle() {
        let mut set = ParameterSet::new("net_D");
        assert!(set.requires_grad());
        set.set_requires_grad(false);
        assert!(!set.requires_grad());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.safetensors");

        let a = ParameterSet::new("a");
        let la = candle_nn::linear(2, 2, a.var_builder(&Device::Cpu).pp("l")).unwrap();
        a.save(&path).unwrap();

        let mut b = ParameterSet::new("b");
        let lb = candle_nn::linear(2, 2, b.var_builder(&Device::Cpu).pp("l")).unwrap();
        b.load(&path).unwrap();

        let wa = la.weight().to_vec2::<f32>().unwrap();
        let wb = lb.weight().to_vec2::<f32>().unwrap();
        assert_eq!(wa, wb);
    }

    #[test]
    fn test_load_missing_file() {
        let mut set = ParameterSet::new("net_G");
        let err = set.load(Path::new("/nonexistent/net_G.safetensors")).unwrap_err();
        assert!(err.to_string().contains("net_G"));
    }
}
