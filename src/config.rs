//! JIT configuration.
//!
//! Every field has a default, so a config file only needs the keys it
//! changes:
//!
//! ```toml
//! max_passes = 20
//! yield_threshold = 4096
//!
//! [abi]
//! array_ptrs_off = 16
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::jit::abi::TargetAbi;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tuning knobs of the pass driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    /// Give up when lengths have not converged after this many passes.
    pub max_passes: usize,
    /// Passes from this index on pad shrinking jumps with NOPs.
    pub padding_passes: usize,
    /// Optimistic per-instruction length used to seed the offset map.
    pub initial_insn_estimate: usize,
    /// Hard limit on the native length of one instruction.
    pub max_insn_size: usize,
    /// Extra scratch reserved past the previous pass length.
    pub insn_safety: usize,
    /// Yield the thread between passes for programs at least this long.
    pub yield_threshold: usize,
    pub abi: TargetAbi,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            max_passes: 20,
            padding_passes: 15,
            initial_insn_estimate: 64,
            max_insn_size: 128,
            insn_safety: 64,
            yield_threshold: 4096,
            abi: TargetAbi::default(),
        }
    }
}

impl JitConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_passes == 0 {
            return Err(ConfigError::Invalid("max_passes must be at least 1".into()));
        }
        if self.padding_passes == 0 || self.padding_passes > self.max_passes {
            return Err(ConfigError::Invalid(format!(
                "padding_passes ({}) must be within 1..=max_passes ({})",
                self.padding_passes, self.max_passes
            )));
        }
        if self.initial_insn_estimate < self.max_insn_size / 2 {
            // The first pass must not underestimate: offsets only shrink.
            return Err(ConfigError::Invalid(format!(
                "initial_insn_estimate ({}) is too small",
                self.initial_insn_estimate
            )));
        }
        Ok(())
    }
}
