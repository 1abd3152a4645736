// SPDX-License-Identifier: GPL-3.0-only

use crate::constants::{
    APP_NAME, DEFAULT_CACHE_HIGH_WATER, DEFAULT_HELPER_WAIT, DEFAULT_SHELL, DEFAULT_SOURCE_CHUNK,
};
use crate::errors::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Pipeline tuning knobs
///
/// Every field has a default, so a config file only needs to name what it
/// changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Shell interpreting helper command lines
    pub shell: String,
    /// Bytes requested from the source per pull
    pub source_chunk_size: usize,
    /// Longest readiness wait of a helper stage, in milliseconds
    pub helper_wait_ms: u64,
    /// Queued bytes in the bridge above which a warning is logged
    pub cache_high_water: usize,
    /// Helper program appended to the default chain, if any
    pub helper_program: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            shell: DEFAULT_SHELL.to_string(),
            source_chunk_size: DEFAULT_SOURCE_CHUNK,
            helper_wait_ms: DEFAULT_HELPER_WAIT.as_millis() as u64,
            cache_high_water: DEFAULT_CACHE_HIGH_WATER,
            helper_program: None,
        }
    }
}

impl PipelineConfig {
    /// Location of the per-user config file
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_NAME).join("config.json"))
    }

    /// Parse and validate a JSON document
    pub fn from_json(text: &str) -> PipelineResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate the config file at `path`
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config = Self::from_json(&text)?;
        info!(path = %path.display(), "Loaded pipeline config");
        Ok(config)
    }

    /// The per-user config if there is one, defaults otherwise
    ///
    /// A config file that exists but does not parse is still an error.
    pub fn load_or_default() -> PipelineResult<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                debug!("No pipeline config file, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Pretty-printed JSON form
    pub fn to_json(&self) -> PipelineResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> PipelineResult<()> {
        if self.shell.trim().is_empty() {
            return Err(PipelineError::Config("shell must not be empty".into()));
        }
        if self.source_chunk_size == 0 {
            return Err(PipelineError::Config(
                "source_chunk_size must be positive".into(),
            ));
        }
        if self
            .helper_program
            .as_deref()
            .is_some_and(|p| p.trim().is_empty())
        {
            return Err(PipelineError::Config(
                "helper_program must not be empty".into(),
            ));
        }
        Ok(())
    }
}
