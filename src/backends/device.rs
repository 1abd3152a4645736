// SPDX-License-Identifier: GPL-3.0-only

//! Devices a session acquires from

use super::options::{MapOptions, OptionSource};
use super::source::{RawImageSource, ScriptedSource, Source};
use crate::errors::{PipelineError, PipelineResult};
use crate::pipelines::context::Context;
use std::collections::VecDeque;
use std::path::PathBuf;
use tracing::debug;

/// Something that can be scanned from
///
/// A session opens one source per sequence and reads the device options when
/// it builds the stages for that sequence.
pub trait Device: Send {
    /// Open the source for a new sequence
    fn open(&mut self) -> PipelineResult<Box<dyn Source>>;

    /// Options consulted when building stages
    fn options(&self) -> &dyn OptionSource;
}

/// Device serving a raw sample file, one image per sequence
#[derive(Debug, Clone)]
pub struct RawFileDevice {
    path: PathBuf,
    ctx: Context,
    options: MapOptions,
}

impl RawFileDevice {
    pub fn new(path: impl Into<PathBuf>, ctx: Context, options: MapOptions) -> Self {
        Self {
            path: path.into(),
            ctx,
            options,
        }
    }
}

impl Device for RawFileDevice {
    fn open(&mut self) -> PipelineResult<Box<dyn Source>> {
        debug!(path = %self.path.display(), "Opening raw file device");
        Ok(Box::new(RawImageSource::open(&self.path, self.ctx.clone())?))
    }

    fn options(&self) -> &dyn OptionSource {
        &self.options
    }
}

/// Device handing out prepared scripts, one per sequence
#[derive(Debug, Default)]
pub struct ScriptedDevice {
    scripts: VecDeque<ScriptedSource>,
    options: MapOptions,
}

impl ScriptedDevice {
    pub fn new(scripts: impl IntoIterator<Item = ScriptedSource>, options: MapOptions) -> Self {
        Self {
            scripts: scripts.into_iter().collect(),
            options,
        }
    }

    /// Sequences not yet opened
    pub fn remaining(&self) -> usize {
        self.scripts.len()
    }
}

impl Device for ScriptedDevice {
    fn open(&mut self) -> PipelineResult<Box<dyn Source>> {
        match self.scripts.pop_front() {
            Some(script) => Ok(Box::new(script)),
            None => Err(PipelineError::Source("no scripted sequence left".into())),
        }
    }

    fn options(&self) -> &dyn OptionSource {
        &self.options
    }
}
