// SPDX-License-Identifier: GPL-3.0-only

//! Built-in stages
//!
//! - [`identity`]: forwards everything untouched
//! - [`padding`]: strips per-line padding octets and trailing padding lines
//!
//! Both are [`Transform`](super::stage::Transform) hooks meant to be wrapped in
//! a [`Filter`](super::stage::Filter).

pub mod identity;
pub mod padding;

pub use identity::Identity;
pub use padding::Padding;

use crate::errors::PipelineResult;

/// One-line carry buffer for stages that work on whole scan lines
///
/// Bytes are handed out one complete line at a time. Whatever does not fill a
/// line is kept until the next call.
#[derive(Debug, Default)]
pub struct LineCarry {
    line: usize,
    buf: Vec<u8>,
}

impl LineCarry {
    /// Carry for lines of `line` octets; zero disables line splitting
    pub fn new(line: usize) -> Self {
        Self {
            line,
            buf: Vec::with_capacity(line),
        }
    }

    /// Octets per line
    pub fn line_len(&self) -> usize {
        self.line
    }

    /// Octets waiting for the rest of their line
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Feed bytes, calling `emit` for every completed line
    pub fn feed<F>(&mut self, mut data: &[u8], mut emit: F) -> PipelineResult<()>
    where
        F: FnMut(&[u8]) -> PipelineResult<()>,
    {
        if self.line == 0 {
            return if data.is_empty() { Ok(()) } else { emit(data) };
        }

        if !self.buf.is_empty() {
            let take = (self.line - self.buf.len()).min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buf.len() < self.line {
                return Ok(());
            }
            emit(&self.buf)?;
            self.buf.clear();
        }

        let mut lines = data.chunks_exact(self.line);
        for line in lines.by_ref() {
            emit(line)?;
        }
        self.buf.extend_from_slice(lines.remainder());
        Ok(())
    }

    /// Drop a partial line, returning how many octets were lost
    pub fn discard(&mut self) -> usize {
        let dropped = self.buf.len();
        self.buf.clear();
        dropped
    }
}
