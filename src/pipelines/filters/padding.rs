// SPDX-License-Identifier: GPL-3.0-only

//! Padding removal
//!
//! Scanners often pad every scan line to a transfer boundary and may append
//! a few lines at the end of an image. This stage cuts both away so that the
//! downstream sees tightly packed lines.

use super::LineCarry;
use crate::errors::PipelineResult;
use crate::pipelines::context::Context;
use crate::pipelines::stage::{Filter, Output, Transform};
use tracing::{debug, warn};

/// Strips per-line padding octets and trailing padding lines
#[derive(Debug, Default)]
pub struct Padding {
    carry: LineCarry,
    /// Octets kept from each incoming line
    scan: usize,
    /// Lines to keep, `None` when the height is unknown
    keep_lines: Option<u64>,
    lines_out: u64,
    passthrough: bool,
}

impl Padding {
    /// Create a padding stage
    pub fn new() -> Self {
        Self::default()
    }

    /// Padding wrapped as a ready-to-push stage
    pub fn stage() -> Filter<Padding> {
        Filter::new(Padding::new())
    }
}

impl Transform for Padding {
    fn name(&self) -> &str {
        "padding"
    }

    fn estimate(&mut self, ctx: &Context) -> Context {
        self.lines_out = 0;
        self.carry.discard();

        let line = ctx.octets_per_line();
        self.passthrough = !ctx.is_raster()
            || line.is_none()
            || (ctx.padding_octets == 0 && ctx.padding_lines == 0);

        if self.passthrough {
            self.carry = LineCarry::new(0);
            return ctx.clone();
        }

        self.scan = ctx.scan_width().unwrap_or_default();
        self.carry = LineCarry::new(line.unwrap_or_default());
        self.keep_lines = ctx.height.map(u64::from);
        debug!(
            scan = self.scan,
            line = self.carry.line_len(),
            padding_octets = ctx.padding_octets,
            padding_lines = ctx.padding_lines,
            "Stripping padding"
        );

        ctx.clone().with_padding(0, 0)
    }

    fn transform(&mut self, data: &[u8], out: &mut dyn Output) -> PipelineResult<()> {
        if self.passthrough {
            return out.write_all(data);
        }

        let Self {
            carry,
            scan,
            keep_lines,
            lines_out,
            ..
        } = self;

        carry.feed(data, |line| {
            if keep_lines.is_some_and(|keep| *lines_out >= keep) {
                return Ok(());
            }
            *lines_out += 1;
            out.write_all(&line[..*scan])
        })
    }

    fn flush(&mut self, _out: &mut dyn Output) -> PipelineResult<()> {
        let dropped = self.carry.discard();
        if dropped > 0 {
            warn!(dropped, "Partial scan line at end-of-image dropped");
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.carry.discard();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipelines::marker::Marker;
    use crate::pipelines::stage::{MemorySink, Stage};

    fn run(ctx: &Context, data: &[u8], chunk: usize) -> MemorySink {
        let mut stage = Padding::stage();
        let mut sink = MemorySink::new();
        stage.mark(Marker::BeginSequence, ctx, &mut sink).unwrap();
        stage.mark(Marker::BeginImage, ctx, &mut sink).unwrap();
        for piece in data.chunks(chunk) {
            stage.write(piece, &mut sink).unwrap();
        }
        stage.mark(Marker::EndImage, ctx, &mut sink).unwrap();
        sink
    }

    #[test]
    fn test_no_padding_passes_through() {
        let ctx = Context::raster(100, 100, 8, 1);
        let data: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        let sink = run(&ctx, &data, 10_000);

        assert_eq!(sink.bytes(), data);
        let done = sink.last_context(Marker::EndImage).unwrap();
        assert_eq!(done.width, Some(100));
        assert_eq!(done.height, Some(100));
        assert_eq!(done.depth, 8);
    }

    #[test]
    fn test_strips_octets_and_lines() {
        // 3 pixels + 1 pad octet per line, 2 lines + 1 pad line
        let ctx = Context::raster(3, 2, 8, 1).with_padding(1, 1);
        let data = [1, 2, 3, 0, 4, 5, 6, 0, 9, 9, 9, 9];
        for chunk in [1, 3, 5, 12] {
            let sink = run(&ctx, &data, chunk);
            assert_eq!(sink.bytes(), vec![1, 2, 3, 4, 5, 6], "chunk size {chunk}");

            let begin = sink.last_context(Marker::BeginImage).unwrap();
            assert_eq!(begin.padding_octets, 0);
            assert_eq!(begin.padding_lines, 0);

            let done = sink.last_context(Marker::EndImage).unwrap();
            assert_eq!(done.octets_seen(), 6);
            assert_eq!(done.height, Some(2));
        }
    }

    #[test]
    fn test_partial_line_dropped_on_end_of_file() {
        let ctx = Context::raster(3, 2, 8, 1).with_padding(1, 0);
        let mut stage = Padding::stage();
        let mut sink = MemorySink::new();
        stage.mark(Marker::BeginSequence, &ctx, &mut sink).unwrap();
        stage.mark(Marker::BeginImage, &ctx, &mut sink).unwrap();
        stage.write(&[1, 2, 3, 0, 4, 5], &mut sink).unwrap();
        stage.mark(Marker::EndOfFile, &ctx, &mut sink).unwrap();

        assert_eq!(sink.bytes(), vec![1, 2, 3]);
        assert_eq!(sink.markers().last(), Some(&Marker::EndOfFile));
        assert_eq!(stage.hooks().carry.pending(), 0);
    }
}
