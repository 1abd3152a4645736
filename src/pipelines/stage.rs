// SPDX-License-Identifier: GPL-3.0-only

//! Stage contract
//!
//! A stage receives markers and bytes from upstream and re-emits transformed
//! markers and bytes into its downstream [`Output`]. The downstream is handed
//! in on every call; the owning [`Chain`](super::chain::Chain) decides what it
//! is.
//!
//! Concrete stages usually implement [`Transform`] and get wrapped in a
//! [`Filter`], which takes care of marker bookkeeping and byte accounting so
//! the transform only deals with its own hooks.

use super::context::Context;
use super::marker::{Event, Marker, SequenceState};
use crate::errors::{PipelineError, PipelineResult};
use std::io;
use tracing::{debug, error, warn};

/// Downstream end of a pipeline edge
pub trait Output {
    /// Receive a marker together with the context it applies to
    fn mark(&mut self, marker: Marker, ctx: &Context) -> PipelineResult<()>;

    /// Receive image bytes, returning how many were taken
    ///
    /// Implementations must take everything they are given.
    fn write(&mut self, data: &[u8]) -> PipelineResult<usize>;

    /// Write until `data` is exhausted
    fn write_all(&mut self, mut data: &[u8]) -> PipelineResult<()> {
        while !data.is_empty() {
            let taken = self.write(data)?;
            if taken == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero).into());
            }
            data = &data[taken..];
        }
        Ok(())
    }

    /// Receive a fatal pipeline failure in place of a terminal marker
    ///
    /// The default treats it as a plain end-of-file. Outputs that can carry
    /// the error further (the bridge) override this.
    fn fail(&mut self, error: &PipelineError, ctx: &Context) -> PipelineResult<()> {
        debug!(%error, "Failure delivered as end-of-file");
        self.mark(Marker::EndOfFile, ctx)
    }

    /// Deliver one tagged event
    fn send(&mut self, event: &Event) -> PipelineResult<()> {
        match event {
            Event::Payload(bytes) => self.write_all(bytes),
            Event::Control(marker, ctx) => self.mark(*marker, ctx),
        }
    }
}

impl<O: Output + ?Sized> Output for &mut O {
    fn mark(&mut self, marker: Marker, ctx: &Context) -> PipelineResult<()> {
        (**self).mark(marker, ctx)
    }

    fn write(&mut self, data: &[u8]) -> PipelineResult<usize> {
        (**self).write(data)
    }

    fn fail(&mut self, error: &PipelineError, ctx: &Context) -> PipelineResult<()> {
        (**self).fail(error, ctx)
    }
}

impl<O: Output + ?Sized> Output for Box<O> {
    fn mark(&mut self, marker: Marker, ctx: &Context) -> PipelineResult<()> {
        (**self).mark(marker, ctx)
    }

    fn write(&mut self, data: &[u8]) -> PipelineResult<usize> {
        (**self).write(data)
    }

    fn fail(&mut self, error: &PipelineError, ctx: &Context) -> PipelineResult<()> {
        (**self).fail(error, ctx)
    }
}

/// One pipeline unit
pub trait Stage: Send {
    /// Short name used in log records
    fn name(&self) -> &str;

    /// Handle a marker and forward an equivalent one into `out`
    fn mark(&mut self, marker: Marker, ctx: &Context, out: &mut dyn Output) -> PipelineResult<()>;

    /// Consume all of `data`, emitting whatever results into `out`
    fn write(&mut self, data: &[u8], out: &mut dyn Output) -> PipelineResult<usize>;
}

/// Customization hooks of a stage
///
/// Every hook has a pass-through default, so an empty implementation is an
/// identity stage.
pub trait Transform: Send {
    /// Short name used in log records
    fn name(&self) -> &str;

    /// A new sequence starts
    fn begin_sequence(&mut self, _ctx: &Context) {}

    /// Derive the outgoing context of an image from the incoming one
    fn estimate(&mut self, ctx: &Context) -> Context {
        ctx.clone()
    }

    /// Transform a run of image bytes
    fn transform(&mut self, data: &[u8], out: &mut dyn Output) -> PipelineResult<()> {
        out.write_all(data)
    }

    /// Emit anything still held back at end-of-image
    fn flush(&mut self, _out: &mut dyn Output) -> PipelineResult<()> {
        Ok(())
    }

    /// Produce the final outgoing context; `ctx` carries the emitted octet count
    fn finalize(&mut self, ctx: &Context) -> Context {
        ctx.clone()
    }

    /// Drop per-image state after end-of-file
    fn abort(&mut self) {}

    /// Extra command line arguments when the transform drives a helper process
    fn arguments(&self, _ctx: &Context) -> Vec<String> {
        Vec::new()
    }
}

/// Output adapter counting the octets passed through into a context
pub(crate) struct Counting<'a> {
    pub(crate) out: &'a mut dyn Output,
    pub(crate) ctx: &'a mut Context,
}

impl Output for Counting<'_> {
    fn mark(&mut self, marker: Marker, ctx: &Context) -> PipelineResult<()> {
        self.out.mark(marker, ctx)
    }

    fn write(&mut self, data: &[u8]) -> PipelineResult<usize> {
        let taken = self.out.write(data)?;
        self.ctx.add_octets(taken);
        Ok(taken)
    }
}

/// Stage driving a [`Transform`] through the marker protocol
pub struct Filter<T: Transform> {
    hooks: T,
    state: SequenceState,
    /// Outgoing context of the current image
    output: Context,
    octets_in: u64,
}

impl<T: Transform> Filter<T> {
    /// Wrap a set of hooks
    pub fn new(hooks: T) -> Self {
        Self {
            hooks,
            state: SequenceState::default(),
            output: Context::default(),
            octets_in: 0,
        }
    }

    /// Access the hooks
    pub fn hooks(&self) -> &T {
        &self.hooks
    }

    /// Current protocol state
    pub fn state(&self) -> SequenceState {
        self.state
    }

    fn end_image(&mut self, out: &mut dyn Output) -> PipelineResult<()> {
        self.hooks.flush(&mut Counting {
            out: &mut *out,
            ctx: &mut self.output,
        })?;

        let mut finished = self.hooks.finalize(&self.output);
        finished.reconcile();
        debug!(
            stage = self.hooks.name(),
            octets_in = self.octets_in,
            octets_out = finished.octets_seen(),
            "Image finished"
        );
        self.output = finished;
        out.mark(Marker::EndImage, &self.output)
    }
}

impl<T: Transform> Stage for Filter<T> {
    fn name(&self) -> &str {
        self.hooks.name()
    }

    fn mark(&mut self, marker: Marker, ctx: &Context, out: &mut dyn Output) -> PipelineResult<()> {
        let previous = self.state;
        if !self.state.advance(marker) {
            error!(
                stage = self.hooks.name(),
                %marker,
                state = ?previous,
                "Out-of-order marker"
            );
        }

        match marker {
            Marker::BeginSequence => {
                self.hooks.begin_sequence(ctx);
                out.mark(marker, ctx)
            }
            Marker::BeginImage => {
                self.octets_in = 0;
                self.output = self.hooks.estimate(ctx);
                self.output.reset_counters();
                out.mark(marker, &self.output)
            }
            Marker::EndImage => self.end_image(out),
            Marker::EndSequence => out.mark(marker, ctx),
            Marker::EndOfFile => {
                if previous == SequenceState::ImageOpen {
                    self.hooks.abort();
                }
                out.mark(marker, &self.output)
            }
        }
    }

    fn write(&mut self, data: &[u8], out: &mut dyn Output) -> PipelineResult<usize> {
        if !self.state.accepts_payload() {
            warn!(
                stage = self.hooks.name(),
                state = ?self.state,
                len = data.len(),
                "Payload outside of an image"
            );
        }

        self.octets_in += data.len() as u64;
        self.hooks.transform(
            data,
            &mut Counting {
                out,
                ctx: &mut self.output,
            },
        )?;
        Ok(data.len())
    }
}

/// Sink that records everything it receives
///
/// Handy as a chain terminus in tests and for collecting small results.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Vec<Event>,
}

impl MemorySink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// All events in arrival order, adjacent payload writes kept separate
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Markers in arrival order
    pub fn markers(&self) -> Vec<Marker> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Control(marker, _) => Some(*marker),
                Event::Payload(_) => None,
            })
            .collect()
    }

    /// Context attached to the last occurrence of `marker`
    pub fn last_context(&self, marker: Marker) -> Option<&Context> {
        self.events.iter().rev().find_map(|e| match e {
            Event::Control(m, ctx) if *m == marker => Some(ctx),
            _ => None,
        })
    }

    /// Concatenation of all payload bytes
    pub fn bytes(&self) -> Vec<u8> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Payload(bytes) => Some(bytes.as_slice()),
                Event::Control(..) => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    /// Payload bytes grouped per image
    pub fn images(&self) -> Vec<Vec<u8>> {
        let mut images = Vec::new();
        let mut current: Option<Vec<u8>> = None;
        for event in &self.events {
            match event {
                Event::Control(Marker::BeginImage, _) => current = Some(Vec::new()),
                Event::Control(marker, _) if marker.closes_image() => {
                    if let Some(image) = current.take() {
                        images.push(image);
                    }
                }
                Event::Payload(bytes) => {
                    if let Some(image) = current.as_mut() {
                        image.extend_from_slice(bytes);
                    }
                }
                Event::Control(..) => {}
            }
        }
        images
    }
}

impl Output for MemorySink {
    fn mark(&mut self, marker: Marker, ctx: &Context) -> PipelineResult<()> {
        self.events.push(Event::Control(marker, ctx.clone()));
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> PipelineResult<usize> {
        if !data.is_empty() {
            self.events.push(Event::Payload(data.to_vec()));
        }
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Doubler;

    impl Transform for Doubler {
        fn name(&self) -> &str {
            "doubler"
        }

        fn estimate(&mut self, ctx: &Context) -> Context {
            let mut ctx = ctx.clone();
            ctx.width = ctx.width.map(|w| w * 2);
            ctx
        }

        fn transform(&mut self, data: &[u8], out: &mut dyn Output) -> PipelineResult<()> {
            let doubled: Vec<u8> = data.iter().flat_map(|&b| [b, b]).collect();
            out.write_all(&doubled)
        }
    }

    struct Nothing;

    impl Transform for Nothing {
        fn name(&self) -> &str {
            "nothing"
        }
    }

    fn run_image(stage: &mut dyn Stage, ctx: &Context, chunks: &[&[u8]]) -> MemorySink {
        let mut sink = MemorySink::new();
        stage.mark(Marker::BeginSequence, ctx, &mut sink).unwrap();
        stage.mark(Marker::BeginImage, ctx, &mut sink).unwrap();
        for chunk in chunks {
            assert_eq!(stage.write(chunk, &mut sink).unwrap(), chunk.len());
        }
        stage.mark(Marker::EndImage, ctx, &mut sink).unwrap();
        stage.mark(Marker::EndSequence, ctx, &mut sink).unwrap();
        sink
    }

    #[test]
    fn test_default_hooks_pass_through() {
        let mut filter = Filter::new(Nothing);
        let ctx = Context::raster(2, 2, 8, 1);
        let sink = run_image(&mut filter, &ctx, &[&[1, 2, 3], &[4]]);

        assert_eq!(sink.bytes(), vec![1, 2, 3, 4]);
        assert_eq!(
            sink.markers(),
            vec![
                Marker::BeginSequence,
                Marker::BeginImage,
                Marker::EndImage,
                Marker::EndSequence
            ]
        );
        let done = sink.last_context(Marker::EndImage).unwrap();
        assert_eq!(done.octets_seen(), 4);
        assert_eq!(done.height, Some(2));
    }

    #[test]
    fn test_estimate_and_counting() {
        let mut filter = Filter::new(Doubler);
        let ctx = Context::raster(2, 2, 8, 1);
        let sink = run_image(&mut filter, &ctx, &[&[1, 2], &[3, 4]]);

        assert_eq!(sink.bytes(), vec![1, 1, 2, 2, 3, 3, 4, 4]);
        assert_eq!(sink.last_context(Marker::BeginImage).unwrap().width, Some(4));
        let done = sink.last_context(Marker::EndImage).unwrap();
        assert_eq!(done.octets_seen(), 8);
        assert_eq!(done.width, Some(4));
        assert_eq!(done.height, Some(2));
    }

    #[test]
    fn test_end_of_file_is_forwarded() {
        let mut filter = Filter::new(Nothing);
        let ctx = Context::raster(2, 2, 8, 1);
        let mut sink = MemorySink::new();
        filter.mark(Marker::BeginSequence, &ctx, &mut sink).unwrap();
        filter.mark(Marker::BeginImage, &ctx, &mut sink).unwrap();
        filter.write(&[9], &mut sink).unwrap();
        filter.mark(Marker::EndOfFile, &ctx, &mut sink).unwrap();

        assert_eq!(sink.markers().last(), Some(&Marker::EndOfFile));
        assert_eq!(filter.state(), SequenceState::Error);
    }

    #[test]
    fn test_images_grouping() {
        let mut sink = MemorySink::new();
        let ctx = Context::default();
        sink.mark(Marker::BeginImage, &ctx).unwrap();
        sink.write(&[1, 2]).unwrap();
        sink.mark(Marker::EndImage, &ctx).unwrap();
        sink.mark(Marker::BeginImage, &ctx).unwrap();
        sink.write(&[3]).unwrap();
        sink.mark(Marker::EndOfFile, &ctx).unwrap();

        assert_eq!(sink.images(), vec![vec![1, 2], vec![3]]);
    }
}
