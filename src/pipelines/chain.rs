// SPDX-License-Identifier: GPL-3.0-only

//! Ordered composition of stages ending in a sink
//!
//! ```text
//! Source ──▶ stage[0] ──▶ stage[1] ──▶ … ──▶ stage[n-1] ──▶ Sink
//! ```
//!
//! The chain owns every stage and the sink. Each stage sees the rest of the
//! chain as its downstream [`Output`], so appending a stage automatically
//! rewires the previous tail.

use super::context::Context;
use super::marker::{Marker, SequenceState};
use super::stage::{Output, Stage};
use crate::backends::source::{Pulled, Source};
use crate::constants::DEFAULT_SOURCE_CHUNK;
use crate::errors::{PipelineError, PipelineResult};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

/// Stages plus terminal sink
pub struct Chain<S: Output = Box<dyn Output + Send>> {
    stages: Vec<Box<dyn Stage>>,
    sink: S,
    chunk_size: usize,
}

impl<S: Output> Chain<S> {
    /// Empty chain delivering straight into `sink`
    pub fn new(sink: S) -> Self {
        Self {
            stages: Vec::new(),
            sink,
            chunk_size: DEFAULT_SOURCE_CHUNK,
        }
    }

    /// Bytes requested from the source per pull
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Append `stage` as the new tail
    pub fn push(&mut self, stage: impl Stage + 'static) -> &mut Self {
        self.push_boxed(Box::new(stage))
    }

    /// Append an already boxed stage as the new tail
    pub fn push_boxed(&mut self, stage: Box<dyn Stage>) -> &mut Self {
        debug!(stage = stage.name(), position = self.stages.len(), "Stage pushed");
        self.stages.push(stage);
        self
    }

    /// Number of stages
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the chain has no stages
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage names, head first
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// The terminal sink
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Dismantle the chain, keeping the sink
    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Pump `source` through the chain until a terminal marker
    pub fn run(&mut self, source: &mut dyn Source) -> PipelineResult<Marker> {
        self.run_until(source, &AtomicBool::new(false))
    }

    /// Pump `source` through the chain until a terminal marker or `cancel`
    ///
    /// Exactly one terminal marker reaches the sink per call. On success it
    /// is the marker returned; on failure the sink receives the error through
    /// [`Output::fail`] and the same error is returned.
    pub fn run_until(
        &mut self,
        source: &mut dyn Source,
        cancel: &AtomicBool,
    ) -> PipelineResult<Marker> {
        let mut buf = vec![0u8; self.chunk_size];
        let mut upstream = SequenceState::default();
        let mut last_ctx = Context::default();
        let mut terminus = Terminus::new(&mut self.sink);

        let outcome = loop {
            if terminus.terminal.is_some() {
                break Ok(());
            }

            if cancel.load(Ordering::Acquire) {
                info!(state = ?upstream, "Chain run cancelled");
                upstream.advance(Marker::EndOfFile);
                if let Err(e) = forward_mark(
                    &mut self.stages,
                    &mut terminus,
                    Marker::EndOfFile,
                    &last_ctx,
                ) {
                    break Err(e);
                }
                if terminus.terminal.is_none() {
                    terminus.terminal = Some((Marker::EndOfFile, last_ctx.clone()));
                }
                break Ok(());
            }

            let pulled = match source.read(&mut buf) {
                Ok(pulled) => pulled,
                Err(e) => break Err(e),
            };

            match pulled {
                Pulled::Bytes(0) => std::thread::yield_now(),
                Pulled::Bytes(n) => {
                    if !upstream.accepts_payload() {
                        break Err(PipelineError::UnexpectedBucket(format!(
                            "{n} bytes from source outside of an image"
                        )));
                    }
                    let mut link = Link {
                        stages: &mut self.stages,
                        sink: &mut terminus,
                    };
                    if let Err(e) = link.write_all(&buf[..n]) {
                        break Err(e);
                    }
                }
                Pulled::Marker(marker, ctx) => {
                    let state = upstream;
                    if !upstream.advance(marker) {
                        break Err(PipelineError::Protocol { marker, state });
                    }
                    last_ctx = ctx;
                    if let Err(e) =
                        forward_mark(&mut self.stages, &mut terminus, marker, &last_ctx)
                    {
                        break Err(e);
                    }
                    if marker.is_terminal() && terminus.terminal.is_none() {
                        warn!(%marker, "Terminal marker swallowed by a stage");
                        terminus.terminal = Some((Marker::EndOfFile, last_ctx.clone()));
                    }
                }
            }
        };

        // Stages upstream of whatever ended the run still hold per-image
        // state; let them see end-of-file. The terminus drops the duplicate.
        if matches!(
            upstream,
            SequenceState::SequenceOpen | SequenceState::ImageOpen
        ) {
            debug!(state = ?upstream, "Releasing stages after early stop");
            if let Err(e) = forward_mark(
                &mut self.stages,
                &mut terminus,
                Marker::EndOfFile,
                &last_ctx,
            ) {
                warn!(error = %e, "Stage failed while releasing after early stop");
            }
        }

        let (marker, ctx) = terminus
            .terminal
            .take()
            .unwrap_or((Marker::EndOfFile, last_ctx));

        match outcome {
            Ok(()) => {
                terminus.sink.mark(marker, &ctx)?;
                debug!(%marker, "Chain run finished");
                Ok(marker)
            }
            Err(e) => {
                error!(error = %e, "Chain run failed");
                if let Err(sink_err) = terminus.sink.fail(&e, &ctx) {
                    warn!(error = %sink_err, "Sink rejected failure notice");
                }
                Err(e)
            }
        }
    }
}

impl<S: Output> Output for Chain<S> {
    fn mark(&mut self, marker: Marker, ctx: &Context) -> PipelineResult<()> {
        forward_mark(&mut self.stages, &mut self.sink, marker, ctx)
    }

    fn write(&mut self, data: &[u8]) -> PipelineResult<usize> {
        Link {
            stages: &mut self.stages,
            sink: &mut self.sink,
        }
        .write(data)
    }
}

fn forward_mark(
    stages: &mut [Box<dyn Stage>],
    sink: &mut dyn Output,
    marker: Marker,
    ctx: &Context,
) -> PipelineResult<()> {
    Link { stages, sink }.mark(marker, ctx)
}

/// The remainder of a chain, seen from one stage
struct Link<'a> {
    stages: &'a mut [Box<dyn Stage>],
    sink: &'a mut dyn Output,
}

impl Output for Link<'_> {
    fn mark(&mut self, marker: Marker, ctx: &Context) -> PipelineResult<()> {
        match self.stages.split_first_mut() {
            Some((head, rest)) => head.mark(
                marker,
                ctx,
                &mut Link {
                    stages: rest,
                    sink: &mut *self.sink,
                },
            ),
            None => self.sink.mark(marker, ctx),
        }
    }

    fn write(&mut self, data: &[u8]) -> PipelineResult<usize> {
        match self.stages.split_first_mut() {
            Some((head, rest)) => head.write(
                data,
                &mut Link {
                    stages: rest,
                    sink: &mut *self.sink,
                },
            ),
            None => self.sink.write(data),
        }
    }
}

/// Sink guard holding back the terminal marker until the run settles
struct Terminus<'a> {
    sink: &'a mut dyn Output,
    state: SequenceState,
    terminal: Option<(Marker, Context)>,
}

impl<'a> Terminus<'a> {
    fn new(sink: &'a mut dyn Output) -> Self {
        Self {
            sink,
            state: SequenceState::default(),
            terminal: None,
        }
    }
}

impl Output for Terminus<'_> {
    fn mark(&mut self, marker: Marker, ctx: &Context) -> PipelineResult<()> {
        if self.terminal.is_some() {
            debug!(%marker, "Marker after terminal dropped");
            return Ok(());
        }

        let state = self.state;
        if !self.state.advance(marker) {
            error!(%marker, state = ?state, "Out-of-order marker at sink");
        }

        if marker.is_terminal() {
            self.terminal = Some((marker, ctx.clone()));
            Ok(())
        } else {
            self.sink.mark(marker, ctx)
        }
    }

    fn write(&mut self, data: &[u8]) -> PipelineResult<usize> {
        if self.terminal.is_some() {
            return Ok(data.len());
        }
        self.sink.write(data)
    }
}
