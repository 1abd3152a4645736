// SPDX-License-Identifier: GPL-3.0-only

//! Acquisition sources
//!
//! A source is pulled by the chain one buffer at a time and answers either
//! with image bytes or with a structural marker.

use crate::errors::{PipelineError, PipelineResult};
use crate::pipelines::context::Context;
use crate::pipelines::marker::{Event, Marker};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;
use tracing::{debug, info};

/// Answer of one source pull
#[derive(Debug, Clone, PartialEq)]
pub enum Pulled {
    /// This many bytes were placed at the start of the buffer
    Bytes(usize),
    /// A structural transition
    Marker(Marker, Context),
}

/// Pull-style acquisition source
pub trait Source: Send {
    /// Fill `buf` with image bytes or report the next marker
    ///
    /// `Bytes(0)` means nothing is available right now.
    fn read(&mut self, buf: &mut [u8]) -> PipelineResult<Pulled>;
}

impl<S: Source + ?Sized> Source for Box<S> {
    fn read(&mut self, buf: &mut [u8]) -> PipelineResult<Pulled> {
        (**self).read(buf)
    }
}

/// Source replaying a fixed list of events
///
/// Payload events larger than the read buffer are handed out in pieces. Once
/// the script is exhausted the source reports the configured failure, or
/// end-of-file if there is none.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    events: VecDeque<Event>,
    failure: Option<String>,
}

impl ScriptedSource {
    /// Replay `events` verbatim
    pub fn new(events: impl IntoIterator<Item = Event>) -> Self {
        Self {
            events: events.into_iter().collect(),
            failure: None,
        }
    }

    /// A complete sequence of images sharing one context
    ///
    /// Each image's bytes are split into events of at most `chunk` bytes.
    pub fn images(ctx: &Context, images: &[Vec<u8>], chunk: usize) -> Self {
        let chunk = chunk.max(1);
        let mut events = vec![Event::Control(Marker::BeginSequence, ctx.clone())];
        for image in images {
            events.push(Event::Control(Marker::BeginImage, ctx.clone()));
            events.extend(image.chunks(chunk).map(|c| Event::Payload(c.to_vec())));
            events.push(Event::Control(Marker::EndImage, ctx.clone()));
        }
        events.push(Event::Control(Marker::EndSequence, ctx.clone()));
        Self::new(events)
    }

    /// Fail with `message` once the script runs out
    pub fn fail_with(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    /// Events not yet handed out
    pub fn remaining(&self) -> usize {
        self.events.len()
    }
}

impl Source for ScriptedSource {
    fn read(&mut self, buf: &mut [u8]) -> PipelineResult<Pulled> {
        match self.events.pop_front() {
            Some(Event::Control(marker, ctx)) => Ok(Pulled::Marker(marker, ctx)),
            Some(Event::Payload(mut bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    let rest = bytes.split_off(n);
                    self.events.push_front(Event::Payload(rest));
                }
                Ok(Pulled::Bytes(n))
            }
            None => match self.failure.take() {
                Some(message) => Err(PipelineError::Source(message)),
                None => Ok(Pulled::Marker(Marker::EndOfFile, Context::default())),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawPhase {
    BeginSequence,
    BeginImage,
    Data,
    EndSequence,
    Finished,
}

/// Serves a raw sample file as a one-image sequence
pub struct RawImageSource {
    file: File,
    ctx: Context,
    phase: RawPhase,
}

impl RawImageSource {
    /// Open `path`, described by `ctx`
    pub fn open(path: &Path, ctx: Context) -> PipelineResult<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        info!(
            path = %path.display(),
            len,
            expected = ?ctx.octets_per_image(),
            "Opened raw image"
        );
        Ok(Self {
            file,
            ctx,
            phase: RawPhase::BeginSequence,
        })
    }
}

impl Source for RawImageSource {
    fn read(&mut self, buf: &mut [u8]) -> PipelineResult<Pulled> {
        let (next, pulled) = match self.phase {
            RawPhase::BeginSequence => (
                RawPhase::BeginImage,
                Pulled::Marker(Marker::BeginSequence, self.ctx.clone()),
            ),
            RawPhase::BeginImage => (
                RawPhase::Data,
                Pulled::Marker(Marker::BeginImage, self.ctx.clone()),
            ),
            RawPhase::Data => loop {
                match self.file.read(buf) {
                    Ok(0) => {
                        debug!("Raw image exhausted");
                        break (
                            RawPhase::EndSequence,
                            Pulled::Marker(Marker::EndImage, self.ctx.clone()),
                        );
                    }
                    Ok(n) => break (RawPhase::Data, Pulled::Bytes(n)),
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            },
            RawPhase::EndSequence => (
                RawPhase::Finished,
                Pulled::Marker(Marker::EndSequence, self.ctx.clone()),
            ),
            RawPhase::Finished => (
                RawPhase::Finished,
                Pulled::Marker(Marker::EndOfFile, self.ctx.clone()),
            ),
        };
        self.phase = next;
        Ok(pulled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_splits_payload() {
        let mut source = ScriptedSource::new([Event::Payload(vec![1, 2, 3, 4, 5])]);
        let mut buf = [0u8; 2];
        assert_eq!(source.read(&mut buf).unwrap(), Pulled::Bytes(2));
        assert_eq!(buf, [1, 2]);
        assert_eq!(source.read(&mut buf).unwrap(), Pulled::Bytes(2));
        assert_eq!(buf, [3, 4]);
        assert_eq!(source.read(&mut buf).unwrap(), Pulled::Bytes(1));
        assert_eq!(buf[0], 5);
        assert_eq!(source.remaining(), 0);
    }

    #[test]
    fn test_scripted_images_shape() {
        let ctx = Context::raster(2, 1, 8, 1);
        let mut source = ScriptedSource::images(&ctx, &[vec![1, 2], vec![3, 4]], 1);
        let mut buf = [0u8; 8];
        let mut markers = Vec::new();
        let mut bytes = 0;
        loop {
            match source.read(&mut buf).unwrap() {
                Pulled::Bytes(n) => bytes += n,
                Pulled::Marker(m, _) => {
                    markers.push(m);
                    if m.is_terminal() {
                        break;
                    }
                }
            }
        }
        assert_eq!(bytes, 4);
        assert_eq!(
            markers,
            vec![
                Marker::BeginSequence,
                Marker::BeginImage,
                Marker::EndImage,
                Marker::BeginImage,
                Marker::EndImage,
                Marker::EndSequence
            ]
        );
    }

    #[test]
    fn test_scripted_failure_after_script() {
        let mut source = ScriptedSource::new([]).fail_with("lamp failure");
        let mut buf = [0u8; 4];
        match source.read(&mut buf) {
            Err(PipelineError::Source(msg)) => assert_eq!(msg, "lamp failure"),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(
            source.read(&mut buf).unwrap(),
            Pulled::Marker(Marker::EndOfFile, Context::default())
        );
    }
}
