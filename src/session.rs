// SPDX-License-Identifier: GPL-3.0-only

//! Polling façade over a background chain
//!
//! A [`Session`] gives a synchronous caller the usual begin/read/cancel life
//! cycle while the chain runs on a worker thread. The two sides meet only in
//! the bridge [`Cache`].
//!
//! ```text
//!   start() ──▶ BeginImage ──▶ read()… ──▶ EndOfImage ──▶ start() ──▶ …
//!                                 │                          │
//!                                 └── error ──▶ NotScanning  └── NoMoreImages
//! ```
//!
//! One worker serves every image of a sequence. It is created lazily by the
//! first `start()` and retired when the sequence ends, fails or is cancelled.

use crate::backends::device::Device;
use crate::backends::options::OptionSource;
use crate::bridge::{Cache, ChainWorker, Front};
use crate::config::PipelineConfig;
use crate::constants::{APP_NAME, DEFAULT_SOURCE_CHUNK};
use crate::errors::{PipelineError, PipelineResult};
use crate::pipelines::chain::Chain;
use crate::pipelines::context::Context;
use crate::pipelines::external::{ExternalProcess, helper_available};
use crate::pipelines::filters::Padding;
use crate::pipelines::marker::Marker;
use crate::pipelines::stage::{Output, Stage};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Builds the stages of a new chain from device options and config
pub type StageFactory = Box<
    dyn Fn(&dyn OptionSource, &PipelineConfig) -> PipelineResult<Vec<Box<dyn Stage>>> + Send,
>;

/// Default stages: padding removal, then the configured helper if any
///
/// Reads the `strip-padding` toggle (on by default) and the `helper` text
/// option, which takes precedence over [`PipelineConfig::helper_program`].
pub fn standard_stages(
    options: &dyn OptionSource,
    config: &PipelineConfig,
) -> PipelineResult<Vec<Box<dyn Stage>>> {
    let mut stages: Vec<Box<dyn Stage>> = Vec::new();

    if options.toggle("strip-padding").unwrap_or(true) {
        stages.push(Box::new(Padding::stage()));
    }

    let helper = options
        .text("helper")
        .or_else(|| config.helper_program.clone())
        .filter(|program| !program.trim().is_empty());
    if let Some(program) = helper {
        if !helper_available(&program) {
            return Err(PipelineError::Config(format!(
                "helper program '{program}' is not available"
            )));
        }
        stages.push(Box::new(ExternalProcess::new(program).configured(config)));
    }

    Ok(stages)
}

/// Where the caller stands with respect to the current image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No image open for reading
    NotScanning,
    /// Image open, its end not yet produced
    Scanning,
    /// Image open, its end produced but not yet read
    Done,
}

/// Outcome of one [`Session::read`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// This many bytes were copied into the buffer
    Data(usize),
    /// The image is complete; [`Session::get_context`] has its final context
    EndOfImage,
}

/// Thread-safe way to cancel a session's running chain
///
/// Usable from places that cannot borrow the session, such as a signal
/// handler. Raising it ends the current run with end-of-file at the worker's
/// next source pull.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Begin/read/cancel façade driving a chain worker
pub struct Session<D: Device> {
    device: D,
    config: PipelineConfig,
    factory: StageFactory,
    cache: Arc<Cache>,
    worker: Option<ChainWorker>,
    /// Stop flag shared with every worker this session starts
    cancel: Arc<AtomicBool>,
    scanning: bool,
    context: Context,
}

impl<D: Device> Session<D> {
    /// Session using [`standard_stages`]
    pub fn new(device: D, config: PipelineConfig) -> Self {
        Self::with_stages(device, config, Box::new(standard_stages))
    }

    /// Session building its chains with `factory`
    pub fn with_stages(device: D, config: PipelineConfig, factory: StageFactory) -> Self {
        let cache = Cache::new(config.cache_high_water);
        Self {
            device,
            config,
            factory,
            cache,
            worker: None,
            cancel: Arc::new(AtomicBool::new(false)),
            scanning: false,
            context: Context::default(),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Current state, derived from the bridge while an image is open
    pub fn state(&self) -> SessionState {
        if !self.scanning {
            SessionState::NotScanning
        } else if self.cache.close_pending() {
            SessionState::Done
        } else {
            SessionState::Scanning
        }
    }

    /// Context of the current image
    ///
    /// After [`ReadStatus::EndOfImage`] this is the finalized context.
    pub fn get_context(&self) -> &Context {
        &self.context
    }

    /// Handle cancelling the running chain from any thread
    ///
    /// Each new worker starts with the flag lowered, so a cancel raised while
    /// no worker runs does not carry over into the next sequence.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            flag: Arc::clone(&self.cancel),
        }
    }

    /// Whether a worker is serving the current sequence
    pub fn has_worker(&self) -> bool {
        self.worker.is_some()
    }

    /// Advance to the next image
    ///
    /// Unread bytes of the previous image are discarded first. Fails with
    /// [`PipelineError::NoMoreImages`] at the end of a sequence and with
    /// [`PipelineError::Cancelled`] when the worker stopped early.
    pub fn start(&mut self) -> PipelineResult<()> {
        if self.scanning {
            debug!("Draining unread tail of the previous image");
            self.drain_image()?;
        }

        if self.worker.is_none() {
            self.spawn_worker()?;
            match self
                .cache
                .expect(&[Marker::BeginSequence, Marker::EndOfFile])
            {
                Ok((Marker::BeginSequence, ctx)) => self.context = ctx,
                Ok((_, ctx)) => {
                    self.context = ctx;
                    self.retire();
                    return Err(PipelineError::Cancelled);
                }
                Err(e) => return Err(self.abort(e)),
            }
        }

        match self.cache.expect(&[
            Marker::BeginImage,
            Marker::EndSequence,
            Marker::EndOfFile,
        ]) {
            Ok((Marker::BeginImage, ctx)) => {
                info!(
                    width = ?ctx.width,
                    height = ?ctx.height,
                    depth = ctx.depth,
                    "Image started"
                );
                self.context = ctx;
                self.scanning = true;
                Ok(())
            }
            Ok((Marker::EndSequence, ctx)) => {
                info!("Sequence has no more images");
                self.context = ctx;
                self.retire();
                Err(PipelineError::NoMoreImages)
            }
            Ok((_, ctx)) => {
                self.context = ctx;
                self.retire();
                Err(PipelineError::Cancelled)
            }
            Err(e) => Err(self.abort(e)),
        }
    }

    /// Read the next bytes of the current image
    ///
    /// Waits until the worker produced something. Any error ends the session's
    /// sequence: the worker is stopped and the state becomes
    /// [`SessionState::NotScanning`].
    pub fn read(&mut self, buf: &mut [u8]) -> PipelineResult<ReadStatus> {
        if !self.scanning {
            return Err(PipelineError::NotScanning);
        }

        match self.cache.front() {
            Front::Payload(_) if buf.is_empty() => Ok(ReadStatus::Data(0)),
            Front::Payload(_) => Ok(ReadStatus::Data(self.cache.read_payload(buf))),
            Front::Control(Marker::EndImage, _) => match self.cache.take_marker() {
                Ok((_, ctx)) => {
                    debug!(octets = ctx.octets_seen(), "Image read completely");
                    self.context = ctx;
                    self.scanning = false;
                    Ok(ReadStatus::EndOfImage)
                }
                Err(e) => Err(self.abort(e)),
            },
            Front::Control(Marker::EndOfFile, _) => {
                let error = match self.cache.take_marker() {
                    Err(e) => e,
                    Ok((_, ctx)) => {
                        self.context = ctx;
                        PipelineError::Cancelled
                    }
                };
                Err(self.abort(error))
            }
            Front::Control(marker, _) => Err(self.abort(PipelineError::UnexpectedBucket(
                format!("{marker} inside an image"),
            ))),
        }
    }

    /// Ask the worker to stop
    ///
    /// Returns immediately. The stop becomes visible to the caller when a
    /// later `read()` or `start()` meets the end of the run. Without an open
    /// image this does nothing.
    pub fn cancel(&self) {
        if !self.scanning {
            debug!("Cancel without an open image ignored");
            return;
        }
        if self.worker.is_some() {
            info!("Cancelling scan");
            self.cancel.store(true, Ordering::SeqCst);
        }
    }

    fn spawn_worker(&mut self) -> PipelineResult<()> {
        let stages = (self.factory)(self.device.options(), &self.config)?;
        let source = self.device.open()?;

        self.cache.clear();
        let sink: Box<dyn Output + Send> = Box::new(self.cache.writer());
        let mut chain = Chain::new(sink).with_chunk_size(self.config.source_chunk_size);
        for stage in stages {
            chain.push_boxed(stage);
        }

        let name = format!("{APP_NAME}-worker");
        self.cancel.store(false, Ordering::SeqCst);
        self.worker = Some(ChainWorker::with_stop_signal(
            &name,
            chain,
            source,
            Arc::clone(&self.cancel),
        )?);
        Ok(())
    }

    fn drain_image(&mut self) -> PipelineResult<()> {
        let mut scratch = vec![0u8; DEFAULT_SOURCE_CHUNK];
        let mut discarded = 0usize;
        loop {
            match self.read(&mut scratch)? {
                ReadStatus::Data(n) => discarded += n,
                ReadStatus::EndOfImage => break,
            }
        }
        debug!(discarded, "Unread image tail discarded");
        Ok(())
    }

    /// Let a worker that reached its terminal marker finish
    fn retire(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.join();
        }
        self.cache.clear();
        self.scanning = false;
    }

    /// Stop the worker after a failure and hand the error back
    fn abort(&mut self, error: PipelineError) -> PipelineError {
        if error.is_benign() {
            info!(%error, "Scan ended early");
        } else {
            warn!(%error, "Scan failed");
        }
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
        self.cache.clear();
        self.scanning = false;
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::device::ScriptedDevice;
    use crate::backends::options::{MapOptions, OptionValue};
    use crate::backends::source::ScriptedSource;

    fn gray(width: u32, height: u32) -> Context {
        Context::raster(width, height, 8, 1)
    }

    fn read_image<D: Device>(session: &mut Session<D>) -> PipelineResult<Vec<u8>> {
        let mut image = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            match session.read(&mut buf)? {
                ReadStatus::Data(n) => image.extend_from_slice(&buf[..n]),
                ReadStatus::EndOfImage => return Ok(image),
            }
        }
    }

    #[test]
    fn test_standard_stages_follow_options() {
        let config = PipelineConfig::default();
        let stages = standard_stages(&MapOptions::new(), &config).unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].name(), "padding");

        let options = MapOptions::new()
            .with("strip-padding", OptionValue::Toggle(false))
            .with("helper", OptionValue::Text("cat".into()));
        let stages = standard_stages(&options, &config).unwrap();
        let names: Vec<_> = stages.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["cat"]);
    }

    #[test]
    fn test_standard_stages_reject_missing_helper() {
        let config = PipelineConfig {
            helper_program: Some("scanflow-no-such-helper".into()),
            ..PipelineConfig::default()
        };
        assert!(matches!(
            standard_stages(&MapOptions::new(), &config),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn test_single_image_life_cycle() {
        let ctx = gray(4, 2);
        let script = ScriptedSource::images(&ctx, &[vec![5u8; 8]], 3);
        let device = ScriptedDevice::new([script], MapOptions::new());
        let mut session = Session::new(device, PipelineConfig::default());

        assert_eq!(session.state(), SessionState::NotScanning);
        session.start().unwrap();
        assert!(session.has_worker());
        assert_eq!(session.get_context().width, Some(4));

        assert_eq!(read_image(&mut session).unwrap(), vec![5u8; 8]);
        assert_eq!(session.state(), SessionState::NotScanning);
        assert_eq!(session.get_context().octets_seen(), 8);

        assert!(matches!(session.start(), Err(PipelineError::NoMoreImages)));
        assert!(!session.has_worker());
    }

    #[test]
    fn test_read_without_image() {
        let device = ScriptedDevice::new([], MapOptions::new());
        let mut session = Session::new(device, PipelineConfig::default());
        let mut buf = [0u8; 4];
        assert!(matches!(
            session.read(&mut buf),
            Err(PipelineError::NotScanning)
        ));
        // Nothing to cancel
        session.cancel();
        session.cancel();
        assert_eq!(session.state(), SessionState::NotScanning);
    }

    #[test]
    fn test_open_failure_surfaces() {
        let device = ScriptedDevice::new([], MapOptions::new());
        let mut session = Session::new(device, PipelineConfig::default());
        assert!(matches!(session.start(), Err(PipelineError::Source(_))));
        assert!(!session.has_worker());
    }
}
