// SPDX-License-Identifier: GPL-3.0-only
//! Thread lifecycle for chain workers
//!
//! A worker owns one [`Chain`] and its source and pumps the whole sequence on
//! a dedicated thread. The chain's sink is normally a
//! [`CacheWriter`](super::CacheWriter), so everything the worker produces,
//! failures included, reaches the caller through the bridge.

use crate::backends::source::Source;
use crate::errors::PipelineResult;
use crate::pipelines::chain::Chain;
use crate::pipelines::marker::Marker;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Controller for a chain running in a separate thread
///
/// Stopping is cooperative: the chain notices the stop signal between source
/// pulls and ends the run with end-of-file.
pub struct ChainWorker {
    /// Thread handle for joining
    thread_handle: Option<JoinHandle<Option<Marker>>>,
    /// Signal to stop the run
    stop_signal: Arc<AtomicBool>,
    /// Name for logging
    name: String,
}

impl ChainWorker {
    /// Start pumping `source` through `chain` on a new thread
    pub fn start(name: &str, chain: Chain, source: Box<dyn Source>) -> PipelineResult<Self> {
        Self::with_stop_signal(name, chain, source, Arc::new(AtomicBool::new(false)))
    }

    /// Like [`ChainWorker::start`], stopping when `stop_signal` is raised
    ///
    /// The flag is shared, so any holder can stop the run without access to
    /// the worker.
    pub fn with_stop_signal(
        name: &str,
        mut chain: Chain,
        mut source: Box<dyn Source>,
        stop_signal: Arc<AtomicBool>,
    ) -> PipelineResult<Self> {
        let stop_signal_clone = Arc::clone(&stop_signal);
        let name_clone = name.to_string();

        info!(name = %name, stages = ?chain.stage_names(), "Starting chain worker");

        let thread_handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!(name = %name_clone, "Chain worker thread started");

                // Failures already went to the sink; only the outcome is logged here
                let outcome = match chain.run_until(&mut *source, &stop_signal_clone) {
                    Ok(marker) => Some(marker),
                    Err(e) => {
                        warn!(name = %name_clone, error = %e, "Chain run failed");
                        None
                    }
                };

                info!(name = %name_clone, ?outcome, "Chain worker thread exiting");
                outcome
            })?;

        Ok(Self {
            thread_handle: Some(thread_handle),
            stop_signal,
            name: name.to_string(),
        })
    }

    /// Check if the worker thread is still running
    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Signal the worker to stop (non-blocking)
    pub fn request_stop(&self) {
        debug!(name = %self.name, "Requesting chain worker stop");
        self.stop_signal.store(true, Ordering::SeqCst);
    }

    /// Stop the worker and wait for the thread to finish
    pub fn stop(&mut self) -> Option<Marker> {
        self.request_stop();
        self.join()
    }

    /// Wait for the thread to finish without sending the stop signal
    ///
    /// Returns the terminal marker of a successful run.
    pub fn join(&mut self) -> Option<Marker> {
        let handle = self.thread_handle.take()?;
        debug!(name = %self.name, "Waiting for chain worker thread to finish");
        match handle.join() {
            Ok(outcome) => {
                debug!(name = %self.name, ?outcome, "Chain worker thread finished");
                outcome
            }
            Err(e) => {
                warn!(name = %self.name, "Chain worker thread panicked: {:?}", e);
                None
            }
        }
    }
}

impl Drop for ChainWorker {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            debug!(name = %self.name, "ChainWorker dropped, stopping run");
            self.stop();
        }
    }
}
