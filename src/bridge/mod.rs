// SPDX-License-Identifier: GPL-3.0-only

//! Producer/consumer bridge between the pipeline worker and a polling caller
//!
//! ```text
//!  worker thread                               caller thread
//! ┌─────────────┐   ┌───────────────────────┐   ┌──────────────┐
//! │ Chain::run  │──▶│ Cache (Mutex+Condvar) │──▶│ Session::read│
//! │  (sink =    │   │  [Bucket] FIFO        │   │  front/pop   │
//! │ CacheWriter)│   │  last marker/context  │   │              │
//! └─────────────┘   │  pending error        │   └──────────────┘
//!                   └───────────────────────┘
//! ```
//!
//! The producer never waits: every mark or write is an append under the lock.
//! The consumer waits on the condition variable until a bucket is queued. A
//! worker-side failure is parked next to the end-of-file bucket it produced
//! and re-raised when the consumer takes that bucket.

pub mod worker;

pub use worker::ChainWorker;

use crate::errors::{PipelineError, PipelineResult};
use crate::pipelines::context::Context;
use crate::pipelines::marker::{Event, Marker};
use crate::pipelines::stage::Output;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

/// One queued unit
#[derive(Debug)]
enum Bucket {
    /// Image bytes; `offset` bytes have already been handed out
    Payload { data: Vec<u8>, offset: usize },
    Control(Marker, Context),
}

/// What sits at the head of the queue
#[derive(Debug, Clone, PartialEq)]
pub enum Front {
    /// A payload bucket with this many unread bytes
    Payload(usize),
    Control(Marker, Context),
}

#[derive(Debug)]
struct Inner {
    queue: VecDeque<Bucket>,
    last_marker: Option<Marker>,
    last_context: Context,
    pending_error: Option<PipelineError>,
    queued_bytes: usize,
    high_water: usize,
    high_water_warned: bool,
    /// Image-closing markers enqueued so far
    closes_produced: u64,
    /// Image-closing markers taken by the consumer so far
    closes_consumed: u64,
}

/// Thread-safe bucket queue
#[derive(Debug)]
pub struct Cache {
    inner: Mutex<Inner>,
    ready: Condvar,
}

impl Cache {
    /// Empty cache warning once per image above `high_water` queued bytes
    pub fn new(high_water: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                last_marker: None,
                last_context: Context::default(),
                pending_error: None,
                queued_bytes: 0,
                high_water,
                high_water_warned: false,
                closes_produced: 0,
                closes_consumed: 0,
            }),
            ready: Condvar::new(),
        })
    }

    /// Producer handle feeding this cache
    pub fn writer(self: &Arc<Self>) -> CacheWriter {
        CacheWriter {
            cache: Arc::clone(self),
            finished: false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait_nonempty(&self) -> MutexGuard<'_, Inner> {
        let guard = self.lock();
        self.ready
            .wait_while(guard, |inner| inner.queue.is_empty())
            .unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, inner: &mut Inner, bucket: Bucket) {
        inner.queue.push_back(bucket);
        self.ready.notify_one();
    }

    /// Peek at the head bucket, waiting until there is one
    pub fn front(&self) -> Front {
        let inner = self.wait_nonempty();
        match inner.queue.front() {
            Some(Bucket::Payload { data, offset }) => Front::Payload(data.len() - offset),
            Some(Bucket::Control(marker, ctx)) => Front::Control(*marker, ctx.clone()),
            // wait_nonempty returned with a non-empty queue
            None => unreachable!("queue emptied under lock"),
        }
    }

    /// Remove the head bucket, waiting until there is one
    pub fn pop_front(&self) {
        let mut inner = self.wait_nonempty();
        Self::remove_head(&mut inner);
    }

    fn remove_head(inner: &mut Inner) -> Option<Bucket> {
        let bucket = inner.queue.pop_front()?;
        match &bucket {
            Bucket::Payload { data, offset } => {
                inner.queued_bytes -= data.len() - offset;
            }
            Bucket::Control(marker, _) if marker.closes_image() => {
                inner.closes_consumed += 1;
            }
            Bucket::Control(..) => {}
        }
        Some(bucket)
    }

    /// Copy bytes out of the head payload bucket
    ///
    /// Waits for a bucket. Returns 0 without consuming anything when the head
    /// is a control bucket. A payload bucket is removed once fully read.
    pub fn read_payload(&self, buf: &mut [u8]) -> usize {
        let mut inner = self.wait_nonempty();
        let Some(Bucket::Payload { data, offset }) = inner.queue.front_mut() else {
            return 0;
        };

        let n = buf.len().min(data.len() - *offset);
        buf[..n].copy_from_slice(&data[*offset..*offset + n]);
        *offset += n;
        let exhausted = *offset == data.len();

        inner.queued_bytes -= n;
        if exhausted {
            inner.queue.pop_front();
        }
        n
    }

    /// Take the head bucket as an event, waiting until there is one
    ///
    /// A partially read payload yields only its unread bytes. Pending errors
    /// stay parked; use [`Cache::take_marker`] to have them raised.
    pub fn pop_event(&self) -> Event {
        let mut inner = self.wait_nonempty();
        match Self::remove_head(&mut inner) {
            Some(Bucket::Payload { mut data, offset }) => {
                data.drain(..offset);
                Event::Payload(data)
            }
            Some(Bucket::Control(marker, ctx)) => Event::Control(marker, ctx),
            None => unreachable!("queue emptied under lock"),
        }
    }

    /// Take the head bucket, which must be a marker
    ///
    /// An end-of-file bucket with a parked error raises that error instead.
    pub fn take_marker(&self) -> PipelineResult<(Marker, Context)> {
        let mut inner = self.wait_nonempty();
        if let Some(Bucket::Payload { data, offset }) = inner.queue.front() {
            return Err(PipelineError::UnexpectedBucket(format!(
                "{} payload bytes where a marker was expected",
                data.len() - offset
            )));
        }

        match Self::remove_head(&mut inner) {
            Some(Bucket::Control(Marker::EndOfFile, ctx)) => match inner.pending_error.take() {
                Some(error) => {
                    debug!(%error, "Raising worker failure");
                    Err(error)
                }
                None => Ok((Marker::EndOfFile, ctx)),
            },
            Some(Bucket::Control(marker, ctx)) => Ok((marker, ctx)),
            _ => unreachable!("head checked to be a control bucket"),
        }
    }

    /// Take the head marker, failing unless it is one of `allowed`
    pub fn expect(&self, allowed: &[Marker]) -> PipelineResult<(Marker, Context)> {
        let (marker, ctx) = self.take_marker()?;
        if allowed.contains(&marker) {
            Ok((marker, ctx))
        } else {
            Err(PipelineError::UnexpectedBucket(format!(
                "{marker} while expecting one of {allowed:?}"
            )))
        }
    }

    /// Most recently enqueued marker
    pub fn last_marker(&self) -> Option<Marker> {
        self.lock().last_marker
    }

    /// Context of the most recently enqueued marker
    pub fn last_context(&self) -> Context {
        self.lock().last_context.clone()
    }

    /// Whether an image-closing marker is queued but not yet taken
    pub fn close_pending(&self) -> bool {
        let inner = self.lock();
        inner.closes_produced > inner.closes_consumed
    }

    /// Unread payload bytes in the queue
    pub fn queued_bytes(&self) -> usize {
        self.lock().queued_bytes
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Drop everything queued, including a parked error
    pub fn clear(&self) {
        let mut inner = self.lock();
        if let Some(error) = inner.pending_error.take() {
            debug!(%error, "Discarding parked failure");
        }
        inner.queue.clear();
        inner.queued_bytes = 0;
        inner.last_marker = None;
        inner.last_context = Context::default();
        inner.high_water_warned = false;
        inner.closes_produced = 0;
        inner.closes_consumed = 0;
    }
}

/// Producer side of a [`Cache`], usable as a chain sink
#[derive(Debug)]
pub struct CacheWriter {
    cache: Arc<Cache>,
    /// A terminal marker has been enqueued
    finished: bool,
}

impl CacheWriter {
    fn enqueue_marker(&mut self, marker: Marker, ctx: &Context, error: Option<PipelineError>) {
        let cache = &self.cache;
        let mut inner = cache.lock();
        if marker == Marker::BeginImage {
            inner.high_water_warned = false;
        }
        if marker.closes_image() {
            inner.closes_produced += 1;
        }
        if let Some(error) = error {
            inner.pending_error = Some(error);
        }
        inner.last_marker = Some(marker);
        inner.last_context = ctx.clone();
        cache.push(&mut inner, Bucket::Control(marker, ctx.clone()));
        drop(inner);

        if marker.is_terminal() {
            self.finished = true;
        }
    }
}

impl Output for CacheWriter {
    fn mark(&mut self, marker: Marker, ctx: &Context) -> PipelineResult<()> {
        self.enqueue_marker(marker, ctx, None);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> PipelineResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let mut copy = Vec::new();
        copy.try_reserve_exact(data.len())
            .map_err(|_| PipelineError::ResourceExhausted(data.len()))?;
        copy.extend_from_slice(data);

        let cache = &self.cache;
        let mut inner = cache.lock();
        inner.queued_bytes += data.len();
        if inner.queued_bytes > inner.high_water && !inner.high_water_warned {
            inner.high_water_warned = true;
            warn!(
                queued = inner.queued_bytes,
                high_water = inner.high_water,
                "Reader is falling behind the scan"
            );
        }
        cache.push(
            &mut inner,
            Bucket::Payload {
                data: copy,
                offset: 0,
            },
        );
        Ok(data.len())
    }

    fn fail(&mut self, error: &PipelineError, ctx: &Context) -> PipelineResult<()> {
        self.enqueue_marker(Marker::EndOfFile, ctx, Some(error.duplicate()));
        Ok(())
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        // Keep the consumer from waiting forever on a producer that died
        if !self.finished {
            warn!("Cache producer dropped before a terminal marker");
            let ctx = self.cache.lock().last_context.clone();
            self.enqueue_marker(
                Marker::EndOfFile,
                &ctx,
                Some(PipelineError::UnexpectedBucket(
                    "producer ended without a terminal marker".to_string(),
                )),
            );
        }
    }
}
