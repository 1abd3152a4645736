// SPDX-License-Identifier: GPL-3.0-only

//! scanflow - image data pipelines for scanner drivers
//!
//! This library moves scanned image data from an acquisition source through a
//! chain of processing stages, optionally delegating stages to external helper
//! programs, and hands the result to a synchronous polling caller.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`pipelines`]: markers, contexts, the stage contract, chains and stages
//! - [`backends`]: sources, devices and option access
//! - [`bridge`]: the producer/consumer cache and the chain worker thread
//! - [`session`]: the begin/read/cancel façade
//! - [`config`]: pipeline configuration
//! - [`errors`]: the crate error type
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(device, PipelineConfig::default());
//! session.start()?;
//! while let ReadStatus::Data(n) = session.read(&mut buf)? {
//!     out.write_all(&buf[..n])?;
//! }
//! ```

pub mod backends;
pub mod bridge;
pub mod config;
pub mod constants;
pub mod errors;
pub mod pipelines;
pub mod session;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use errors::{PipelineError, PipelineResult};
pub use pipelines::{Chain, Context, Marker};
pub use session::{CancelHandle, ReadStatus, Session, SessionState};
