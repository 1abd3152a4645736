// SPDX-License-Identifier: GPL-3.0-only

//! Stage pipelines for scanned images
//!
//! Image data flows as a stream of markers and bytes through an ordered chain
//! of stages into a sink. Every stage keeps the stream well formed: it
//! forwards exactly one marker for each marker it receives, and reports
//! failures as end-of-file.
//!
//! # Pipeline Architecture
//!
//! ```text
//! ┌────────┐     ┌──────────────────────────────┐     ┌────────────────┐
//! │ Source │ ──▶ │ Chain                        │ ──▶ │ Sink           │
//! │        │     │  - Padding                   │     │  (bridge cache │
//! │        │     │  - ExternalProcess (helper)  │     │   or memory)   │
//! │        │     │  - …                         │     │                │
//! └────────┘     └──────────────────────────────┘     └────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`marker`]: structural markers and the per-edge sequence state
//! - [`context`]: image geometry attached to every marker
//! - [`stage`]: the output and stage contracts plus the [`Filter`] driver
//! - [`chain`]: ordered composition and the pump loop
//! - [`filters`]: built-in in-process stages
//! - [`external`]: stage piping each image through a helper program

pub mod chain;
pub mod context;
pub mod external;
pub mod filters;
pub mod marker;
pub mod stage;

pub use chain::Chain;
pub use context::{Context, Orientation};
pub use external::{ExternalProcess, helper_available};
pub use marker::{Event, Marker, SequenceState};
pub use stage::{Filter, MemorySink, Output, Stage, Transform};
