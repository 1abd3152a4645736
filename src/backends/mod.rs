// SPDX-License-Identifier: GPL-3.0-only

//! Acquisition side of the pipeline
//!
//! The scanner driver itself (wire protocol, option constraints) lives
//! elsewhere. This module holds the seams the pipeline consumes from it:
//!
//! - [`source`]: pull-style byte/marker sources
//! - [`options`]: read-only option getters
//! - [`device`]: what a session opens a source from
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   read()   ┌─────────────┐   mark()/write()   ┌────────┐
//! │    Source    │ ─────────▶ │    Chain    │ ─────────────────▶ │  Sink  │
//! │ (scanner I/O)│            │  (stages)   │                    │(bridge)│
//! └──────────────┘            └─────────────┘                    └────────┘
//! ```

pub mod device;
pub mod options;
pub mod source;

pub use device::{Device, RawFileDevice, ScriptedDevice};
pub use options::{MapOptions, OptionSource, OptionValue};
pub use source::{Pulled, RawImageSource, ScriptedSource, Source};
