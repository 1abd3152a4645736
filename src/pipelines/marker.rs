// SPDX-License-Identifier: GPL-3.0-only

//! Structural markers and the two-level sequence/image state machine
//!
//! Markers travel in-band with the image bytes. A well-formed stream reads
//!
//! ```text
//! BeginSequence (BeginImage bytes* EndImage)* EndSequence
//! ```
//!
//! and `EndOfFile` may cut in anywhere, aborting whatever is open.

use super::context::Context;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Structural sentinel interleaved with image payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Marker {
    /// Begin of a sequence of images (one acquisition run)
    BeginSequence,
    /// Begin of one image; the attached context describes it
    BeginImage,
    /// End of the current image
    EndImage,
    /// End of the sequence, no more images follow
    EndSequence,
    /// Abnormal end: aborts the open image and sequence
    EndOfFile,
}

impl Marker {
    /// All markers, in protocol order
    pub const ALL: [Marker; 5] = [
        Marker::BeginSequence,
        Marker::BeginImage,
        Marker::EndImage,
        Marker::EndSequence,
        Marker::EndOfFile,
    ];

    /// Whether this marker ends a chain run
    pub fn is_terminal(self) -> bool {
        matches!(self, Marker::EndSequence | Marker::EndOfFile)
    }

    /// Whether this marker closes an open image
    pub fn closes_image(self) -> bool {
        matches!(self, Marker::EndImage | Marker::EndOfFile)
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Marker::BeginSequence => "begin-of-sequence",
            Marker::BeginImage => "begin-of-image",
            Marker::EndImage => "end-of-image",
            Marker::EndSequence => "end-of-sequence",
            Marker::EndOfFile => "end-of-file",
        };
        f.write_str(name)
    }
}

/// One unit travelling along a pipeline edge
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Image bytes
    Payload(Vec<u8>),
    /// A marker with the context it applies to
    Control(Marker, Context),
}

/// Position in the sequence/image protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SequenceState {
    /// Nothing open
    #[default]
    Idle,
    /// Between images of an open sequence
    SequenceOpen,
    /// Inside an image
    ImageOpen,
    /// Aborted by end-of-file
    Error,
}

impl SequenceState {
    /// Compute the state following `marker`
    ///
    /// Returns `None` when the marker is not legal here. End-of-file is legal
    /// from every state.
    pub fn next(self, marker: Marker) -> Option<SequenceState> {
        use Marker::*;
        use SequenceState::*;

        match (self, marker) {
            (_, EndOfFile) => Some(Error),
            (Idle | Error, BeginSequence) => Some(SequenceOpen),
            (SequenceOpen, BeginImage) => Some(ImageOpen),
            (ImageOpen, EndImage) => Some(SequenceOpen),
            (SequenceOpen, EndSequence) => Some(Idle),
            _ => None,
        }
    }

    /// Advance in place, returning whether the transition was legal
    ///
    /// An illegal marker still moves the machine to where the marker would
    /// lead so that a single glitch does not poison the rest of the stream.
    pub fn advance(&mut self, marker: Marker) -> bool {
        match self.next(marker) {
            Some(next) => {
                *self = next;
                true
            }
            None => {
                *self = match marker {
                    Marker::BeginSequence | Marker::EndImage => SequenceState::SequenceOpen,
                    Marker::BeginImage => SequenceState::ImageOpen,
                    Marker::EndSequence => SequenceState::Idle,
                    Marker::EndOfFile => SequenceState::Error,
                };
                false
            }
        }
    }

    /// Whether byte payload is acceptable in this state
    pub fn accepts_payload(self) -> bool {
        self == SequenceState::ImageOpen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_formed_sequence() {
        let mut state = SequenceState::default();
        for marker in [
            Marker::BeginSequence,
            Marker::BeginImage,
            Marker::EndImage,
            Marker::BeginImage,
            Marker::EndImage,
            Marker::EndSequence,
        ] {
            assert!(state.advance(marker), "{marker} rejected in {state:?}");
        }
        assert_eq!(state, SequenceState::Idle);
    }

    #[test]
    fn test_end_of_file_from_anywhere() {
        for start in [
            SequenceState::Idle,
            SequenceState::SequenceOpen,
            SequenceState::ImageOpen,
            SequenceState::Error,
        ] {
            assert_eq!(start.next(Marker::EndOfFile), Some(SequenceState::Error));
        }
    }

    #[test]
    fn test_illegal_transitions() {
        assert_eq!(SequenceState::Idle.next(Marker::BeginImage), None);
        assert_eq!(SequenceState::ImageOpen.next(Marker::EndSequence), None);
        assert_eq!(SequenceState::SequenceOpen.next(Marker::EndImage), None);
        assert_eq!(SequenceState::ImageOpen.next(Marker::BeginSequence), None);
    }

    #[test]
    fn test_error_reopens_with_sequence() {
        let mut state = SequenceState::Error;
        assert!(state.advance(Marker::BeginSequence));
        assert_eq!(state, SequenceState::SequenceOpen);
    }

    #[test]
    fn test_illegal_advance_resyncs() {
        let mut state = SequenceState::Idle;
        assert!(!state.advance(Marker::BeginImage));
        assert_eq!(state, SequenceState::ImageOpen);
        assert!(state.advance(Marker::EndImage));
    }

    #[test]
    fn test_terminal_markers() {
        let terminal: Vec<_> = Marker::ALL.iter().filter(|m| m.is_terminal()).collect();
        assert_eq!(terminal, [&Marker::EndSequence, &Marker::EndOfFile]);
    }
}
