// SPDX-License-Identifier: GPL-3.0-only

//! Property tests for chain runs

use proptest::prelude::*;
use scanflow::backends::{Pulled, ScriptedSource, Source};
use scanflow::pipelines::filters::{Identity, Padding};
use scanflow::pipelines::{Chain, Context, Event, Marker, MemorySink, SequenceState};

/// Check the marker stream a sink received is well formed
fn assert_well_formed(markers: &[Marker]) {
    let mut state = SequenceState::default();
    for (i, marker) in markers.iter().enumerate() {
        assert!(
            state.advance(*marker),
            "{marker} at position {i} in {markers:?}"
        );
    }
    let terminals = markers.iter().filter(|m| m.is_terminal()).count();
    assert_eq!(terminals, 1, "{markers:?}");
    assert!(markers.last().is_some_and(|m| m.is_terminal()));
}

fn script(images: &[Vec<u8>], chunk: usize, cut_after: Option<usize>) -> ScriptedSource {
    let ctx = Context::default();
    let complete = ScriptedSource::images(&ctx, images, chunk);
    match cut_after {
        None => complete,
        Some(keep) => {
            // Replay only a prefix of the complete script, then fail
            let mut events = Vec::new();
            let mut source = complete;
            let mut buf = vec![0u8; chunk.max(1)];
            while events.len() < keep {
                match source.read(&mut buf).unwrap() {
                    Pulled::Bytes(n) => {
                        events.push(Event::Payload(buf[..n].to_vec()))
                    }
                    Pulled::Marker(marker, ctx) => {
                        if marker.is_terminal() {
                            break;
                        }
                        events.push(Event::Control(marker, ctx));
                    }
                }
            }
            ScriptedSource::new(events).fail_with("device went away")
        }
    }
}

proptest! {
    #[test]
    fn every_run_ends_with_one_terminal(
        images in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..300), 0..4),
        chunk in 1usize..128,
        stages in 0usize..4,
        cut_after in proptest::option::of(0usize..20),
    ) {
        let mut source = script(&images, chunk, cut_after);
        let mut chain = Chain::new(MemorySink::new()).with_chunk_size(chunk);
        for i in 0..stages {
            if i % 2 == 0 {
                chain.push(Identity::stage());
            } else {
                chain.push(Padding::stage());
            }
        }

        let result = chain.run(&mut source);
        let sink = chain.into_sink();
        assert_well_formed(&sink.markers());

        match result {
            Ok(marker) => {
                prop_assert_eq!(marker, Marker::EndSequence);
                prop_assert_eq!(sink.images(), images);
            }
            Err(e) => {
                prop_assert!(cut_after.is_some(), "unexpected failure {}", e);
                let markers = sink.markers();
                prop_assert_eq!(markers.last(), Some(&Marker::EndOfFile));
            }
        }
    }
}

#[test]
fn test_terminal_only_run() {
    let mut source = ScriptedSource::new([Event::Control(Marker::EndOfFile, Context::default())]);
    let mut chain = Chain::new(MemorySink::new());
    chain.push(Identity::stage());
    assert_eq!(chain.run(&mut source).unwrap(), Marker::EndOfFile);
    assert_eq!(chain.sink().markers(), vec![Marker::EndOfFile]);
}
