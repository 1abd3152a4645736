// SPDX-License-Identifier: GPL-3.0-only

//! Pass-through stage

use crate::pipelines::stage::{Filter, Transform};

/// Forwards markers and bytes unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct Identity;

impl Identity {
    /// Identity wrapped as a ready-to-push stage
    pub fn stage() -> Filter<Identity> {
        Filter::new(Identity)
    }
}

impl Transform for Identity {
    fn name(&self) -> &str {
        "identity"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipelines::context::Context;
    use crate::pipelines::marker::Marker;
    use crate::pipelines::stage::{MemorySink, Stage};
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn chunking_does_not_change_output(
            data in proptest::collection::vec(any::<u8>(), 0..4096),
            cuts in proptest::collection::vec(1usize..512, 0..32),
        ) {
            let mut stage = Identity::stage();
            let mut sink = MemorySink::new();
            let ctx = Context::default();

            stage.mark(Marker::BeginSequence, &ctx, &mut sink).unwrap();
            stage.mark(Marker::BeginImage, &ctx, &mut sink).unwrap();
            let mut rest = data.as_slice();
            for cut in cuts {
                let (chunk, tail) = rest.split_at(cut.min(rest.len()));
                prop_assert_eq!(stage.write(chunk, &mut sink).unwrap(), chunk.len());
                rest = tail;
            }
            stage.write(rest, &mut sink).unwrap();
            stage.mark(Marker::EndImage, &ctx, &mut sink).unwrap();

            prop_assert_eq!(sink.bytes(), data.clone());
            let done = sink.last_context(Marker::EndImage).unwrap();
            prop_assert_eq!(done.octets_seen(), data.len() as u64);
        }
    }
}
