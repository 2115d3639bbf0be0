//! Property-based tests for the reducer fold.
//!
//! Grounded in the teacher's `state_machine/proptests.rs`: arbitrary event
//! sequences checked against invariants that must hold for *any* input,
//! not just the hand-picked cases in `reducer::tests`.

use super::*;
use crate::ids::BlockId;
use crate::model::BlockPayload;
use chrono::Utc;
use proptest::prelude::*;

fn arb_status() -> impl Strategy<Value = BlockStatus> {
    prop_oneof![Just(BlockStatus::Pending), Just(BlockStatus::Complete)]
}

fn arb_upsert(id: &'static str) -> impl Strategy<Value = SessionEventKind> {
    (arb_status(), "[a-zA-Z ]{0,12}").prop_map(move |(status, text)| SessionEventKind::BlockUpsert {
        block: Block::new(
            BlockId::from(id),
            Utc::now(),
            status,
            BlockPayload::AssistantText {
                content: text,
                model: None,
            },
        ),
    })
}

proptest! {
    /// Invariant 1/2: repeated upserts to the same block id never move its
    /// status backwards, regardless of what order pending/complete arrive in.
    #[test]
    fn upserts_never_reverse_block_status(events in prop::collection::vec(arb_upsert("b1"), 1..20)) {
        let mut state = ConversationState::new();
        let mut saw_complete = false;
        for event in &events {
            fold(&mut state, &ConversationId::Main, event).unwrap();
            let status = state.blocks[0].status;
            if saw_complete {
                prop_assert_eq!(status, BlockStatus::Complete);
            }
            saw_complete |= status == BlockStatus::Complete;
        }
    }

    /// Invariant 4: the fold is pure — folding the same event sequence from
    /// the same starting state twice always lands on the same state.
    #[test]
    fn fold_is_deterministic(events in prop::collection::vec(arb_upsert("b1"), 0..20)) {
        let mut a = ConversationState::new();
        let mut b = ConversationState::new();
        for event in &events {
            fold(&mut a, &ConversationId::Main, event).unwrap();
        }
        for event in &events {
            fold(&mut b, &ConversationId::Main, event).unwrap();
        }
        prop_assert_eq!(a, b);
    }
}
