//! `EventConverter` — raw vendor message to `SessionEvent[]` (spec §4.5).
//!
//! Generalized from the teacher's `runtime::executor`'s effect-dispatch
//! loop (react to one inbound thing, emit zero or more typed outputs) into
//! a conversion step that sits in front of the reducer instead of
//! alongside it. Unlike `reducer::fold`, a converter is *stateful per
//! session* (spec §4.5) — it tracks open content blocks, the subagent
//! prompt-suppression table, and similar per-stream scratch, which is why
//! it is a trait object held by `Session` rather than a free function.

pub mod claude_sdk;
pub mod lru;
pub mod opencode;

use crate::ids::SessionId;
use crate::model::SessionEvent;
use serde_json::Value;

/// Per-session, per-architecture raw-message translator (spec §4.5).
///
/// `parse_event` must never emit `block:delta` for a block it has not
/// already upserted, and must emit `subagent:spawned` strictly before any
/// block belonging to that subagent (invariants 2–4, §8 property 3–4).
pub trait EventConverter: Send {
    /// Translate one raw vendor message into zero or more `SessionEvent`s.
    /// Unknown message types return `[]` plus a `log{level=warn}` event
    /// rather than an error, per §4.5's shared contract.
    fn parse_event(&mut self, session_id: &SessionId, raw: &Value) -> Vec<SessionEvent>;

    /// Reset all per-session scratch state (open blocks, caches). Used
    /// when a session's `EventConverter` is reused across an EE restart
    /// within the same `Session` (spec §4.3's "fresh EE" after restart
    /// does not imply a fresh converter, but a fresh *query* does not
    /// carry over unfinished streaming scratch from a canceled one).
    fn reset(&mut self);
}

impl<T: EventConverter + ?Sized> EventConverter for Box<T> {
    fn parse_event(&mut self, session_id: &SessionId, raw: &Value) -> Vec<SessionEvent> {
        (**self).parse_event(session_id, raw)
    }

    fn reset(&mut self) {
        (**self).reset();
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod testing {
    use super::*;

    /// A converter that hands raw JSON straight through as `log` events,
    /// for tests that only care about the `Session`/`EventBus` plumbing
    /// and not real vendor parsing.
    #[derive(Debug, Default)]
    pub struct EchoConverter;

    impl EventConverter for EchoConverter {
        fn parse_event(&mut self, session_id: &SessionId, raw: &Value) -> Vec<SessionEvent> {
            use crate::model::{EventContext, EventSource, LogLevel, SessionEventKind};
            vec![SessionEvent::new(
                EventContext::new(
                    session_id.clone(),
                    None,
                    EventSource::Runner,
                    chrono::Utc::now().timestamp_millis(),
                ),
                SessionEventKind::Log {
                    level: LogLevel::Debug,
                    message: "echo".into(),
                    data: Some(raw.clone()),
                },
            )]
        }

        fn reset(&mut self) {}
    }
}
