//! `TranscriptParser` (spec §4.8): rebuild a `ConversationState` from
//! persisted transcripts through the *same* converter/reducer pipeline
//! streaming uses, which is what makes invariant 3.5 (stream/replay
//! parity) hold rather than merely be asserted.

use crate::converter::claude_sdk::ClaudeSdkConverter;
use crate::converter::opencode::OpencodeConverter;
use crate::converter::EventConverter;
use crate::error::ReducerError;
use crate::ids::{ConversationId, SessionId, SubagentId};
use crate::model::{Architecture, ConversationState};
use crate::reducer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// The "combined" container one `PersistenceAdapter` transcript save
/// produces: one blob for the main conversation plus one per subagent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedTranscript {
    pub main: String,
    #[serde(default)]
    pub subagents: Vec<SubagentTranscript>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentTranscript {
    pub id: SubagentId,
    pub transcript: String,
}

/// Split a raw transcript blob into its newline-delimited JSON messages.
/// Blank lines are skipped; malformed lines are dropped with a warning
/// rather than aborting the whole replay, matching §7's "drop + log"
/// recovery policy for adapter-produced garbage.
pub fn parse_one_transcript(blob: &str) -> Vec<Value> {
    blob.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<Value>(line) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %e, "dropping unparseable transcript line");
                None
            }
        })
        .collect()
}

/// Build the converter for `architecture`. Shared with `host`, which needs
/// the same construction for the fresh converter a resumed session streams
/// through (replay's converter is scratch-only and discarded with it).
pub(crate) fn new_converter(
    architecture: Architecture,
    subagent_prompt_cache_size: usize,
    opencode_main_session_id: &str,
) -> Box<dyn EventConverter> {
    match architecture {
        Architecture::ClaudeSdk => Box::new(ClaudeSdkConverter::new(subagent_prompt_cache_size)),
        Architecture::Opencode => Box::new(OpencodeConverter::new(opencode_main_session_id)),
    }
}

/// Feed one raw message through `converter` and fold every resulting
/// event into `state`, at whichever conversation the converter routed it
/// to (falling back to `Main` when a converter omits `conversation_id`).
/// Reducer errors are logged and dropped, never fatal to the replay —
/// the same policy `Session` applies while streaming live.
fn fold_raw_message(
    state: &mut ConversationState,
    converter: &mut dyn EventConverter,
    session_id: &SessionId,
    raw: &Value,
) {
    for event in converter.parse_event(session_id, raw) {
        let conversation_id = event.context.conversation_id.clone().unwrap_or(ConversationId::Main);
        if let Err(e) = reducer::fold(state, &conversation_id, &event.kind) {
            warn!(error = %e, conversation_id = %conversation_id, "dropping event during transcript replay");
        }
    }
}

/// `parseCombinedTranscript` (spec §4.8): rebuild the full
/// `ConversationState`, main plus every subagent, from one session's
/// saved transcripts.
///
/// Main is replayed first since a subagent's existence (the
/// `subagent:spawned` event, emitted from the `Task` tool use in the main
/// stream) must precede replay of that subagent's own transcript for the
/// reducer's `UnknownSubagent`/orphan-block safeguards to not fire.
///
/// `opencode_main_session_id` is only consulted for `Architecture::Opencode`
/// (the OpenCode-native session id that identifies "main" in its own wire
/// format); Claude-SDK replay ignores it.
pub fn parse_combined_transcript(
    session_id: &SessionId,
    architecture: Architecture,
    combined: &CombinedTranscript,
    subagent_prompt_cache_size: usize,
    opencode_main_session_id: &str,
) -> ConversationState {
    let mut state = ConversationState::new();
    let mut converter = new_converter(architecture, subagent_prompt_cache_size, opencode_main_session_id);

    for raw in parse_one_transcript(&combined.main) {
        fold_raw_message(&mut state, converter.as_mut(), session_id, &raw);
    }
    for sub in &combined.subagents {
        for raw in parse_one_transcript(&sub.transcript) {
            fold_raw_message(&mut state, converter.as_mut(), session_id, &raw);
        }
    }

    state
}

/// Result alias kept for callers that want to propagate the first
/// reducer error instead of the log-and-drop policy (e.g. a strict
/// consistency-check tool); unused by `Session` itself.
pub type TranscriptResult<T> = Result<T, ReducerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BlockPayload;

    fn sid() -> SessionId {
        SessionId::from("s1")
    }

    #[test]
    fn parse_one_transcript_skips_blank_and_malformed_lines() {
        let blob = "{\"type\":\"a\"}\n\nnot json\n{\"type\":\"b\"}\n";
        let messages = parse_one_transcript(blob);
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn combined_transcript_replays_claude_sdk_main_conversation() {
        let combined = CombinedTranscript {
            main: serde_json::json!({
                "type": "user",
                "message": {"content": [{"type": "text", "text": "hi"}]}
            })
            .to_string(),
            subagents: vec![],
        };
        let state = parse_combined_transcript(&sid(), Architecture::ClaudeSdk, &combined, 100, "main-session");
        assert_eq!(state.blocks.len(), 1);
        match &state.blocks[0].payload {
            BlockPayload::UserMessage { content } => assert_eq!(content, "hi"),
            _ => unreachable!(),
        }
    }

    #[test]
    fn combined_transcript_replays_subagent_after_main_spawns_it() {
        let main_lines = vec![
            serde_json::json!({
                "type": "assistant",
                "message": {
                    "model": "claude-x",
                    "content": [{"type": "tool_use", "id": "t1", "name": "Task", "input": {"prompt": "sum 2+2"}}]
                }
            }),
        ];
        let main_blob = main_lines
            .iter()
            .map(std::string::ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n");

        let sub_line = serde_json::json!({
            "type": "assistant",
            "parent_tool_use_id": "t1",
            "message": {
                "model": "claude-x",
                "content": [{"type": "text", "text": "4"}]
            }
        });

        let combined = CombinedTranscript {
            main: main_blob,
            subagents: vec![SubagentTranscript {
                id: SubagentId::from("t1"),
                transcript: sub_line.to_string(),
            }],
        };

        let state = parse_combined_transcript(&sid(), Architecture::ClaudeSdk, &combined, 100, "main-session");
        assert_eq!(state.subagents.len(), 1);
        assert_eq!(state.subagents[0].blocks.len(), 1);
        match &state.subagents[0].blocks[0].payload {
            BlockPayload::AssistantText { content, .. } => assert_eq!(content, "4"),
            _ => unreachable!(),
        }
    }
}
