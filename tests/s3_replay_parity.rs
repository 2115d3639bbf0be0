//! S3: stream/replay parity (invariant 3.5). The `ConversationState` built
//! live while streaming must match the one rebuilt by
//! `SessionHost::load_session`'s transcript replay after an unload.

mod support;

use serde_json::json;
use session_host::ids::AgentProfileRef;
use session_host::model::{Architecture, ConversationState};

/// Block/subagent ids are generated fresh by the converter on every parse
/// (`BlockId::new_random()`), so a live run and a later independent replay
/// of the same bytes never share ids — only content, order and status are
/// required to match between the two.
fn shape(state: &ConversationState) -> (Vec<(bool, String)>, Vec<String>) {
    let blocks = state
        .blocks
        .iter()
        .map(|b| (b.status == session_host::model::BlockStatus::Complete, format!("{:?}", b.payload)))
        .collect();
    let subagents = state
        .subagents
        .iter()
        .map(|s| format!("{:?}/{:?}", s.status, s.blocks.iter().map(|b| format!("{:?}", b.payload)).collect::<Vec<_>>()))
        .collect();
    (blocks, subagents)
}

#[tokio::test]
async fn reloaded_conversation_state_matches_the_live_one() {
    let host = support::host();
    let script = vec![
        json!({
            "type": "assistant",
            "message": {
                "model": "claude-x",
                "content": [{
                    "type": "tool_use",
                    "id": "t1",
                    "name": "Task",
                    "input": {"prompt": "sum 2+2", "subagent_type": "helper"}
                }]
            }
        }),
        json!({
            "type": "assistant",
            "parent_tool_use_id": "t1",
            "message": {
                "model": "claude-x",
                "content": [{"type": "text", "text": "4"}]
            }
        }),
        json!({
            "type": "user",
            "message": {
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": "t1",
                    "content": "4",
                    "is_error": false
                }]
            }
        }),
        json!({
            "type": "assistant",
            "message": {
                "model": "claude-x",
                "content": [{"type": "text", "text": "The answer is 4."}]
            }
        }),
    ];

    let session_id = host
        .create_session(
            AgentProfileRef::from("default"),
            Architecture::ClaudeSdk,
            support::options(script),
        )
        .await
        .unwrap();
    let session = host.get_session(&session_id).await.unwrap();
    session.enqueue_query("sum 2 and 2").await.unwrap();
    support::wait_idle(&session).await;

    let live_state = session.get_state().await.conversation;
    assert_eq!(live_state.blocks.len(), 3, "Task use, tool_result, final text");
    assert_eq!(live_state.subagents.len(), 1);

    session.sync_now().await;
    host.unload_session(&session_id).await.unwrap();

    let reloaded = host.load_session(&session_id).await.unwrap();
    let replayed_state = reloaded.get_state().await.conversation;

    assert_eq!(shape(&live_state), shape(&replayed_state));
}
