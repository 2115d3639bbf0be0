//! S2: a `Task` tool use spawns a subagent, the subagent's own turn lands
//! in its child conversation, and the main-stream `tool_result` that
//! closes the tool use also completes the subagent.

mod support;

use serde_json::json;
use session_host::ids::AgentProfileRef;
use session_host::model::{Architecture, BlockPayload, SubagentStatus};

#[tokio::test]
async fn task_tool_use_spawns_and_completes_a_subagent() {
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

    let state = session.get_state().await.conversation;

    // Main conversation: the Task tool_use and its closing tool_result.
    assert_eq!(state.blocks.len(), 2);
    assert!(matches!(state.blocks[0].payload, BlockPayload::ToolUse { .. }));
    match &state.blocks[1].payload {
        BlockPayload::ToolResult { tool_use_id, output, is_error, .. } => {
            assert_eq!(tool_use_id.as_str(), "t1");
            assert_eq!(output, "4");
            assert!(!is_error);
        }
        other => panic!("unexpected payload: {other:?}"),
    }

    // Subagent conversation: spawned, given its own turn, then completed.
    assert_eq!(state.subagents.len(), 1);
    let sub = &state.subagents[0];
    assert_eq!(sub.status, SubagentStatus::Completed);
    assert_eq!(sub.blocks.len(), 1);
    match &sub.blocks[0].payload {
        BlockPayload::AssistantText { content, .. } => assert_eq!(content, "4"),
        other => panic!("unexpected payload: {other:?}"),
    }
}
