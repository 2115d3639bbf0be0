//! S1: create a Claude-SDK session, send one message, and watch it stream
//! through to conversation state and the event bus.

mod support;

use serde_json::json;
use session_host::eventbus::recv;
use session_host::ids::AgentProfileRef;
use session_host::model::{Architecture, BlockPayload};

#[tokio::test]
async fn create_send_and_stream_assistant_reply() {
    let host = support::host();
    let script = vec![json!({
        "type": "assistant",
        "message": {
            "model": "claude-x",
            "content": [{"type": "text", "text": "Hello from assistant"}]
        }
    })];

    let session_id = host
        .create_session(
            AgentProfileRef::from("default"),
            Architecture::ClaudeSdk,
            support::options(script),
        )
        .await
        .unwrap();

    let mut rx = host.event_bus().subscribe(&session_id).await;
    let session = host.get_session(&session_id).await.unwrap();
    session.enqueue_query("hi").await.unwrap();
    support::wait_idle(&session).await;

    let state = session.get_state().await;
    assert_eq!(state.conversation.blocks.len(), 1);
    match &state.conversation.blocks[0].payload {
        BlockPayload::AssistantText { content, model } => {
            assert_eq!(content, "Hello from assistant");
            assert_eq!(model.as_deref(), Some("claude-x"));
        }
        other => panic!("unexpected payload: {other:?}"),
    }

    // The bus saw the query lifecycle in emission order.
    let mut seen = Vec::new();
    loop {
        let event = recv(&mut rx).await.expect("event");
        seen.push(event.type_name().to_string());
        if event.type_name() == "query:completed" {
            break;
        }
    }
    assert_eq!(seen.first().map(String::as_str), Some("query:started"));
    assert!(seen.contains(&"block:upsert".to_string()));
    assert_eq!(seen.last().map(String::as_str), Some("query:completed"));
}
