//! S5: ref-counted fan-out (spec §4.7). Two independent subscribers on the
//! same session see the same event sequence; unsubscribing one leaves the
//! other receiving.

mod support;

use serde_json::json;
use session_host::eventbus::recv;
use session_host::ids::AgentProfileRef;
use session_host::model::Architecture;

#[tokio::test]
async fn two_subscribers_see_the_same_events_and_ref_count_tracks_both() {
    let host = support::host();
    let script = vec![
        json!({
            "type": "assistant",
            "message": {"model": "claude-x", "content": [{"type": "text", "text": "first"}]}
        }),
        json!({
            "type": "assistant",
            "message": {"model": "claude-x", "content": [{"type": "text", "text": "second"}]}
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

    let mut rx_a = host.event_bus().subscribe(&session_id).await;
    let mut rx_b = host.event_bus().subscribe(&session_id).await;
    assert_eq!(host.event_bus().ref_count(&session_id).await, 2);

    let session = host.get_session(&session_id).await.unwrap();
    session.enqueue_query("hi").await.unwrap();
    support::wait_idle(&session).await;

    let mut seen_a = Vec::new();
    loop {
        let event = recv(&mut rx_a).await.expect("event on rx_a");
        seen_a.push(event.type_name().to_string());
        if event.type_name() == "query:completed" {
            break;
        }
    }

    // Unsubscribe the first client before draining the second, then keep
    // going: the second subscriber should still see its own copy of the
    // full sequence, undisturbed by the first client leaving.
    host.event_bus().unsubscribe(&session_id).await;
    assert_eq!(host.event_bus().ref_count(&session_id).await, 1);

    let mut seen_b = Vec::new();
    loop {
        let event = recv(&mut rx_b).await.expect("event on rx_b");
        seen_b.push(event.type_name().to_string());
        if event.type_name() == "query:completed" {
            break;
        }
    }
    assert_eq!(seen_a, seen_b);

    // The second client is still live for a follow-up query.
    session.enqueue_query("again").await.unwrap();
    support::wait_idle(&session).await;
    let event = recv(&mut rx_b).await.expect("event on rx_b after unsubscribe");
    assert_eq!(event.type_name(), "query:started");
}
