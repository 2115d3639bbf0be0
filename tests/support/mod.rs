//! Shared scaffolding for the scenario tests under `tests/`: a
//! `SessionFactory` that reads its script straight out of
//! `SessionRecord::session_options`, so each scenario can hand
//! `SessionHost::create_session` a different canned conversation without
//! its own factory type.

use serde_json::{json, Value};
use session_host::ee::testing::FlakyDriver;
use session_host::model::SessionRecord;
use session_host::runner::testing::ScriptedRunner;
use session_host::{SessionFactory, SessionHost};

pub struct ScriptedFactory;

impl SessionFactory for ScriptedFactory {
    type Runner = ScriptedRunner;
    type Driver = FlakyDriver;

    fn build(&self, record: &SessionRecord) -> (Self::Runner, Self::Driver) {
        let script = record
            .session_options
            .get("script")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let ee_fail_times = record
            .session_options
            .get("ee_fail_times")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        (ScriptedRunner::new(script), FlakyDriver::new(ee_fail_times))
    }
}

/// Build `session_options` carrying a script (and, for S4, a number of
/// times the EE driver should fail `create` before succeeding).
pub fn options(script: Vec<Value>) -> Value {
    json!({ "script": script })
}

pub fn options_with_flaky_ee(script: Vec<Value>, ee_fail_times: u32) -> Value {
    json!({ "script": script, "ee_fail_times": ee_fail_times })
}

pub type TestHost = SessionHost<ScriptedFactory, session_host::persistence::memory::InMemoryPersistence>;

pub fn host() -> TestHost {
    SessionHost::new(
        ScriptedFactory,
        session_host::persistence::memory::InMemoryPersistence::new(),
        session_host::HostConfig::default(),
    )
}

/// Poll `get_state` until no query is active, same pattern the unit tests
/// use — the executor runs on its own spawned task so completion isn't
/// synchronous with `enqueue_query` returning.
pub async fn wait_idle(session: &session_host::Session<ScriptedRunner, FlakyDriver, std::sync::Arc<session_host::persistence::memory::InMemoryPersistence>>) {
    for _ in 0..200 {
        if session.get_state().await.runtime.active_query.is_none() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("session never went idle");
}
