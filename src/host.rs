//! `SessionHost` — the top-level supervisor (spec §4.1).
//!
//! Grounded on the teacher's `RuntimeManager` (`runtime.rs`): one map of
//! live handles behind a lock, a `get_or_create`-shaped load path, and a
//! resume decision made from persisted history before a handle is spawned.
//! Generalized from "one map of running conversation runtimes" to the
//! fuller create/load/unload/destroy/shutdown lifecycle §4.1 describes,
//! and parameterized over a [`SessionFactory`] instead of the teacher's
//! fixed `DatabaseStorage`/`RegistryLlmClient` pair, since a `Runner`/
//! `EEDriver` choice depends on the session's `Architecture`.

use crate::config::HostConfig;
use crate::ee::EEDriver;
use crate::error::{HostError, HostResult};
use crate::eventbus::EventBus;
use crate::ids::{AgentProfileRef, ConversationId, SessionId};
use crate::model::{Architecture, ConversationState, SessionRecord};
use crate::persistence::PersistenceAdapter;
use crate::runner::Runner;
use crate::session::Session;
use crate::transcript::{self, CombinedTranscript, SubagentTranscript};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Supplies the `Runner`/`EEDriver` pair a session needs, chosen by the
/// embedder from `SessionRecord::architecture` and whatever process/sandbox
/// plumbing it wants (spec §1: concrete runners and drivers are provided
/// by the embedder, not this crate). One `SessionFactory` implementation
/// fixes concrete `Runner`/`Driver` types for every session a given
/// `SessionHost` manages, the same way the teacher's `RuntimeManager` is
/// monomorphic over one `LlmClient`/`ToolExecutor` pair.
pub trait SessionFactory: Send + Sync {
    type Runner: Runner + 'static;
    type Driver: EEDriver + 'static;

    fn build(&self, record: &SessionRecord) -> (Self::Runner, Self::Driver);
}

/// The supervisor for every session this process hosts: creates records,
/// loads/unloads sessions in and out of memory, and owns the shared
/// `EventBus` every loaded session publishes through.
pub struct SessionHost<F: SessionFactory, P: PersistenceAdapter> {
    factory: F,
    persistence: Arc<P>,
    bus: Arc<EventBus>,
    config: HostConfig,
    loaded: RwLock<HashMap<SessionId, Arc<Session<F::Runner, F::Driver, Arc<P>>>>>,
}

impl<F, P> SessionHost<F, P>
where
    F: SessionFactory,
    P: PersistenceAdapter + 'static,
{
    pub fn new(factory: F, persistence: P, config: HostConfig) -> Self {
        Self {
            factory,
            persistence: Arc::new(persistence),
            bus: Arc::new(EventBus::new(&config)),
            config,
            loaded: RwLock::new(HashMap::new()),
        }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// `createSession` (spec §4.1): persist a brand-new `SessionRecord` and
    /// load it immediately — a session always starts out loaded, same as
    /// the teacher's `get_or_create` spawning a runtime the moment it
    /// learns a conversation doesn't have one yet.
    pub async fn create_session(
        &self,
        agent_profile_ref: AgentProfileRef,
        architecture: Architecture,
        session_options: Value,
    ) -> HostResult<SessionId> {
        self.check_capacity().await?;

        let record = SessionRecord::new(SessionId::new_random(), agent_profile_ref, architecture, session_options);
        self.persistence.create_session_record(&record).await?;

        let (runner, driver) = self.factory.build(&record);
        let converter = transcript::new_converter(architecture, self.config.subagent_prompt_cache_size, record.session_id.as_str());

        let session_id = record.session_id.clone();
        let (session, _handle) = Session::spawn(
            record,
            ConversationState::new(),
            converter,
            runner,
            driver,
            Arc::clone(&self.persistence),
            Arc::clone(&self.bus),
            self.config.clone(),
            false,
        );

        self.loaded.write().await.insert(session_id.clone(), session);
        info!(%session_id, "session created");
        Ok(session_id)
    }

    /// `loadSession` (spec §4.1): bring a previously-created session back
    /// into memory, replaying its saved transcripts through the same
    /// converter/reducer pipeline live streaming uses (invariant 3.5) to
    /// rebuild `ConversationState`, and flagging `needsAttention` when that
    /// replay shows the session was interrupted mid-turn (SPEC_FULL.md
    /// §C.1) — the direct analog of the teacher's
    /// `determine_resume_state`/`recovery::should_auto_continue` check.
    pub async fn load_session(&self, session_id: &SessionId) -> HostResult<Arc<Session<F::Runner, F::Driver, Arc<P>>>> {
        if let Some(session) = self.loaded.read().await.get(session_id) {
            return Ok(Arc::clone(session));
        }
        self.check_capacity().await?;

        let loaded = self
            .persistence
            .load_session(session_id)
            .await?
            .ok_or_else(|| HostError::NotFound(session_id.to_string()))?;

        let combined = combine_transcripts(&loaded.transcripts_by_conversation);
        let state = transcript::parse_combined_transcript(
            session_id,
            loaded.record.architecture,
            &combined,
            self.config.subagent_prompt_cache_size,
            session_id.as_str(),
        );
        let needs_attention = looks_interrupted(&state);

        let (runner, driver) = self.factory.build(&loaded.record);
        let converter = transcript::new_converter(
            loaded.record.architecture,
            self.config.subagent_prompt_cache_size,
            session_id.as_str(),
        );

        let (session, _handle) = Session::spawn(
            loaded.record,
            state,
            converter,
            runner,
            driver,
            Arc::clone(&self.persistence),
            Arc::clone(&self.bus),
            self.config.clone(),
            needs_attention,
        );

        self.loaded.write().await.insert(session_id.clone(), Arc::clone(&session));
        if needs_attention {
            warn!(%session_id, "loaded session was interrupted mid-turn, flagged for attention");
        }
        Ok(session)
    }

    /// `unloadSession` (spec §4.1): drop a session out of memory without
    /// touching its persisted record or transcripts. Cancels an in-flight
    /// query first (spec §8: "concurrent unloadSession + in-flight query:
    /// query is canceled; query:failed{code=Canceled} is the final event"),
    /// then flushes any outstanding write-ahead buffer so nothing is lost.
    pub async fn unload_session(&self, session_id: &SessionId) -> HostResult<()> {
        let session = self
            .loaded
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| HostError::NotFound(session_id.to_string()))?;
        session.cancel_active_query_and_wait().await;
        session.sync_now().await;
        let _ = session.terminate_execution_environment().await;
        Ok(())
    }

    /// `destroySession` (spec §4.1): unload, if loaded. Deleting the
    /// persisted record/transcripts themselves is outside
    /// `PersistenceAdapter`'s contract (spec §6.2 only names session-file
    /// deletion, not whole-session deletion) — that's left to the embedder.
    pub async fn destroy_session(&self, session_id: &SessionId) -> HostResult<()> {
        if self.loaded.read().await.contains_key(session_id) {
            self.unload_session(session_id).await?;
        }
        Ok(())
    }

    pub async fn get_session(&self, session_id: &SessionId) -> Option<Arc<Session<F::Runner, F::Driver, Arc<P>>>> {
        self.loaded.read().await.get(session_id).cloned()
    }

    pub async fn get_loaded_session_ids(&self) -> Vec<SessionId> {
        self.loaded.read().await.keys().cloned().collect()
    }

    /// `listAll` (spec §4.1): every persisted session record, loaded or not.
    pub async fn list_all(&self) -> HostResult<Vec<SessionRecord>> {
        self.persistence.list_all_sessions().await.map_err(HostError::from)
    }

    /// `sendMessage` (spec §4.1): forward a prompt to a loaded session.
    /// `NotFound` if the session isn't loaded — callers must `loadSession`
    /// first, same as the teacher's handlers never implicitly spawn a
    /// runtime from inside a send path.
    pub async fn send_message(&self, session_id: &SessionId, prompt: impl Into<String>) -> HostResult<()> {
        let session = self
            .get_session(session_id)
            .await
            .ok_or_else(|| HostError::NotFound(session_id.to_string()))?;
        session.enqueue_query(prompt).await
    }

    /// `shutdown` (spec §6.4 `shutdownGrace`): give every loaded session a
    /// bounded window to cancel any in-flight query, flush its write-ahead
    /// buffer, and terminate its EE cleanly, then drop the rest
    /// unconditionally.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = self.loaded.write().await.drain().collect();
        for (session_id, session) in sessions {
            let drain = async {
                session.cancel_active_query_and_wait().await;
                session.sync_now().await;
                let _ = session.terminate_execution_environment().await;
            };
            if tokio::time::timeout(self.config.shutdown_grace, drain).await.is_err() {
                warn!(%session_id, "session did not shut down within grace period");
            }
        }
    }

    async fn check_capacity(&self) -> HostResult<()> {
        if let Some(max) = self.config.max_concurrent_sessions {
            if self.loaded.read().await.len() >= max {
                return Err(HostError::CapacityExceeded { max });
            }
        }
        Ok(())
    }
}

/// SPEC_FULL.md §C.1: the last main-conversation block being a
/// `tool_result` with nothing after it means the runner died between a
/// tool completing and the LLM's next turn — the one interruption point
/// that leaves no later event to signal it. A `pending` block left over
/// by replay (no `session:idle` ever finalized it) is the same kind of
/// evidence from the opposite end of a turn.
fn looks_interrupted(state: &ConversationState) -> bool {
    use crate::model::{BlockPayload, BlockStatus};
    let ended_on_tool_result = matches!(state.blocks.last().map(|b| &b.payload), Some(BlockPayload::ToolResult { .. }));
    let left_pending = state.blocks.iter().any(|b| b.status == BlockStatus::Pending);
    ended_on_tool_result || left_pending
}

fn combine_transcripts(by_conversation: &HashMap<ConversationId, String>) -> CombinedTranscript {
    let main = by_conversation.get(&ConversationId::Main).cloned().unwrap_or_default();
    let subagents = by_conversation
        .iter()
        .filter_map(|(conversation_id, transcript)| match conversation_id {
            ConversationId::Main => None,
            ConversationId::Subagent(id) => Some(SubagentTranscript {
                id: id.clone(),
                transcript: transcript.clone(),
            }),
        })
        .collect();
    CombinedTranscript { main, subagents }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ee::testing::FlakyDriver;
    use crate::persistence::memory::InMemoryPersistence;
    use crate::runner::testing::ScriptedRunner;
    use serde_json::json;

    struct EchoFactory;

    impl SessionFactory for EchoFactory {
        type Runner = ScriptedRunner;
        type Driver = FlakyDriver;

        fn build(&self, _record: &SessionRecord) -> (Self::Runner, Self::Driver) {
            (ScriptedRunner::new(vec![json!({"hello": "world"})]), FlakyDriver::new(0))
        }
    }

    fn host() -> SessionHost<EchoFactory, InMemoryPersistence> {
        SessionHost::new(EchoFactory, InMemoryPersistence::new(), HostConfig::default())
    }

    #[tokio::test]
    async fn create_session_loads_it_immediately() {
        let host = host();
        let session_id = host
            .create_session(AgentProfileRef::from("default"), Architecture::ClaudeSdk, Value::Null)
            .await
            .unwrap();
        assert!(host.get_session(&session_id).await.is_some());
        assert_eq!(host.get_loaded_session_ids().await, vec![session_id]);
    }

    #[tokio::test]
    async fn load_session_rejects_unknown_id() {
        let host = host();
        let result = host.load_session(&SessionId::from("ghost")).await;
        assert!(matches!(result, Err(HostError::NotFound(_))));
    }

    #[tokio::test]
    async fn unload_then_load_replays_saved_transcript() {
        let host = host();
        let session_id = host
            .create_session(AgentProfileRef::from("default"), Architecture::ClaudeSdk, Value::Null)
            .await
            .unwrap();

        let session = host.get_session(&session_id).await.unwrap();
        session
            .enqueue_query_with_optimistic_id("hi there", None)
            .await
            .unwrap();
        for _ in 0..50 {
            if session.get_state().await.runtime.active_query.is_none() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        session.sync_now().await;

        host.unload_session(&session_id).await.unwrap();
        assert!(host.get_session(&session_id).await.is_none());

        let reloaded = host.load_session(&session_id).await.unwrap();
        assert_eq!(reloaded.session_id(), &session_id);
        assert!(!reloaded.get_state().await.runtime.needs_attention);
    }

    #[tokio::test]
    async fn load_session_flags_needs_attention_when_interrupted_mid_turn() {
        let store = InMemoryPersistence::new();
        let sid = SessionId::from("s1");
        let record = SessionRecord::new(
            sid.clone(),
            AgentProfileRef::from("default"),
            Architecture::ClaudeSdk,
            Value::Null,
        );
        store.create_session_record(&record).await.unwrap();
        // A `content_block_start` with no matching `content_block_stop`:
        // the assistant text block it opened never finalized, replaying
        // through the real claude_sdk converter as this crate's streaming
        // path would, leaving it `pending`.
        let raw = json!({
            "type": "stream_event",
            "event": {
                "type": "content_block_start",
                "index": 0,
                "content_block": {"type": "text", "text": ""}
            }
        });
        store.save_transcript(&sid, &raw.to_string(), None).await.unwrap();

        let host = SessionHost::new(EchoFactory, store, HostConfig::default());
        let session = host.load_session(&sid).await.unwrap();
        assert!(session.get_state().await.runtime.needs_attention);
    }

    #[tokio::test]
    async fn shutdown_drains_loaded_sessions() {
        let host = host();
        host.create_session(AgentProfileRef::from("default"), Architecture::ClaudeSdk, Value::Null)
            .await
            .unwrap();
        host.shutdown().await;
        assert!(host.get_loaded_session_ids().await.is_empty());
    }

    #[tokio::test]
    async fn capacity_limit_rejects_further_creates() {
        let host = SessionHost::new(
            EchoFactory,
            InMemoryPersistence::new(),
            HostConfig {
                max_concurrent_sessions: Some(1),
                ..HostConfig::default()
            },
        );
        host.create_session(AgentProfileRef::from("default"), Architecture::ClaudeSdk, Value::Null)
            .await
            .unwrap();
        let second = host
            .create_session(AgentProfileRef::from("default"), Architecture::ClaudeSdk, Value::Null)
            .await;
        assert!(matches!(second, Err(HostError::CapacityExceeded { max: 1 })));
    }

    #[tokio::test]
    async fn send_message_to_unloaded_session_is_not_found() {
        let host = host();
        let result = host.send_message(&SessionId::from("ghost"), "hi").await;
        assert!(matches!(result, Err(HostError::NotFound(_))));
    }

    struct HangingFactory {
        runner: Arc<crate::runner::testing::HangingRunner>,
    }

    impl SessionFactory for HangingFactory {
        type Runner = Arc<crate::runner::testing::HangingRunner>;
        type Driver = FlakyDriver;

        fn build(&self, _record: &SessionRecord) -> (Self::Runner, Self::Driver) {
            (Arc::clone(&self.runner), FlakyDriver::new(0))
        }
    }

    #[tokio::test]
    async fn unload_session_cancels_in_flight_query_before_ee_teardown() {
        use crate::model::SessionEventKind;

        let runner = Arc::new(crate::runner::testing::HangingRunner::new(true));
        let host = SessionHost::new(
            HangingFactory { runner: Arc::clone(&runner) },
            InMemoryPersistence::new(),
            HostConfig {
                hard_cancel_timeout: std::time::Duration::from_millis(200),
                ..HostConfig::default()
            },
        );
        let session_id = host
            .create_session(AgentProfileRef::from("default"), Architecture::ClaudeSdk, Value::Null)
            .await
            .unwrap();
        let session = host.get_session(&session_id).await.unwrap();
        session.enqueue_query("hi").await.unwrap();

        for _ in 0..50 {
            if session.get_state().await.runtime.active_query.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(session.get_state().await.runtime.active_query.is_some());

        host.unload_session(&session_id).await.unwrap();

        let canceled = session.debug_events().await.into_iter().any(|e| {
            matches!(
                e.event.kind,
                SessionEventKind::QueryFailed { reason: Some(ref r) } if r == "canceled"
            )
        });
        assert!(canceled, "expected query:failed{{reason=canceled}} before the EE was torn down");
    }
}
