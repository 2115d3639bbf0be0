//! `PersistenceAdapter` contract (spec §6.2).
//!
//! Only the contract lives in this crate (spec §1 Non-goals: no concrete
//! backend). Grounded on the teacher's `MessageStore`/`StateStore` split
//! in `runtime/traits.rs`: a narrow, `async_trait` object-safe storage
//! seam the embedder implements against a real database, plus an
//! in-memory reference implementation (`persistence::memory`) in the
//! teacher's `InMemoryStorage` style for tests.

pub mod memory;

use crate::error::PersistenceResult;
use crate::ids::{AgentProfileRef, ConversationId, SessionId};
use crate::model::{SessionRecord, WorkspaceFile};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// What `loadSession` hands back (spec §6.2): the record, every saved
/// transcript keyed by conversation (`None` key = main), and workspace
/// files as last persisted.
#[derive(Debug, Clone)]
pub struct LoadedSession {
    pub record: SessionRecord,
    pub transcripts_by_conversation: HashMap<ConversationId, String>,
    pub workspace_files: Vec<WorkspaceFile>,
}

#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    async fn list_all_sessions(&self) -> PersistenceResult<Vec<SessionRecord>>;

    async fn load_session(&self, id: &SessionId) -> PersistenceResult<Option<LoadedSession>>;

    async fn create_session_record(&self, record: &SessionRecord) -> PersistenceResult<()>;

    /// Full-record replace rather than the spec's `Partial<record>`: the
    /// caller (`Session`) always has the complete up-to-date record in
    /// memory, so there is no partial-update case to model in Rust.
    async fn update_session_record(&self, record: &SessionRecord) -> PersistenceResult<()>;

    /// Append-friendly: no read-before-write required (spec §6.2).
    /// `conversation_id = None` means the main conversation.
    async fn save_transcript(
        &self,
        session_id: &SessionId,
        raw_transcript: &str,
        conversation_id: Option<&ConversationId>,
    ) -> PersistenceResult<()>;

    async fn save_workspace_file(&self, session_id: &SessionId, file: &WorkspaceFile) -> PersistenceResult<()>;

    async fn delete_session_file(&self, session_id: &SessionId, path: &str) -> PersistenceResult<()>;

    async fn list_agent_profiles(&self) -> PersistenceResult<Vec<AgentProfileRef>>;

    /// Returns the profile's opaque configuration blob; profile schema is
    /// out of scope for this crate (spec §1), so it is treated as JSON.
    async fn load_agent_profile(&self, id: &AgentProfileRef) -> PersistenceResult<Option<Value>>;
}

#[async_trait]
impl<T: PersistenceAdapter + ?Sized> PersistenceAdapter for Arc<T> {
    async fn list_all_sessions(&self) -> PersistenceResult<Vec<SessionRecord>> {
        (**self).list_all_sessions().await
    }

    async fn load_session(&self, id: &SessionId) -> PersistenceResult<Option<LoadedSession>> {
        (**self).load_session(id).await
    }

    async fn create_session_record(&self, record: &SessionRecord) -> PersistenceResult<()> {
        (**self).create_session_record(record).await
    }

    async fn update_session_record(&self, record: &SessionRecord) -> PersistenceResult<()> {
        (**self).update_session_record(record).await
    }

    async fn save_transcript(
        &self,
        session_id: &SessionId,
        raw_transcript: &str,
        conversation_id: Option<&ConversationId>,
    ) -> PersistenceResult<()> {
        (**self)
            .save_transcript(session_id, raw_transcript, conversation_id)
            .await
    }

    async fn save_workspace_file(&self, session_id: &SessionId, file: &WorkspaceFile) -> PersistenceResult<()> {
        (**self).save_workspace_file(session_id, file).await
    }

    async fn delete_session_file(&self, session_id: &SessionId, path: &str) -> PersistenceResult<()> {
        (**self).delete_session_file(session_id, path).await
    }

    async fn list_agent_profiles(&self) -> PersistenceResult<Vec<AgentProfileRef>> {
        (**self).list_agent_profiles().await
    }

    async fn load_agent_profile(&self, id: &AgentProfileRef) -> PersistenceResult<Option<Value>> {
        (**self).load_agent_profile(id).await
    }
}
