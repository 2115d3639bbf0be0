//! In-memory `PersistenceAdapter`, for tests and examples. Grounded on
//! the teacher's `InMemoryStorage` (`runtime/testing.rs`): plain
//! `std::sync::Mutex`-guarded `HashMap`s, no async I/O to await.

use super::{LoadedSession, PersistenceAdapter};
use crate::error::PersistenceResult;
use crate::ids::{AgentProfileRef, ConversationId, SessionId};
use crate::model::{SessionRecord, WorkspaceFile};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct InMemoryPersistence {
    sessions: Mutex<HashMap<SessionId, SessionRecord>>,
    transcripts: Mutex<HashMap<(SessionId, ConversationId), String>>,
    workspace_files: Mutex<HashMap<(SessionId, String), WorkspaceFile>>,
    profiles: Mutex<HashMap<AgentProfileRef, Value>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/example seeding hook; not part of the trait contract.
    pub fn seed_profile(&self, id: AgentProfileRef, profile: Value) {
        self.profiles.lock().unwrap().insert(id, profile);
    }
}

#[async_trait]
impl PersistenceAdapter for InMemoryPersistence {
    async fn list_all_sessions(&self) -> PersistenceResult<Vec<SessionRecord>> {
        Ok(self.sessions.lock().unwrap().values().cloned().collect())
    }

    async fn load_session(&self, id: &SessionId) -> PersistenceResult<Option<LoadedSession>> {
        let Some(record) = self.sessions.lock().unwrap().get(id).cloned() else {
            return Ok(None);
        };

        let transcripts_by_conversation = self
            .transcripts
            .lock()
            .unwrap()
            .iter()
            .filter(|((sid, _), _)| sid == id)
            .map(|((_, conv), blob)| (conv.clone(), blob.clone()))
            .collect();

        let workspace_files = self
            .workspace_files
            .lock()
            .unwrap()
            .iter()
            .filter(|((sid, _), _)| sid == id)
            .map(|(_, file)| file.clone())
            .collect();

        Ok(Some(LoadedSession {
            record,
            transcripts_by_conversation,
            workspace_files,
        }))
    }

    async fn create_session_record(&self, record: &SessionRecord) -> PersistenceResult<()> {
        self.sessions
            .lock()
            .unwrap()
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    async fn update_session_record(&self, record: &SessionRecord) -> PersistenceResult<()> {
        self.sessions
            .lock()
            .unwrap()
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    async fn save_transcript(
        &self,
        session_id: &SessionId,
        raw_transcript: &str,
        conversation_id: Option<&ConversationId>,
    ) -> PersistenceResult<()> {
        let key = (session_id.clone(), conversation_id.cloned().unwrap_or(ConversationId::Main));
        let mut transcripts = self.transcripts.lock().unwrap();
        let entry = transcripts.entry(key).or_default();
        if !entry.is_empty() && !entry.ends_with('\n') {
            entry.push('\n');
        }
        entry.push_str(raw_transcript);
        Ok(())
    }

    async fn save_workspace_file(&self, session_id: &SessionId, file: &WorkspaceFile) -> PersistenceResult<()> {
        self.workspace_files
            .lock()
            .unwrap()
            .insert((session_id.clone(), file.path.clone()), file.clone());
        Ok(())
    }

    async fn delete_session_file(&self, session_id: &SessionId, path: &str) -> PersistenceResult<()> {
        self.workspace_files
            .lock()
            .unwrap()
            .remove(&(session_id.clone(), path.to_string()));
        Ok(())
    }

    async fn list_agent_profiles(&self) -> PersistenceResult<Vec<AgentProfileRef>> {
        Ok(self.profiles.lock().unwrap().keys().cloned().collect())
    }

    async fn load_agent_profile(&self, id: &AgentProfileRef) -> PersistenceResult<Option<Value>> {
        Ok(self.profiles.lock().unwrap().get(id).cloned())
    }
}
