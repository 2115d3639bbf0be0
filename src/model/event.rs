//! `SessionEvent` — the architecture-agnostic event union (spec §6.1)
//!
//! Generalized from the teacher's `runtime::SseEvent` (a flat "kind +
//! payload" enum fed straight to an SSE encoder) into a context-carrying
//! event that both the reducer and the event bus consume.

use crate::ids::{BlockId, ConversationId, SessionId, SubagentId, ToolUseId};
use crate::model::block::Block;
use crate::model::session::SessionRecord;
use crate::model::session::SessionRuntimeState;
use crate::model::workspace::WorkspaceFile;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where an event originated, per §6.1's `context.source`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Runner,
    Supervisor,
    Client,
}

/// Outcome of a completed subagent, per §6.1's `subagent:completed` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentOutcome {
    Completed,
    Failed,
}

/// Severity for `log` events, per §6.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Common envelope carried by every `SessionEvent` (spec §3, §6.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventContext {
    pub session_id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub source: EventSource,
    pub timestamp_ms: i64,
}

impl EventContext {
    pub fn new(
        session_id: SessionId,
        conversation_id: Option<ConversationId>,
        source: EventSource,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            session_id,
            conversation_id,
            source,
            timestamp_ms,
        }
    }
}

/// A single immutable event that advances conversation state when folded
/// by the reducer, or drives EE/runtime bookkeeping outside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub context: EventContext,
    pub kind: SessionEventKind,
}

impl SessionEvent {
    pub fn new(context: EventContext, kind: SessionEventKind) -> Self {
        Self { context, kind }
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }
}

/// The full enumeration of §6.1's `type`/`payload` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SessionEventKind {
    #[serde(rename = "session:initialized")]
    SessionInitialized { record: SessionRecord },

    #[serde(rename = "status")]
    Status { runtime: SessionRuntimeState },

    #[serde(rename = "options:update")]
    OptionsUpdate { options: Value },

    #[serde(rename = "block:upsert")]
    BlockUpsert { block: Block },

    #[serde(rename = "block:delta")]
    BlockDelta { block_id: BlockId, delta: String },

    #[serde(rename = "metadata:update")]
    MetadataUpdate { metadata: Value },

    #[serde(rename = "subagent:spawned")]
    SubagentSpawned {
        tool_use_id: ToolUseId,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<SubagentId>,
        prompt: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        subagent_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },

    #[serde(rename = "subagent:completed")]
    SubagentCompleted {
        tool_use_id: ToolUseId,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<SubagentId>,
        status: SubagentOutcome,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },

    #[serde(rename = "file:created")]
    FileCreated { file: WorkspaceFile },

    #[serde(rename = "file:modified")]
    FileModified { file: WorkspaceFile },

    #[serde(rename = "file:deleted")]
    FileDeleted { path: String },

    #[serde(rename = "log")]
    Log {
        level: LogLevel,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },

    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },

    #[serde(rename = "ee:creating")]
    EeCreating {
        #[serde(skip_serializing_if = "Option::is_none")]
        ee_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status_message: Option<String>,
    },

    #[serde(rename = "ee:ready")]
    EeReady {
        #[serde(skip_serializing_if = "Option::is_none")]
        ee_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status_message: Option<String>,
    },

    #[serde(rename = "ee:terminated")]
    EeTerminated {
        #[serde(skip_serializing_if = "Option::is_none")]
        ee_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status_message: Option<String>,
    },

    #[serde(rename = "ee:error")]
    EeError {
        #[serde(skip_serializing_if = "Option::is_none")]
        ee_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status_message: Option<String>,
    },

    #[serde(rename = "query:started")]
    QueryStarted {
        #[serde(skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
    },

    #[serde(rename = "query:completed")]
    QueryCompleted {
        #[serde(skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
    },

    #[serde(rename = "query:failed")]
    QueryFailed {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    #[serde(rename = "session:idle")]
    SessionIdle { session_id: SessionId },

    /// Internal-only (DESIGN.md Open Question 2): never handed to
    /// `EventBus::publish`, only consumed by `Session`'s own bookkeeping.
    #[serde(rename = "transcript:changed")]
    TranscriptChanged { conversation_id: ConversationId },
}

impl SessionEventKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            SessionEventKind::SessionInitialized { .. } => "session:initialized",
            SessionEventKind::Status { .. } => "status",
            SessionEventKind::OptionsUpdate { .. } => "options:update",
            SessionEventKind::BlockUpsert { .. } => "block:upsert",
            SessionEventKind::BlockDelta { .. } => "block:delta",
            SessionEventKind::MetadataUpdate { .. } => "metadata:update",
            SessionEventKind::SubagentSpawned { .. } => "subagent:spawned",
            SessionEventKind::SubagentCompleted { .. } => "subagent:completed",
            SessionEventKind::FileCreated { .. } => "file:created",
            SessionEventKind::FileModified { .. } => "file:modified",
            SessionEventKind::FileDeleted { .. } => "file:deleted",
            SessionEventKind::Log { .. } => "log",
            SessionEventKind::Error { .. } => "error",
            SessionEventKind::EeCreating { .. } => "ee:creating",
            SessionEventKind::EeReady { .. } => "ee:ready",
            SessionEventKind::EeTerminated { .. } => "ee:terminated",
            SessionEventKind::EeError { .. } => "ee:error",
            SessionEventKind::QueryStarted { .. } => "query:started",
            SessionEventKind::QueryCompleted { .. } => "query:completed",
            SessionEventKind::QueryFailed { .. } => "query:failed",
            SessionEventKind::SessionIdle { .. } => "session:idle",
            SessionEventKind::TranscriptChanged { .. } => "transcript:changed",
        }
    }

    /// Whether this event is meant for `EventBus` subscribers at all
    /// (`transcript:changed` is internal per DESIGN.md Open Question 2).
    pub fn is_publishable(&self) -> bool {
        !matches!(self, SessionEventKind::TranscriptChanged { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_changed_is_not_publishable() {
        let kind = SessionEventKind::TranscriptChanged {
            conversation_id: ConversationId::Main,
        };
        assert!(!kind.is_publishable());
    }

    #[test]
    fn block_upsert_is_publishable() {
        use crate::model::block::{Block, BlockPayload, BlockStatus};
        use chrono::Utc;
        let kind = SessionEventKind::BlockUpsert {
            block: Block::new(
                BlockId::from("b1"),
                Utc::now(),
                BlockStatus::Pending,
                BlockPayload::UserMessage {
                    content: "hi".into(),
                },
            ),
        };
        assert!(kind.is_publishable());
        assert_eq!(kind.type_name(), "block:upsert");
    }
}
