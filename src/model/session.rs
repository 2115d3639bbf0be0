//! Session-level records (spec §3): `SessionRecord`, `SessionRuntimeState`,
//! `ExecutionEnvironmentState`.

use crate::ids::{AgentProfileRef, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which vendor SDK family a session drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Architecture {
    ClaudeSdk,
    Opencode,
}

/// Persisted session identity (spec §3). Owned by `PersistenceAdapter`;
/// the host only holds a copy in memory while loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub agent_profile_ref: AgentProfileRef,
    pub architecture: Architecture,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Architecture-specific; the host treats it as an opaque blob.
    pub session_options: Value,
}

impl SessionRecord {
    pub fn new(
        session_id: SessionId,
        agent_profile_ref: AgentProfileRef,
        architecture: Architecture,
        session_options: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            agent_profile_ref,
            architecture,
            created_at: now,
            last_activity_at: now,
            session_options,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }
}

/// A query in flight on a session, per §4.2's `activeQuery`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveQuery {
    pub started_at: DateTime<Utc>,
    pub prompt: String,
}

/// Ephemeral, not persisted (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRuntimeState {
    pub is_loaded: bool,
    pub execution_environment: ExecutionEnvironmentState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_query: Option<ActiveQuery>,
    /// SPEC_FULL.md §C.1: set by `SessionHost::loadSession` when transcript
    /// replay finds the session interrupted mid-turn.
    pub needs_attention: bool,
    /// DESIGN.md Open Question decision #3: set when persistence writes
    /// have permanently failed; the session keeps serving reads/streams
    /// but rejects new queries.
    pub read_only: bool,
}

impl SessionRuntimeState {
    pub fn unloaded() -> Self {
        Self {
            is_loaded: false,
            execution_environment: ExecutionEnvironmentState::default(),
            active_query: None,
            needs_attention: false,
            read_only: false,
        }
    }

    pub fn fresh_loaded() -> Self {
        Self {
            is_loaded: true,
            ..Self::unloaded()
        }
    }
}

/// EE lifecycle status, per §3/§4.3's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EeStatus {
    Inactive,
    Starting,
    Ready,
    Error,
    Terminated,
}

impl EeStatus {
    /// Invariant 7: `inactive -> starting -> ready -> (terminated|error)`,
    /// with `error -> starting` allowed as a restart and `terminated`
    /// terminal.
    pub fn can_transition_to(self, next: EeStatus) -> bool {
        use EeStatus::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Inactive, Starting)
                | (Starting, Ready)
                | (Starting, Error)
                | (Starting, Terminated)
                | (Ready, Error)
                | (Ready, Terminated)
                | (Error, Starting)
                | (Error, Terminated)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EeLastError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEnvironmentState {
    pub status: EeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<DateTime<Utc>>,
    pub restart_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<EeLastError>,
}

impl Default for ExecutionEnvironmentState {
    fn default() -> Self {
        Self {
            status: EeStatus::Inactive,
            id: None,
            status_message: None,
            last_health_check: None,
            restart_count: 0,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ee_status_monotonicity() {
        assert!(EeStatus::Inactive.can_transition_to(EeStatus::Starting));
        assert!(EeStatus::Starting.can_transition_to(EeStatus::Ready));
        assert!(EeStatus::Error.can_transition_to(EeStatus::Starting));
        assert!(!EeStatus::Terminated.can_transition_to(EeStatus::Starting));
        assert!(!EeStatus::Ready.can_transition_to(EeStatus::Inactive));
    }

    #[test]
    fn runtime_state_starts_unloaded() {
        let rt = SessionRuntimeState::unloaded();
        assert!(!rt.is_loaded);
        assert_eq!(rt.execution_environment.status, EeStatus::Inactive);
        assert!(!rt.needs_attention);
        assert!(!rt.read_only);
    }
}
