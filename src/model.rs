//! The architecture-agnostic data model (spec §3): the vocabulary every
//! other module — reducer, converter, session, event bus — shares.

pub mod block;
pub mod conversation;
pub mod event;
pub mod rings;
pub mod session;
pub mod workspace;

pub use block::{Block, BlockPayload, BlockStatus};
pub use conversation::{ConversationState, SubagentConversation, SubagentStatus};
pub use event::{EventContext, EventSource, LogLevel, SessionEvent, SessionEventKind, SubagentOutcome};
pub use rings::{DebugEvent, Ring, SessionLogEntry};
pub use session::{
    ActiveQuery, Architecture, EeLastError, EeStatus, ExecutionEnvironmentState, SessionRecord,
    SessionRuntimeState,
};
pub use workspace::WorkspaceFile;
