//! `ConversationState` and `SubagentConversation` (spec §3).

use crate::ids::{SubagentId, ToolUseId};
use crate::model::block::{Block, BlockStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentStatus {
    Running,
    Completed,
    Failed,
}

/// A child conversation spawned by a `Task`/`task` tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubagentConversation {
    pub id: SubagentId,
    pub tool_use_id: ToolUseId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: SubagentStatus,
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub metadata: Value,
}

impl SubagentConversation {
    pub fn new(id: SubagentId, tool_use_id: ToolUseId, name: Option<String>) -> Self {
        Self {
            id,
            tool_use_id,
            name,
            status: SubagentStatus::Running,
            blocks: Vec::new(),
            metadata: Value::Null,
        }
    }

    pub fn block_mut(&mut self, id: &crate::ids::BlockId) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| &b.id == id)
    }
}

/// The reducer's fold target: the main conversation plus all subagents
/// spawned from it (spec §3). Owned by a single `Session` executor — no
/// interior mutability, no locks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConversationState {
    pub blocks: Vec<Block>,
    pub subagents: Vec<SubagentConversation>,
    #[serde(default)]
    pub metadata: Value,
}

impl ConversationState {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            subagents: Vec::new(),
            metadata: Value::Null,
        }
    }

    pub fn block_mut(&mut self, id: &crate::ids::BlockId) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| &b.id == id)
    }

    pub fn subagent_by_id_mut(&mut self, id: &SubagentId) -> Option<&mut SubagentConversation> {
        self.subagents.iter_mut().find(|s| &s.id == id)
    }

    pub fn subagent_by_tool_use_id_mut(
        &mut self,
        tool_use_id: &ToolUseId,
    ) -> Option<&mut SubagentConversation> {
        self.subagents
            .iter_mut()
            .find(|s| &s.tool_use_id == tool_use_id)
    }

    /// Invariant 1: finalize every `pending` block in a conversation to
    /// `complete`, per `session:idle`'s reducer semantics (§4.6).
    pub fn finalize_pending_in_main(&mut self) {
        for b in &mut self.blocks {
            b.status = BlockStatus::Complete;
        }
    }

    pub fn finalize_pending_in_subagent(&mut self, id: &SubagentId) {
        if let Some(sub) = self.subagent_by_id_mut(id) {
            for b in &mut sub.blocks {
                b.status = BlockStatus::Complete;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::BlockId;
    use crate::model::block::BlockPayload;
    use chrono::Utc;

    #[test]
    fn finalize_pending_advances_all_blocks() {
        let mut state = ConversationState::new();
        state.blocks.push(Block::new(
            BlockId::from("b1"),
            Utc::now(),
            BlockStatus::Pending,
            BlockPayload::AssistantText {
                content: "partial".into(),
                model: None,
            },
        ));
        state.finalize_pending_in_main();
        assert_eq!(state.blocks[0].status, BlockStatus::Complete);
    }

    #[test]
    fn subagent_lookup_by_tool_use_id() {
        let mut state = ConversationState::new();
        let sub = SubagentConversation::new(
            SubagentId::from("sub-1"),
            ToolUseId::from("t1"),
            Some("sum".into()),
        );
        state.subagents.push(sub);
        assert!(state
            .subagent_by_tool_use_id_mut(&ToolUseId::from("t1"))
            .is_some());
        assert!(state
            .subagent_by_tool_use_id_mut(&ToolUseId::from("nope"))
            .is_none());
    }
}
