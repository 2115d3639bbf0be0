//! `Block` — a single unit of conversation content (spec §3)
//!
//! Mirrors the teacher's message envelope/content split (`db::Message`
//! wrapping a `MessageContent` tagged union): common fields live on
//! [`Block`] itself, variant-specific fields live on [`BlockPayload`].

use crate::ids::{BlockId, SubagentId, ToolUseId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Data-finalization status of a block. Reflects whether the block's
/// fields are final, *not* whether a tool succeeded — tool success/failure
/// lives on `ToolResult::is_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Pending,
    Complete,
}

impl BlockStatus {
    /// Invariant 1 / Invariant 2: `status` may only advance pending -> complete.
    pub fn can_advance_to(self, next: BlockStatus) -> bool {
        matches!(
            (self, next),
            (BlockStatus::Pending, BlockStatus::Pending)
                | (BlockStatus::Pending, BlockStatus::Complete)
                | (BlockStatus::Complete, BlockStatus::Complete)
        )
    }
}

/// A single block of conversation content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub timestamp: DateTime<Utc>,
    pub status: BlockStatus,
    pub payload: BlockPayload,
}

impl Block {
    pub fn new(id: BlockId, timestamp: DateTime<Utc>, status: BlockStatus, payload: BlockPayload) -> Self {
        Self {
            id,
            timestamp,
            status,
            payload,
        }
    }

    /// Shallow-merge `other` into `self`, per §4.6's `block:upsert` (existing
    /// id) semantics: fields present in `other` replace `self`'s, `status`
    /// only ever advances.
    pub fn merge_from(&mut self, other: Block) {
        if self.status.can_advance_to(other.status) {
            self.status = other.status;
        }
        self.payload.merge_from(other.payload);
    }

    /// Append incremental text, per §4.6's `block:delta` semantics.
    /// Returns `false` if this block's payload does not carry text content.
    pub fn append_delta(&mut self, delta: &str) -> bool {
        self.payload.append_delta(delta)
    }
}

/// The tagged union of block content (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockPayload {
    UserMessage {
        content: String,
    },
    AssistantText {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    ToolUse {
        tool_name: String,
        tool_use_id: ToolUseId,
        input: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    ToolResult {
        tool_use_id: ToolUseId,
        output: String,
        is_error: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    Thinking {
        content: String,
    },
    Subagent {
        subagent_id: SubagentId,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        input: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        tool_use_id: ToolUseId,
    },
    SkillLoad {
        skill_name: String,
        content: String,
    },
    System {
        subtype: String,
        message: String,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl BlockPayload {
    fn merge_from(&mut self, other: BlockPayload) {
        // Same-variant merge keeps existing fields but lets `other` supply
        // newly-finalized ones (e.g. `model` arriving with the `stop`
        // event after streaming text with `model: None`).
        match (self, other) {
            (
                BlockPayload::AssistantText { content, model },
                BlockPayload::AssistantText {
                    content: new_content,
                    model: new_model,
                },
            ) => {
                if !new_content.is_empty() {
                    *content = new_content;
                }
                if new_model.is_some() {
                    *model = new_model;
                }
            }
            (
                BlockPayload::Thinking { content },
                BlockPayload::Thinking { content: new_content },
            ) => {
                if !new_content.is_empty() {
                    *content = new_content;
                }
            }
            (
                BlockPayload::Subagent {
                    output, duration_ms, ..
                },
                BlockPayload::Subagent {
                    output: new_output,
                    duration_ms: new_duration,
                    ..
                },
            ) => {
                if new_output.is_some() {
                    *output = new_output;
                }
                if new_duration.is_some() {
                    *duration_ms = new_duration;
                }
            }
            (slot, other) => *slot = other,
        }
    }

    fn append_delta(&mut self, delta: &str) -> bool {
        match self {
            BlockPayload::AssistantText { content, .. }
            | BlockPayload::Thinking { content }
            | BlockPayload::UserMessage { content } => {
                content.push_str(delta);
                true
            }
            _ => false,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            BlockPayload::UserMessage { .. } => "user_message",
            BlockPayload::AssistantText { .. } => "assistant_text",
            BlockPayload::ToolUse { .. } => "tool_use",
            BlockPayload::ToolResult { .. } => "tool_result",
            BlockPayload::Thinking { .. } => "thinking",
            BlockPayload::Subagent { .. } => "subagent",
            BlockPayload::SkillLoad { .. } => "skill_load",
            BlockPayload::System { .. } => "system",
            BlockPayload::Error { .. } => "error",
        }
    }
}
