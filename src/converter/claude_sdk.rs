//! Claude-SDK `EventConverter` (spec §4.5's "Claude-SDK" row).
//!
//! Grounded on `Epistates-turboclaude`'s `message_parser::parse_message`
//! for the top-level message shape (`user`/`assistant`/`system`/`result`/
//! `stream_event`) and on `turboclaude`'s `streaming.rs` for the nested
//! Anthropic `content_block_start/delta/stop` events carried inside
//! `stream_event.event`. We consume the raw wire JSON directly rather than
//! the vendor SDK's typed structs, since the vendor SDK itself is out of
//! scope (spec §1) — only its wire format matters here.

use super::lru::LruStringSet;
use super::EventConverter;
use crate::ids::{BlockId, SessionId, SubagentId, ToolUseId};
use crate::model::{
    Block, BlockPayload, BlockStatus, EventContext, EventSource, LogLevel, SessionEvent,
    SessionEventKind, SubagentOutcome,
};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;

fn skill_path_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"skills/([^/\s]+)").expect("valid regex"))
}

fn skill_header_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^#\s+(.*\bSkill\b.*)$").expect("valid regex"))
}

/// Key for an open (pending) content block within the current assistant
/// turn: `stream_event.event.index` scoped by which conversation (main or
/// subagent, identified by `parent_tool_use_id`) it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct OpenBlockKey {
    parent_tool_use_id: Option<String>,
    index: u64,
}

#[derive(Debug)]
enum OpenBlockKind {
    Text,
    Thinking,
    ToolUse {
        tool_name: String,
        tool_use_id: ToolUseId,
        partial_json: String,
    },
}

#[derive(Debug)]
struct OpenBlock {
    id: BlockId,
    kind: OpenBlockKind,
}

/// A `Task` tool invocation seen but not yet resolved to a `subagent:spawned`
/// event (we only know the prompt once `content_block_stop` gives us the
/// fully-accumulated `input`).
#[derive(Debug, Clone)]
struct PendingTaskSpawn {
    subagent_type: Option<String>,
}

// Assumes the Runner drives the CLI in one mode at a time: either
// `--include-partial-messages` (content arrives only via `stream_event`
// deltas) or buffered mode (content arrives only via consolidated
// `assistant`/`user` messages). Both paths build blocks the same way so
// the converter does not need to know which mode is active, but running
// both simultaneously would double-upsert; `runner::claude_sdk` is
// responsible for picking one.
#[derive(Debug, Default)]
pub struct ClaudeSdkConverter {
    open_blocks: HashMap<OpenBlockKey, OpenBlock>,
    pending_tasks: HashMap<ToolUseId, PendingTaskSpawn>,
    /// Maps a spawned subagent's tool_use_id to its assigned `SubagentId`,
    /// so a later `tool_result` can route `subagent:completed` correctly.
    active_subagents: HashMap<ToolUseId, SubagentId>,
    subagent_prompt_cache: LruStringSet,
}

impl ClaudeSdkConverter {
    pub fn new(subagent_prompt_cache_size: usize) -> Self {
        Self {
            open_blocks: HashMap::new(),
            pending_tasks: HashMap::new(),
            active_subagents: HashMap::new(),
            subagent_prompt_cache: LruStringSet::new(subagent_prompt_cache_size),
        }
    }

    fn conversation_id_for(parent_tool_use_id: Option<&str>) -> Option<crate::ids::ConversationId> {
        parent_tool_use_id
            .map(|id| crate::ids::ConversationId::Subagent(SubagentId::from(id)))
    }

    fn ctx(
        &self,
        session_id: &SessionId,
        conversation_id: Option<crate::ids::ConversationId>,
    ) -> EventContext {
        EventContext::new(
            session_id.clone(),
            conversation_id,
            EventSource::Runner,
            chrono::Utc::now().timestamp_millis(),
        )
    }

    fn log(
        &self,
        session_id: &SessionId,
        level: LogLevel,
        message: impl Into<String>,
    ) -> SessionEvent {
        SessionEvent::new(
            self.ctx(session_id, None),
            SessionEventKind::Log {
                level,
                message: message.into(),
                data: None,
            },
        )
    }

    fn is_skill_load(content: &str) -> bool {
        content.starts_with("Base directory for this skill:")
            || (content.contains("# ") && skill_header_pattern().is_match(content))
            || content.contains("read_skill_file with skill=")
    }

    fn skill_name(content: &str) -> String {
        if let Some(caps) = skill_path_pattern().captures(content) {
            return caps[1].to_string();
        }
        if let Some(caps) = skill_header_pattern().captures(content) {
            return caps[1]
                .trim()
                .to_lowercase()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join("-");
        }
        "unknown".to_string()
    }

    fn handle_user_message(
        &mut self,
        session_id: &SessionId,
        data: &Value,
        parent_tool_use_id: Option<&str>,
    ) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        let Some(content) = data.pointer("/message/content") else {
            return vec![self.log(session_id, LogLevel::Warn, "user message missing content")];
        };

        let conversation_id = Self::conversation_id_for(parent_tool_use_id);
        let is_main = conversation_id.is_none();

        for block in content_blocks(content) {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    let text = block.get("text").and_then(Value::as_str).unwrap_or("");
                    if is_main && self.subagent_prompt_cache.contains(text) {
                        // Subagent-prompt suppression (spec §4.2): the
                        // vendor CLI echoes the Task prompt back on the
                        // main stream; drop it rather than duplicate it.
                        continue;
                    }
                    let payload = if Self::is_skill_load(text) {
                        BlockPayload::SkillLoad {
                            skill_name: Self::skill_name(text),
                            content: text.to_string(),
                        }
                    } else {
                        BlockPayload::UserMessage {
                            content: text.to_string(),
                        }
                    };
                    events.push(SessionEvent::new(
                        self.ctx(session_id, conversation_id.clone()),
                        SessionEventKind::BlockUpsert {
                            block: Block::new(
                                BlockId::new_random(),
                                chrono::Utc::now(),
                                BlockStatus::Complete,
                                payload,
                            ),
                        },
                    ));
                }
                Some("tool_result") => {
                    let tool_use_id = block
                        .get("tool_use_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    let output = block
                        .get("content")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let is_error = block
                        .get("is_error")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);

                    events.push(SessionEvent::new(
                        self.ctx(session_id, conversation_id.clone()),
                        SessionEventKind::BlockUpsert {
                            block: Block::new(
                                BlockId::new_random(),
                                chrono::Utc::now(),
                                BlockStatus::Complete,
                                BlockPayload::ToolResult {
                                    tool_use_id: ToolUseId::from(tool_use_id),
                                    output: output.clone(),
                                    is_error,
                                    duration_ms: None,
                                },
                            ),
                        },
                    ));

                    if is_main {
                        if let Some(subagent_id) =
                            self.active_subagents.remove(&ToolUseId::from(tool_use_id))
                        {
                            events.push(SessionEvent::new(
                                self.ctx(session_id, None),
                                SessionEventKind::SubagentCompleted {
                                    tool_use_id: ToolUseId::from(tool_use_id),
                                    agent_id: Some(subagent_id),
                                    status: if is_error {
                                        SubagentOutcome::Failed
                                    } else {
                                        SubagentOutcome::Completed
                                    },
                                    output: Some(output),
                                    duration_ms: None,
                                },
                            ));
                        }
                    }
                }
                _ => {}
            }
        }
        events
    }

    fn handle_assistant_message(
        &mut self,
        session_id: &SessionId,
        data: &Value,
        parent_tool_use_id: Option<&str>,
    ) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        let Some(content) = data.pointer("/message/content") else {
            return vec![self.log(session_id, LogLevel::Warn, "assistant message missing content")];
        };
        let model = data
            .pointer("/message/model")
            .and_then(Value::as_str)
            .map(str::to_string);
        let conversation_id = Self::conversation_id_for(parent_tool_use_id);

        for block in content_blocks(content) {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    let text = block.get("text").and_then(Value::as_str).unwrap_or("");
                    events.push(SessionEvent::new(
                        self.ctx(session_id, conversation_id.clone()),
                        SessionEventKind::BlockUpsert {
                            block: Block::new(
                                BlockId::new_random(),
                                chrono::Utc::now(),
                                BlockStatus::Complete,
                                BlockPayload::AssistantText {
                                    content: text.to_string(),
                                    model: model.clone(),
                                },
                            ),
                        },
                    ));
                }
                Some("thinking") => {
                    let text = block.get("thinking").and_then(Value::as_str).unwrap_or("");
                    events.push(SessionEvent::new(
                        self.ctx(session_id, conversation_id.clone()),
                        SessionEventKind::BlockUpsert {
                            block: Block::new(
                                BlockId::new_random(),
                                chrono::Utc::now(),
                                BlockStatus::Complete,
                                BlockPayload::Thinking {
                                    content: text.to_string(),
                                },
                            ),
                        },
                    ));
                }
                Some("tool_use") => {
                    let tool_use_id =
                        block.get("id").and_then(Value::as_str).unwrap_or_default();
                    let tool_name = block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    let input = block.get("input").cloned().unwrap_or(Value::Null);

                    events.push(SessionEvent::new(
                        self.ctx(session_id, conversation_id.clone()),
                        SessionEventKind::BlockUpsert {
                            block: Block::new(
                                BlockId::new_random(),
                                chrono::Utc::now(),
                                BlockStatus::Complete,
                                BlockPayload::ToolUse {
                                    tool_name: tool_name.to_string(),
                                    tool_use_id: ToolUseId::from(tool_use_id),
                                    input: input.clone(),
                                    display_name: None,
                                },
                            ),
                        },
                    ));

                    if tool_name == "Task" && parent_tool_use_id.is_none() {
                        events.extend(self.spawn_task_subagent(
                            session_id,
                            ToolUseId::from(tool_use_id),
                            &input,
                        ));
                    }
                }
                _ => {}
            }
        }
        events
    }

    fn spawn_task_subagent(
        &mut self,
        session_id: &SessionId,
        tool_use_id: ToolUseId,
        input: &Value,
    ) -> Vec<SessionEvent> {
        let prompt = input
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let subagent_type = input
            .get("subagent_type")
            .and_then(Value::as_str)
            .map(str::to_string);
        let description = input
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string);

        if !prompt.is_empty() {
            self.subagent_prompt_cache.insert(prompt.clone());
        }
        let subagent_id = SubagentId::from(tool_use_id.as_str());
        self.active_subagents
            .insert(tool_use_id.clone(), subagent_id.clone());

        vec![SessionEvent::new(
            self.ctx(session_id, None),
            SessionEventKind::SubagentSpawned {
                tool_use_id,
                agent_id: Some(subagent_id),
                prompt,
                subagent_type,
                description,
            },
        )]
    }

    fn handle_stream_event(&mut self, session_id: &SessionId, data: &Value) -> Vec<SessionEvent> {
        let parent_tool_use_id = data
            .get("parent_tool_use_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let conversation_id = Self::conversation_id_for(parent_tool_use_id.as_deref());
        let Some(event) = data.get("event") else {
            return vec![self.log(session_id, LogLevel::Warn, "stream_event missing event")];
        };
        let Some(event_type) = event.get("type").and_then(Value::as_str) else {
            return vec![self.log(session_id, LogLevel::Warn, "stream_event missing type")];
        };

        match event_type {
            "content_block_start" => {
                self.handle_content_block_start(session_id, event, conversation_id, parent_tool_use_id)
            }
            "content_block_delta" => self.handle_content_block_delta(session_id, event, conversation_id),
            "content_block_stop" => {
                self.handle_content_block_stop(session_id, event, conversation_id, parent_tool_use_id)
            }
            _ => Vec::new(),
        }
    }

    fn handle_content_block_start(
        &mut self,
        session_id: &SessionId,
        event: &Value,
        conversation_id: Option<crate::ids::ConversationId>,
        parent_tool_use_id: Option<String>,
    ) -> Vec<SessionEvent> {
        let Some(index) = event.get("index").and_then(Value::as_u64) else {
            return Vec::new();
        };
        let Some(block) = event.get("content_block") else {
            return Vec::new();
        };
        let key = OpenBlockKey {
            parent_tool_use_id: parent_tool_use_id.clone(),
            index,
        };

        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                let id = BlockId::new_random();
                self.open_blocks.insert(
                    key,
                    OpenBlock {
                        id: id.clone(),
                        kind: OpenBlockKind::Text,
                    },
                );
                vec![SessionEvent::new(
                    self.ctx(session_id, conversation_id),
                    SessionEventKind::BlockUpsert {
                        block: Block::new(
                            id,
                            chrono::Utc::now(),
                            BlockStatus::Pending,
                            BlockPayload::AssistantText {
                                content: String::new(),
                                model: None,
                            },
                        ),
                    },
                )]
            }
            Some("thinking") => {
                let id = BlockId::new_random();
                self.open_blocks.insert(
                    key,
                    OpenBlock {
                        id: id.clone(),
                        kind: OpenBlockKind::Thinking,
                    },
                );
                vec![SessionEvent::new(
                    self.ctx(session_id, conversation_id),
                    SessionEventKind::BlockUpsert {
                        block: Block::new(
                            id,
                            chrono::Utc::now(),
                            BlockStatus::Pending,
                            BlockPayload::Thinking {
                                content: String::new(),
                            },
                        ),
                    },
                )]
            }
            Some("tool_use") => {
                let tool_use_id = block
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let tool_name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let id = BlockId::new_random();
                self.open_blocks.insert(
                    key,
                    OpenBlock {
                        id: id.clone(),
                        kind: OpenBlockKind::ToolUse {
                            tool_name: tool_name.clone(),
                            tool_use_id: ToolUseId::from(tool_use_id.clone()),
                            partial_json: String::new(),
                        },
                    },
                );
                if tool_name == "Task" && parent_tool_use_id.is_none() {
                    self.pending_tasks.insert(
                        ToolUseId::from(tool_use_id.clone()),
                        PendingTaskSpawn {
                            subagent_type: None,
                        },
                    );
                }
                vec![SessionEvent::new(
                    self.ctx(session_id, conversation_id),
                    SessionEventKind::BlockUpsert {
                        block: Block::new(
                            id,
                            chrono::Utc::now(),
                            BlockStatus::Pending,
                            BlockPayload::ToolUse {
                                tool_name,
                                tool_use_id: ToolUseId::from(tool_use_id),
                                input: Value::Null,
                                display_name: None,
                            },
                        ),
                    },
                )]
            }
            _ => Vec::new(),
        }
    }

    fn handle_content_block_delta(
        &mut self,
        session_id: &SessionId,
        event: &Value,
        conversation_id: Option<crate::ids::ConversationId>,
    ) -> Vec<SessionEvent> {
        let Some(index) = event.get("index").and_then(Value::as_u64) else {
            return Vec::new();
        };
        let parent_tool_use_id = conversation_id.as_ref().map(|c| c.as_str().to_string());
        let key = OpenBlockKey {
            parent_tool_use_id,
            index,
        };
        let Some(delta) = event.get("delta") else {
            return Vec::new();
        };
        let delta_type = delta.get("type").and_then(Value::as_str).unwrap_or("");

        let Some(open) = self.open_blocks.get_mut(&key) else {
            return vec![self.log(session_id, LogLevel::Warn, "delta for unknown open block")];
        };

        match (&mut open.kind, delta_type) {
            (OpenBlockKind::Text, "text_delta") => {
                let text = delta.get("text").and_then(Value::as_str).unwrap_or("");
                vec![SessionEvent::new(
                    self.ctx(session_id, conversation_id),
                    SessionEventKind::BlockDelta {
                        block_id: open.id.clone(),
                        delta: text.to_string(),
                    },
                )]
            }
            (OpenBlockKind::Thinking, "thinking_delta") => {
                let text = delta.get("thinking").and_then(Value::as_str).unwrap_or("");
                vec![SessionEvent::new(
                    self.ctx(session_id, conversation_id),
                    SessionEventKind::BlockDelta {
                        block_id: open.id.clone(),
                        delta: text.to_string(),
                    },
                )]
            }
            (OpenBlockKind::ToolUse { partial_json, .. }, "input_json_delta") => {
                let fragment = delta.get("partial_json").and_then(Value::as_str).unwrap_or("");
                partial_json.push_str(fragment);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn handle_content_block_stop(
        &mut self,
        session_id: &SessionId,
        event: &Value,
        conversation_id: Option<crate::ids::ConversationId>,
        parent_tool_use_id: Option<String>,
    ) -> Vec<SessionEvent> {
        let Some(index) = event.get("index").and_then(Value::as_u64) else {
            return Vec::new();
        };
        let key = OpenBlockKey {
            parent_tool_use_id: parent_tool_use_id.clone(),
            index,
        };
        let Some(open) = self.open_blocks.remove(&key) else {
            return Vec::new();
        };

        match open.kind {
            OpenBlockKind::Text => vec![SessionEvent::new(
                self.ctx(session_id, conversation_id),
                SessionEventKind::BlockUpsert {
                    block: Block::new(
                        open.id,
                        chrono::Utc::now(),
                        BlockStatus::Complete,
                        BlockPayload::AssistantText {
                            content: String::new(),
                            model: None,
                        },
                    ),
                },
            )],
            OpenBlockKind::Thinking => vec![SessionEvent::new(
                self.ctx(session_id, conversation_id),
                SessionEventKind::BlockUpsert {
                    block: Block::new(
                        open.id,
                        chrono::Utc::now(),
                        BlockStatus::Complete,
                        BlockPayload::Thinking {
                            content: String::new(),
                        },
                    ),
                },
            )],
            OpenBlockKind::ToolUse {
                tool_name,
                tool_use_id,
                partial_json,
            } => {
                let input: Value = if partial_json.trim().is_empty() {
                    Value::Null
                } else {
                    serde_json::from_str(&partial_json).unwrap_or(Value::Null)
                };
                let mut events = vec![SessionEvent::new(
                    self.ctx(session_id, conversation_id.clone()),
                    SessionEventKind::BlockUpsert {
                        block: Block::new(
                            open.id,
                            chrono::Utc::now(),
                            BlockStatus::Complete,
                            BlockPayload::ToolUse {
                                tool_name: tool_name.clone(),
                                tool_use_id: tool_use_id.clone(),
                                input: input.clone(),
                                display_name: None,
                            },
                        ),
                    },
                )];

                if tool_name == "Task" && parent_tool_use_id.is_none()
                    && self.pending_tasks.remove(&tool_use_id).is_some()
                {
                    events.extend(self.spawn_task_subagent(session_id, tool_use_id, &input));
                }
                events
            }
        }
    }

    fn handle_result_message(&self, session_id: &SessionId, data: &Value) -> Vec<SessionEvent> {
        let metadata = serde_json::json!({
            "usage": data.get("usage").cloned().unwrap_or(Value::Null),
            "totalCostUsd": data.get("total_cost_usd").cloned().unwrap_or(Value::Null),
            "durationMs": data.get("duration_ms").cloned().unwrap_or(Value::Null),
            "numTurns": data.get("num_turns").cloned().unwrap_or(Value::Null),
        });
        vec![SessionEvent::new(
            self.ctx(session_id, None),
            SessionEventKind::MetadataUpdate { metadata },
        )]
    }
}

fn content_blocks(content: &Value) -> Vec<Value> {
    if let Some(text) = content.as_str() {
        return vec![serde_json::json!({"type": "text", "text": text})];
    }
    content.as_array().cloned().unwrap_or_default()
}

impl EventConverter for ClaudeSdkConverter {
    fn parse_event(&mut self, session_id: &SessionId, raw: &Value) -> Vec<SessionEvent> {
        let Some(message_type) = raw.get("type").and_then(Value::as_str) else {
            return vec![self.log(session_id, LogLevel::Warn, "raw message missing type")];
        };
        let parent_tool_use_id = raw
            .get("parent_tool_use_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        match message_type {
            "user" => self.handle_user_message(session_id, raw, parent_tool_use_id.as_deref()),
            "assistant" => {
                self.handle_assistant_message(session_id, raw, parent_tool_use_id.as_deref())
            }
            "stream_event" => self.handle_stream_event(session_id, raw),
            "result" => self.handle_result_message(session_id, raw),
            "system" => Vec::new(),
            other => vec![self.log(
                session_id,
                LogLevel::Warn,
                format!("unknown claude-sdk message type: {other}"),
            )],
        }
    }

    fn reset(&mut self) {
        self.open_blocks.clear();
        self.pending_tasks.clear();
    }
}
