//! OpenCode `EventConverter` (spec §4.5's "OpenCode" row).
//!
//! OpenCode's event feed is part-oriented rather than content-block-index
//! oriented: a `message.updated` event announces a message's role and
//! owning OpenCode session id, and `message.part.updated` events carry the
//! (cumulative, not incremental) text/tool state for parts of that
//! message, correlated by `messageID`. There is no explicit "block
//! finished" event — `session.idle` is the signal that finalizes whatever
//! is still pending, which happens to be exactly the reducer's own
//! `session:idle` semantics (spec §4.6), so we lean on that rather than
//! inventing a synthetic stop event.

use super::EventConverter;
use crate::ids::{BlockId, ConversationId, SessionId, SubagentId, ToolUseId};
use crate::model::{
    Block, BlockPayload, BlockStatus, EventContext, EventSource, LogLevel, SessionEvent,
    SessionEventKind,
};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug)]
struct PartState {
    block_id: BlockId,
    last_text: String,
}

#[derive(Debug)]
pub struct OpencodeConverter {
    /// The OpenCode-native session id for this host session's main
    /// conversation (from `sessionOptions`); everything else routes to a
    /// subagent conversation once registered.
    main_opencode_session_id: String,
    /// OpenCode session id -> which `ConversationId` it maps to.
    known_sessions: HashMap<String, ConversationId>,
    /// messageID -> (role, owning OpenCode session id).
    message_info: HashMap<String, (String, String)>,
    /// partID -> assigned block + cumulative text seen so far.
    parts: HashMap<String, PartState>,
    /// partID -> owning messageID, so `session.idle` can clear only the
    /// scratch belonging to the conversation that went idle.
    part_owner: HashMap<String, String>,
    /// tool-call id -> subagent id, for routing `subagent:completed`.
    active_task_calls: HashMap<String, SubagentId>,
}

impl OpencodeConverter {
    pub fn new(main_opencode_session_id: impl Into<String>) -> Self {
        let main_opencode_session_id = main_opencode_session_id.into();
        let mut known_sessions = HashMap::new();
        known_sessions.insert(main_opencode_session_id.clone(), ConversationId::Main);
        Self {
            main_opencode_session_id,
            known_sessions,
            message_info: HashMap::new(),
            parts: HashMap::new(),
            part_owner: HashMap::new(),
            active_task_calls: HashMap::new(),
        }
    }

    fn ctx(&self, session_id: &SessionId, conversation_id: Option<ConversationId>) -> EventContext {
        EventContext::new(
            session_id.clone(),
            conversation_id,
            EventSource::Runner,
            chrono::Utc::now().timestamp_millis(),
        )
    }

    fn log(&self, session_id: &SessionId, message: impl Into<String>) -> SessionEvent {
        SessionEvent::new(
            self.ctx(session_id, None),
            SessionEventKind::Log {
                level: LogLevel::Warn,
                message: message.into(),
                data: None,
            },
        )
    }

    fn conversation_for(&self, opencode_session_id: &str) -> ConversationId {
        self.known_sessions
            .get(opencode_session_id)
            .cloned()
            .unwrap_or(ConversationId::Main)
    }

    fn handle_message_updated(&mut self, raw: &Value) {
        let Some(info) = raw.pointer("/properties/info") else {
            return;
        };
        let (Some(id), Some(role), Some(session_id)) = (
            info.get("id").and_then(Value::as_str),
            info.get("role").and_then(Value::as_str),
            info.get("sessionID").and_then(Value::as_str),
        ) else {
            return;
        };
        self.message_info
            .insert(id.to_string(), (role.to_string(), session_id.to_string()));
    }

    fn handle_part_updated(&mut self, session_id: &SessionId, raw: &Value) -> Vec<SessionEvent> {
        let Some(part) = raw.pointer("/properties/part") else {
            return vec![self.log(session_id, "message.part.updated missing part")];
        };
        let Some(part_id) = part.get("id").and_then(Value::as_str) else {
            return Vec::new();
        };
        let Some(message_id) = part.get("messageID").and_then(Value::as_str) else {
            return Vec::new();
        };
        let Some((role, opencode_session_id)) = self.message_info.get(message_id).cloned() else {
            return vec![self.log(session_id, "part for unknown message")];
        };
        let conversation_id = self.conversation_for(&opencode_session_id);
        self.part_owner
            .insert(part_id.to_string(), message_id.to_string());

        match part.get("type").and_then(Value::as_str) {
            Some("text") => self.handle_text_part(session_id, part_id, part, &role, conversation_id),
            Some("tool") => self.handle_tool_part(session_id, part_id, part, conversation_id),
            _ => Vec::new(),
        }
    }

    fn handle_text_part(
        &mut self,
        session_id: &SessionId,
        part_id: &str,
        part: &Value,
        role: &str,
        conversation_id: ConversationId,
    ) -> Vec<SessionEvent> {
        let text = part.get("text").and_then(Value::as_str).unwrap_or("");

        if let Some(existing) = self.parts.get_mut(part_id) {
            let Some(delta) = text.strip_prefix(existing.last_text.as_str()) else {
                // Text was replaced rather than extended; re-upsert rather
                // than emit a delta from an inconsistent baseline.
                existing.last_text = text.to_string();
                return vec![SessionEvent::new(
                    self.ctx(session_id, Some(conversation_id)),
                    SessionEventKind::BlockUpsert {
                        block: Block::new(
                            existing.block_id.clone(),
                            chrono::Utc::now(),
                            BlockStatus::Pending,
                            text_payload(role, text),
                        ),
                    },
                )];
            };
            if delta.is_empty() {
                return Vec::new();
            }
            existing.last_text = text.to_string();
            vec![SessionEvent::new(
                self.ctx(session_id, Some(conversation_id)),
                SessionEventKind::BlockDelta {
                    block_id: existing.block_id.clone(),
                    delta: delta.to_string(),
                },
            )]
        } else {
            let block_id = BlockId::new_random();
            let is_user = role == "user";
            self.parts.insert(
                part_id.to_string(),
                PartState {
                    block_id: block_id.clone(),
                    last_text: text.to_string(),
                },
            );
            vec![SessionEvent::new(
                self.ctx(session_id, Some(conversation_id)),
                SessionEventKind::BlockUpsert {
                    block: Block::new(
                        block_id,
                        chrono::Utc::now(),
                        if is_user {
                            BlockStatus::Complete
                        } else {
                            BlockStatus::Pending
                        },
                        text_payload(role, text),
                    ),
                },
            )]
        }
    }

    fn handle_tool_part(
        &mut self,
        session_id: &SessionId,
        part_id: &str,
        part: &Value,
        conversation_id: ConversationId,
    ) -> Vec<SessionEvent> {
        let tool_name = part.get("tool").and_then(Value::as_str).unwrap_or("");
        let state = part.get("state").cloned().unwrap_or(Value::Null);
        let status = state.get("status").and_then(Value::as_str).unwrap_or("");
        let input = state.get("input").cloned().unwrap_or(Value::Null);
        let metadata_session_id = state
            .pointer("/metadata/sessionId")
            .and_then(Value::as_str)
            .map(str::to_string);

        let block_id = self
            .parts
            .get(part_id)
            .map(|p| p.block_id.clone())
            .unwrap_or_else(BlockId::new_random);
        self.parts.entry(part_id.to_string()).or_insert_with(|| PartState {
            block_id: block_id.clone(),
            last_text: String::new(),
        });

        let mut events = vec![SessionEvent::new(
            self.ctx(session_id, Some(conversation_id.clone())),
            SessionEventKind::BlockUpsert {
                block: Block::new(
                    block_id,
                    chrono::Utc::now(),
                    if status == "completed" || status == "error" {
                        BlockStatus::Complete
                    } else {
                        BlockStatus::Pending
                    },
                    BlockPayload::ToolUse {
                        tool_name: tool_name.to_string(),
                        tool_use_id: ToolUseId::from(part_id),
                        input: input.clone(),
                        display_name: None,
                    },
                ),
            },
        )];

        if tool_name == "task" && conversation_id.is_main() {
            if let Some(sub_session_id) = metadata_session_id {
                if !self.active_task_calls.contains_key(part_id) {
                    let subagent_id = SubagentId::from(sub_session_id.as_str());
                    self.known_sessions
                        .insert(sub_session_id, ConversationId::Subagent(subagent_id.clone()));
                    self.active_task_calls
                        .insert(part_id.to_string(), subagent_id.clone());
                    events.push(SessionEvent::new(
                        self.ctx(session_id, None),
                        SessionEventKind::SubagentSpawned {
                            tool_use_id: ToolUseId::from(part_id),
                            agent_id: Some(subagent_id),
                            prompt: input
                                .get("prompt")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            subagent_type: None,
                            description: input
                                .get("description")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                        },
                    ));
                }
            }

            if status == "completed" || status == "error" {
                if let Some(subagent_id) = self.active_task_calls.remove(part_id) {
                    let output = state
                        .get("output")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    events.push(SessionEvent::new(
                        self.ctx(session_id, None),
                        SessionEventKind::SubagentCompleted {
                            tool_use_id: ToolUseId::from(part_id),
                            agent_id: Some(subagent_id),
                            status: if status == "completed" {
                                crate::model::SubagentOutcome::Completed
                            } else {
                                crate::model::SubagentOutcome::Failed
                            },
                            output,
                            duration_ms: None,
                        },
                    ));
                }
            }
        }

        events
    }

    fn handle_session_idle(&mut self, session_id: &SessionId, raw: &Value) -> Vec<SessionEvent> {
        let opencode_session_id = raw
            .pointer("/properties/sessionID")
            .and_then(Value::as_str)
            .unwrap_or(&self.main_opencode_session_id)
            .to_string();
        let conversation_id = self.conversation_for(&opencode_session_id);

        // Clear scratch for parts belonging to this conversation only —
        // other conversations (e.g. a still-running subagent) keep theirs.
        let finished_messages: std::collections::HashSet<String> = self
            .message_info
            .iter()
            .filter(|(_, (_, sid))| *sid == opencode_session_id)
            .map(|(mid, _)| mid.clone())
            .collect();
        let part_owner = &self.part_owner;
        self.parts.retain(|part_id, _| {
            part_owner
                .get(part_id)
                .map(|mid| !finished_messages.contains(mid))
                .unwrap_or(true)
        });
        self.part_owner
            .retain(|_, mid| !finished_messages.contains(mid));

        vec![SessionEvent::new(
            EventContext::new(
                session_id.clone(),
                Some(conversation_id),
                EventSource::Runner,
                chrono::Utc::now().timestamp_millis(),
            ),
            SessionEventKind::SessionIdle {
                session_id: session_id.clone(),
            },
        )]
    }
}

fn text_payload(role: &str, text: &str) -> BlockPayload {
    if role == "user" {
        BlockPayload::UserMessage {
            content: text.to_string(),
        }
    } else {
        BlockPayload::AssistantText {
            content: text.to_string(),
            model: None,
        }
    }
}

impl EventConverter for OpencodeConverter {
    fn parse_event(&mut self, session_id: &SessionId, raw: &Value) -> Vec<SessionEvent> {
        let Some(event_type) = raw.get("type").and_then(Value::as_str) else {
            return vec![self.log(session_id, "raw message missing type")];
        };

        match event_type {
            "message.updated" => {
                self.handle_message_updated(raw);
                Vec::new()
            }
            "message.part.updated" => self.handle_part_updated(session_id, raw),
            "session.idle" => self.handle_session_idle(session_id, raw),
            other => vec![self.log(session_id, format!("unknown opencode message type: {other}"))],
        }
    }

    fn reset(&mut self) {
        self.message_info.clear();
        self.parts.clear();
        self.active_task_calls.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sid() -> SessionId {
        SessionId::from("s1")
    }

    #[test]
    fn first_text_part_upserts_pending_assistant_block() {
        let mut conv = OpencodeConverter::new("oc-main");
        conv.parse_event(
            &sid(),
            &json!({"type": "message.updated", "properties": {"info": {"id": "m1", "role": "assistant", "sessionID": "oc-main"}}}),
        );
        let events = conv.parse_event(
            &sid(),
            &json!({"type": "message.part.updated", "properties": {"part": {"id": "p1", "messageID": "m1", "type": "text", "text": "Hel"}}}),
        );
        assert_eq!(events.len(), 1);
        match &events[0].kind {
            SessionEventKind::BlockUpsert { block } => assert_eq!(block.status, BlockStatus::Pending),
            _ => unreachable!(),
        }
    }

    #[test]
    fn subsequent_text_part_emits_delta_of_new_suffix() {
        let mut conv = OpencodeConverter::new("oc-main");
        conv.parse_event(
            &sid(),
            &json!({"type": "message.updated", "properties": {"info": {"id": "m1", "role": "assistant", "sessionID": "oc-main"}}}),
        );
        conv.parse_event(
            &sid(),
            &json!({"type": "message.part.updated", "properties": {"part": {"id": "p1", "messageID": "m1", "type": "text", "text": "Hel"}}}),
        );
        let events = conv.parse_event(
            &sid(),
            &json!({"type": "message.part.updated", "properties": {"part": {"id": "p1", "messageID": "m1", "type": "text", "text": "Hello"}}}),
        );
        match &events[0].kind {
            SessionEventKind::BlockDelta { delta, .. } => assert_eq!(delta, "lo"),
            _ => unreachable!(),
        }
    }

    #[test]
    fn task_tool_with_metadata_session_id_spawns_subagent() {
        let mut conv = OpencodeConverter::new("oc-main");
        conv.parse_event(
            &sid(),
            &json!({"type": "message.updated", "properties": {"info": {"id": "m1", "role": "assistant", "sessionID": "oc-main"}}}),
        );
        let events = conv.parse_event(
            &sid(),
            &json!({
                "type": "message.part.updated",
                "properties": {"part": {
                    "id": "call1", "messageID": "m1", "type": "tool", "tool": "task",
                    "state": {"status": "running", "input": {"prompt": "sum 2+2"}, "metadata": {"sessionId": "oc-sub1"}}
                }}
            }),
        );
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1].kind, SessionEventKind::SubagentSpawned { .. }));
    }

    #[test]
    fn session_idle_emits_idle_event() {
        let mut conv = OpencodeConverter::new("oc-main");
        let events = conv.parse_event(
            &sid(),
            &json!({"type": "session.idle", "properties": {"sessionID": "oc-main"}}),
        );
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].kind, SessionEventKind::SessionIdle { .. }));
    }
}
