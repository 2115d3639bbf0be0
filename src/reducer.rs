//! The pure conversation fold (spec §4.6).
//!
//! Generalized from the teacher's `state_machine::transition` — a pure
//! `(State, Event) -> TransitionResult{state, effects}` — down to a fold
//! with no effects at all: folding conversation *content* must stay pure
//! per invariant 4, so side effects (persistence, publish) live in
//! `session`, one layer up.

use crate::error::ReducerError;
use crate::ids::{BlockId, ConversationId, SubagentId};
use crate::model::{
    Block, BlockStatus, ConversationState, SessionEventKind, SubagentConversation, SubagentOutcome,
    SubagentStatus,
};
use serde_json::Value;

/// Apply a single event to `state`, in place, per the table in spec §4.6.
///
/// Errors are never fatal to the caller: per §7's propagation policy the
/// caller drops the offending event and emits a `log{level=error}` event,
/// the session proceeds. `fold` reports the error instead of silently
/// swallowing it so the caller can do that logging.
pub fn fold(state: &mut ConversationState, conversation_id: &ConversationId, kind: &SessionEventKind) -> Result<(), ReducerError> {
    match kind {
        SessionEventKind::BlockUpsert { block } => {
            upsert_block(state, conversation_id, block.clone());
            Ok(())
        }
        SessionEventKind::BlockDelta { block_id, delta } => {
            apply_delta(state, conversation_id, block_id, delta)
        }
        SessionEventKind::SubagentSpawned {
            tool_use_id,
            agent_id,
            prompt,
            subagent_type,
            description,
        } => {
            spawn_subagent(
                state,
                tool_use_id.clone(),
                agent_id.clone(),
                prompt,
                subagent_type.clone(),
                description.clone(),
            );
            Ok(())
        }
        SessionEventKind::SubagentCompleted {
            tool_use_id,
            status,
            output,
            duration_ms,
            ..
        } => complete_subagent(state, tool_use_id, *status, output.clone(), *duration_ms),
        SessionEventKind::MetadataUpdate { metadata } => {
            merge_metadata(state, conversation_id, metadata);
            Ok(())
        }
        SessionEventKind::SessionIdle { .. } => {
            finalize_idle(state, conversation_id);
            Ok(())
        }
        // Everything else (files, logs, EE status, query lifecycle,
        // session:initialized/status/options:update, transcript:changed)
        // is handled elsewhere per §4.6's "other | Ignored by reducer" row.
        _ => Ok(()),
    }
}

fn blocks_mut<'s>(
    state: &'s mut ConversationState,
    conversation_id: &ConversationId,
) -> Option<&'s mut Vec<Block>> {
    match conversation_id {
        ConversationId::Main => Some(&mut state.blocks),
        ConversationId::Subagent(id) => state
            .subagent_by_id_mut(id)
            .map(|sub| &mut sub.blocks),
    }
}

fn upsert_block(state: &mut ConversationState, conversation_id: &ConversationId, block: Block) {
    let Some(blocks) = blocks_mut(state, conversation_id) else {
        // Target subagent doesn't exist yet — per invariant 3 this
        // shouldn't happen (spawned precedes any subagent block), but we
        // do not panic on adapter misbehavior; the event is simply
        // dropped, consistent with §7's "drop + log" recovery policy for
        // malformed converter output.
        return;
    };
    if let Some(existing) = blocks.iter_mut().find(|b| b.id == block.id) {
        existing.merge_from(block);
    } else {
        blocks.push(block);
    }
}

fn apply_delta(
    state: &mut ConversationState,
    conversation_id: &ConversationId,
    block_id: &BlockId,
    delta: &str,
) -> Result<(), ReducerError> {
    let Some(blocks) = blocks_mut(state, conversation_id) else {
        return Err(ReducerError::UnknownBlock {
            block_id: block_id.to_string(),
            conversation_id: conversation_id.to_string(),
        });
    };
    let Some(existing) = blocks.iter_mut().find(|b| &b.id == block_id) else {
        return Err(ReducerError::UnknownBlock {
            block_id: block_id.to_string(),
            conversation_id: conversation_id.to_string(),
        });
    };
    if existing.status != BlockStatus::Pending {
        return Err(ReducerError::NotPending {
            block_id: block_id.to_string(),
        });
    }
    existing.append_delta(delta);
    Ok(())
}

fn spawn_subagent(
    state: &mut ConversationState,
    tool_use_id: crate::ids::ToolUseId,
    agent_id: Option<SubagentId>,
    prompt: &str,
    subagent_type: Option<String>,
    description: Option<String>,
) {
    let id = agent_id.unwrap_or_else(|| SubagentId::from(tool_use_id.as_str()));
    let mut sub = SubagentConversation::new(id, tool_use_id, subagent_type);
    sub.metadata = serde_json::json!({
        "prompt": prompt,
        "description": description,
    });
    state.subagents.push(sub);
}

fn complete_subagent(
    state: &mut ConversationState,
    tool_use_id: &crate::ids::ToolUseId,
    status: SubagentOutcome,
    output: Option<String>,
    duration_ms: Option<u64>,
) -> Result<(), ReducerError> {
    let Some(sub) = state.subagent_by_tool_use_id_mut(tool_use_id) else {
        return Err(ReducerError::UnknownSubagent {
            subagent_id: tool_use_id.to_string(),
        });
    };
    sub.status = match status {
        SubagentOutcome::Completed => SubagentStatus::Completed,
        SubagentOutcome::Failed => SubagentStatus::Failed,
    };
    if let Some(out) = output {
        sub.metadata["output"] = Value::String(out);
    }
    if let Some(ms) = duration_ms {
        sub.metadata["durationMs"] = Value::from(ms);
    }
    let sub_id = sub.id.clone();
    // The reducer also marks the matching `subagent` block in the *parent*
    // (main) conversation complete, per §4.6's `subagent:completed` row.
    for b in &mut state.blocks {
        if let crate::model::BlockPayload::Subagent {
            subagent_id,
            output: block_output,
            duration_ms: block_duration,
            ..
        } = &mut b.payload
        {
            if *subagent_id == sub_id {
                b.status = BlockStatus::Complete;
                if let Some(sub) = state.subagents.iter().find(|s| s.id == sub_id) {
                    *block_output = sub.metadata.get("output").and_then(|v| v.as_str()).map(str::to_string);
                    *block_duration = sub.metadata.get("durationMs").and_then(|v| v.as_u64());
                }
                break;
            }
        }
    }
    Ok(())
}

fn merge_metadata(state: &mut ConversationState, conversation_id: &ConversationId, metadata: &Value) {
    let target = match conversation_id {
        ConversationId::Main => &mut state.metadata,
        ConversationId::Subagent(id) => match state.subagent_by_id_mut(id) {
            Some(sub) => &mut sub.metadata,
            None => return,
        },
    };
    shallow_merge(target, metadata);
}

fn shallow_merge(target: &mut Value, incoming: &Value) {
    let Value::Object(incoming_map) = incoming else {
        *target = incoming.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(target_map) = target {
        for (k, v) in incoming_map {
            target_map.insert(k.clone(), v.clone());
        }
    }
}

fn finalize_idle(state: &mut ConversationState, conversation_id: &ConversationId) {
    match conversation_id {
        ConversationId::Main => state.finalize_pending_in_main(),
        ConversationId::Subagent(id) => state.finalize_pending_in_subagent(id),
    }
}

#[cfg(test)]
mod proptests;
