//! Bounded ring buffers (spec §3, §4.7; behavior pinned down in
//! SPEC_FULL.md §C.3): `DebugEvent` and `SessionLogEntry` history kept per
//! session, push-evicts-oldest, exposed via snapshot accessors.

use crate::model::event::{LogLevel, SessionEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

/// Fixed-capacity FIFO: pushing past capacity silently drops the oldest
/// entry. Capacity `0` keeps the ring permanently empty rather than
/// panicking, since `HostConfig` fields are plain `usize`s an embedder
/// could set to zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ring<T> {
    capacity: usize,
    buf: VecDeque<T>,
}

impl<T> Ring<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buf: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    pub fn push(&mut self, item: T) {
        if self.capacity == 0 {
            return;
        }
        if self.buf.len() >= self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(item);
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.buf.iter()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.buf.iter().cloned().collect()
    }
}

/// A copy of a published `SessionEvent`, retained for post-hoc debugging
/// (spec §3/§4.7's "ring of `DebugEvent`s"). Distinct type from
/// `SessionEvent` itself so the bus's live stream and the session's
/// retained history can evolve independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugEvent {
    pub recorded_at: DateTime<Utc>,
    pub event: SessionEvent,
}

impl DebugEvent {
    pub fn new(event: SessionEvent) -> Self {
        Self {
            recorded_at: Utc::now(),
            event,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl SessionLogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest_past_capacity() {
        let mut ring: Ring<i32> = Ring::new(3);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.snapshot(), vec![2, 3, 4]);
    }

    #[test]
    fn zero_capacity_ring_stays_empty() {
        let mut ring: Ring<i32> = Ring::new(0);
        ring.push(1);
        ring.push(2);
        assert!(ring.is_empty());
    }

    #[test]
    fn session_log_entry_carries_level_and_message() {
        let entry = SessionLogEntry::new(LogLevel::Warn, "dropped event", None);
        assert_eq!(entry.level, LogLevel::Warn);
        assert_eq!(entry.message, "dropped event");
    }
}
