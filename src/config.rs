//! Recognized configuration (spec §6.4)
//!
//! Plain struct with a `Default` impl, in the teacher's `LlmConfig` style —
//! minus `from_env`, since config loading is an explicit non-goal (spec
//! §1) for this crate. The embedding application builds a `HostConfig` and
//! hands it to [`crate::host::SessionHost::new`].

use std::time::Duration;

/// Host- and session-level tunables, one field per §6.4 option.
#[derive(Debug, Clone, PartialEq)]
pub struct HostConfig {
    /// Hard cap on loaded sessions. `None` means unbounded.
    pub max_concurrent_sessions: Option<usize>,

    /// Per-session query queue depth before `Busy`.
    pub query_queue_depth: usize,

    /// EE health probe interval. `Duration::ZERO` disables health checks.
    pub health_check_interval: Duration,

    /// EE restart budget per loaded lifetime.
    pub max_restarts: u32,

    /// Grace period after `Runner::cancel()` before the EE is force-killed.
    pub hard_cancel_timeout: Duration,

    /// Per-session grace period on `SessionHost::shutdown`.
    pub shutdown_grace: Duration,

    /// Ring size for `DebugEvent` buffers.
    pub debug_event_buffer: usize,

    /// Ring size for `SessionLogEntry` buffers.
    pub session_log_buffer: usize,

    /// LRU size for the Claude-SDK subagent-prompt filter.
    pub subagent_prompt_cache_size: usize,

    /// Per-subscriber outbound queue bound before disconnecting with `Slow`.
    pub subscriber_outbound_queue: usize,

    /// Open Question (spec §9): whether enqueueing a new query while one is
    /// active cancels the in-flight query instead of rejecting with `Busy`.
    /// Default `false` (reject), matching the spec's stated current
    /// behavior.
    pub cancel_in_flight_on_enqueue: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: None,
            query_queue_depth: 1,
            health_check_interval: Duration::from_secs(30),
            max_restarts: 2,
            hard_cancel_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
            debug_event_buffer: 100,
            session_log_buffer: 500,
            subagent_prompt_cache_size: 100,
            subscriber_outbound_queue: 1024,
            cancel_in_flight_on_enqueue: false,
        }
    }
}

impl HostConfig {
    pub fn health_checks_enabled(&self) -> bool {
        !self.health_check_interval.is_zero()
    }
}
