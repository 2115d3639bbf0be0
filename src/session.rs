//! `Session` — the per-conversation query pipeline (spec §4.2).
//!
//! Grounded on the teacher's `ConversationRuntime::run` (`runtime/executor.rs`):
//! a single-threaded executor reading one `mpsc::Receiver` in a loop,
//! applying effects as it goes. `Session` keeps that shape — one query
//! runs at a time, queued work waits — but splits "wait for the runner"
//! from "process what it said" across two tasks, since a `Runner`'s
//! `MessageSink` is a synchronous callback and folding/publishing/
//! persisting each message is async work that must not block the runner's
//! own read loop.

use crate::config::HostConfig;
use crate::converter::EventConverter;
use crate::ee::{EEDriver, ExecutionEnvironment};
use crate::error::{HostError, HostResult};
use crate::eventbus::EventBus;
use crate::ids::{BlockId, ConversationId, SessionId};
use crate::model::{
    ActiveQuery, Block, BlockPayload, ConversationState, DebugEvent, EventContext, EventSource,
    LogLevel, Ring, SessionEvent, SessionEventKind, SessionLogEntry, SessionRecord,
    SessionRuntimeState,
};
use crate::persistence::PersistenceAdapter;
use crate::reducer;
use crate::runner::Runner;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

/// DESIGN.md Open Question decision #3: transcript-append retries before
/// a session is demoted to read-only rather than failing the in-flight
/// query.
const TRANSCRIPT_WRITE_RETRIES: u32 = 3;
const TRANSCRIPT_WRITE_RETRY_BASE: Duration = Duration::from_millis(100);

struct QueryJob {
    prompt: String,
    optimistic_block_id: Option<BlockId>,
    /// Spec §5: wall-clock budget for the query. `None` means no deadline
    /// beyond whatever the runner itself enforces.
    deadline: Option<Duration>,
}

/// Point-in-time read of everything `getState` (spec §4.2) exposes.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub record: SessionRecord,
    pub runtime: SessionRuntimeState,
    pub conversation: ConversationState,
}

/// Drives one loaded session: a bounded FIFO of queries, an
/// `ExecutionEnvironment` brought up lazily on first use, and the
/// reducer/publish/persist pipeline that turns a runner's raw output into
/// conversation state and bus events.
pub struct Session<R: Runner, D: EEDriver, P: PersistenceAdapter> {
    session_id: SessionId,
    record: Mutex<SessionRecord>,
    runtime: Mutex<SessionRuntimeState>,
    conversation: Mutex<ConversationState>,
    converter: Mutex<Box<dyn EventConverter>>,
    ee: ExecutionEnvironment<D>,
    runner: R,
    persistence: P,
    bus: Arc<EventBus>,
    config: HostConfig,
    debug_events: Mutex<Ring<DebugEvent>>,
    logs: Mutex<Ring<SessionLogEntry>>,
    /// Raw transcript lines not yet flushed to `persistence::save_transcript`,
    /// keyed by conversation so `syncNow` and the background flush agree on
    /// what's still outstanding. A persistent field, not a query-local
    /// buffer, since `syncNow` must be able to flush mid-query.
    write_ahead: Mutex<HashMap<ConversationId, Vec<String>>>,
    /// Spec §4.2's "user-message echo": the prompt plus the optimistic
    /// block id the caller wants that prompt's echoed `block:upsert`
    /// rewritten to, cleared once matched or once the query ends.
    pending_echo: Mutex<Option<(String, BlockId)>>,
    query_tx: mpsc::Sender<QueryJob>,
    /// Set while a cancel (deadline expiry or an external
    /// `cancel_active_query_and_wait`) is in flight, so `run_query` reports
    /// `query:failed{reason=canceled}` regardless of what the runner itself
    /// returns (spec §5).
    canceled: std::sync::atomic::AtomicBool,
}

impl<R, D, P> Session<R, D, P>
where
    R: Runner + 'static,
    D: EEDriver + 'static,
    P: PersistenceAdapter + 'static,
{
    /// Build a `Session` around its record/state/adapters and start its
    /// background query executor. Returns the shared handle plus the
    /// executor's join handle (dropped by most callers; kept for tests
    /// and for `SessionHost::shutdown`'s graceful drain).
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        record: SessionRecord,
        initial_state: ConversationState,
        converter: Box<dyn EventConverter>,
        runner: R,
        ee_driver: D,
        persistence: P,
        bus: Arc<EventBus>,
        config: HostConfig,
        needs_attention: bool,
    ) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let session_id = record.session_id.clone();
        let (query_tx, query_rx) = mpsc::channel(config.query_queue_depth.max(1));

        let mut runtime_state = SessionRuntimeState::fresh_loaded();
        runtime_state.needs_attention = needs_attention;

        let debug_event_buffer = config.debug_event_buffer;
        let session_log_buffer = config.session_log_buffer;
        let ee = ExecutionEnvironment::new(ee_driver, config.clone());

        let session = Arc::new(Self {
            session_id,
            record: Mutex::new(record),
            runtime: Mutex::new(runtime_state),
            conversation: Mutex::new(initial_state),
            converter: Mutex::new(converter),
            ee,
            runner,
            persistence,
            bus,
            config,
            debug_events: Mutex::new(Ring::new(debug_event_buffer)),
            logs: Mutex::new(Ring::new(session_log_buffer)),
            write_ahead: Mutex::new(HashMap::new()),
            pending_echo: Mutex::new(None),
            query_tx,
            canceled: std::sync::atomic::AtomicBool::new(false),
        });

        let executor = Arc::clone(&session);
        let handle = tokio::spawn(async move { executor.run_executor(query_rx).await });

        if session.config.health_checks_enabled() {
            let prober = Arc::clone(&session);
            tokio::spawn(async move { prober.run_health_check_ticker().await });
        }

        (session, handle)
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// `sendMessage` (spec §4.2): enqueue a prompt. Rejects with `Busy`
    /// when a query is already active and `cancel_in_flight_on_enqueue` is
    /// off (the default), or when the queue itself is full.
    pub async fn enqueue_query(self: &Arc<Self>, prompt: impl Into<String>) -> HostResult<()> {
        self.enqueue_query_full(prompt, None, None).await
    }

    /// Same as `enqueue_query`, but rewrites the echoed user-message block
    /// to `optimistic_block_id` instead of appending a duplicate (spec
    /// §4.2's optimistic-UI reconciliation).
    pub async fn enqueue_query_with_optimistic_id(
        self: &Arc<Self>,
        prompt: impl Into<String>,
        optimistic_block_id: Option<BlockId>,
    ) -> HostResult<()> {
        self.enqueue_query_full(prompt, optimistic_block_id, None).await
    }

    /// Same as `enqueue_query`, but bounds the query to `deadline`: on
    /// expiry the executor cancels the runner, per spec §5.
    pub async fn enqueue_query_with_deadline(
        self: &Arc<Self>,
        prompt: impl Into<String>,
        deadline: Option<Duration>,
    ) -> HostResult<()> {
        self.enqueue_query_full(prompt, None, deadline).await
    }

    async fn enqueue_query_full(
        self: &Arc<Self>,
        prompt: impl Into<String>,
        optimistic_block_id: Option<BlockId>,
        deadline: Option<Duration>,
    ) -> HostResult<()> {
        let prompt = prompt.into();
        let (busy, read_only) = {
            let runtime = self.runtime.lock().await;
            (runtime.active_query.is_some(), runtime.read_only)
        };
        if read_only {
            return Err(HostError::ReadOnly {
                session_id: self.session_id.clone(),
            });
        }
        if busy {
            if self.config.cancel_in_flight_on_enqueue {
                self.runner.cancel().await;
            } else {
                return Err(HostError::Busy {
                    session_id: self.session_id.clone(),
                });
            }
        }

        let job = QueryJob {
            prompt,
            optimistic_block_id,
            deadline,
        };
        self.query_tx
            .try_send(job)
            .map_err(|_| HostError::Busy {
                session_id: self.session_id.clone(),
            })
    }

    /// Cancel whatever query is currently running, if any, and block until
    /// the executor has recorded its terminal event — escalating to
    /// `Runner::force_kill` if the runner ignores `cancel()` within
    /// `HostConfig::hard_cancel_timeout`. Used by `SessionHost::unload_session`
    /// and `shutdown` for spec §8's "concurrent unloadSession + in-flight
    /// query" boundary: the query is canceled and `query:failed{code=Canceled}`
    /// is published before the EE is torn down.
    pub async fn cancel_active_query_and_wait(&self) {
        if self.runtime.lock().await.active_query.is_none() {
            return;
        }
        self.canceled.store(true, std::sync::atomic::Ordering::SeqCst);
        self.runner.cancel().await;

        let deadline = tokio::time::Instant::now() + self.config.hard_cancel_timeout;
        while tokio::time::Instant::now() < deadline {
            if self.runtime.lock().await.active_query.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        if self.runtime.lock().await.active_query.is_some() {
            warn!(
                session_id = %self.session_id,
                "active query still running after hard_cancel_timeout, force-killing runner"
            );
            self.runner.force_kill().await;
            while self.runtime.lock().await.active_query.is_some() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }

    /// Spec §4.3's periodic probe: fires every `health_check_interval`
    /// while the session is loaded, independent of query activity. Runs
    /// for as long as the executor does — both are spawned off the same
    /// `Arc<Self>` in `spawn` and stop together once the session drops.
    async fn run_health_check_ticker(self: Arc<Self>) {
        use crate::model::EeStatus;
        let interval = self.config.health_check_interval;
        loop {
            tokio::time::sleep(interval).await;
            if self.ee.health_check().await.is_err() {
                let snapshot = self.ee.snapshot().await;
                if snapshot.status == EeStatus::Error {
                    self.publish(None, SessionEventKind::EeError {
                        ee_id: snapshot.id.clone(),
                        status_message: snapshot.last_error.as_ref().map(|e| e.message.clone()),
                    })
                    .await;
                }
            }
        }
    }

    pub async fn terminate_execution_environment(&self) -> HostResult<()> {
        self.ee.terminate().await?;
        self.publish(None, SessionEventKind::EeTerminated {
            ee_id: None,
            status_message: None,
        })
        .await;
        Ok(())
    }

    pub async fn get_state(&self) -> SessionSnapshot {
        SessionSnapshot {
            record: self.record.lock().await.clone(),
            runtime: self.runtime.lock().await.clone(),
            conversation: self.conversation.lock().await.clone(),
        }
    }

    /// SPEC_FULL.md §C.3: a snapshot of the retained `DebugEvent` ring,
    /// oldest first.
    pub async fn debug_events(&self) -> Vec<DebugEvent> {
        self.debug_events.lock().await.snapshot()
    }

    /// SPEC_FULL.md §C.3: a snapshot of the retained `SessionLogEntry`
    /// ring, oldest first.
    pub async fn log_entries(&self) -> Vec<SessionLogEntry> {
        self.logs.lock().await.snapshot()
    }

    /// `syncNow` (spec §4.2): force a transcript write right now rather
    /// than waiting for the next query to finish. Never fails outright —
    /// persistent backend failure instead demotes the session to
    /// read-only (DESIGN.md Open Question decision #3).
    pub async fn sync_now(&self) {
        self.flush_write_ahead().await;
    }

    async fn run_executor(self: Arc<Self>, mut rx: mpsc::Receiver<QueryJob>) {
        while let Some(job) = rx.recv().await {
            self.run_query(job).await;
        }
    }

    async fn run_query(self: &Arc<Self>, job: QueryJob) {
        {
            let mut runtime = self.runtime.lock().await;
            runtime.active_query = Some(ActiveQuery {
                started_at: Utc::now(),
                prompt: job.prompt.clone(),
            });
        }
        self.canceled.store(false, std::sync::atomic::Ordering::SeqCst);
        if let Some(id) = job.optimistic_block_id.clone() {
            *self.pending_echo.lock().await = Some((job.prompt.clone(), id));
        }
        self.publish(None, SessionEventKind::QueryStarted {
            prompt: Some(job.prompt.clone()),
        })
        .await;

        if let Err(e) = self.ensure_ee_ready().await {
            self.publish(None, SessionEventKind::QueryFailed {
                reason: Some(e.to_string()),
            })
            .await;
            self.clear_active_query().await;
            self.publish_status().await;
            return;
        }

        let session_options = self.record.lock().await.session_options.clone();

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<Value>();
        let sink: crate::runner::MessageSink = Box::new(move |v| {
            let _ = raw_tx.send(v);
        });

        let processor = Arc::clone(self);
        let processing = tokio::spawn(async move {
            while let Some(raw) = raw_rx.recv().await {
                processor.process_raw_message(&raw).await;
            }
        });

        let run_future = self.runner.run_query(&job.prompt, &session_options, sink);
        let run_result = match job.deadline {
            Some(deadline) => self.run_with_deadline(run_future, deadline).await,
            None => run_future.await,
        };
        if let Err(e) = processing.await {
            warn!(error = %e, "raw message processing task panicked");
        }

        if self.canceled.swap(false, std::sync::atomic::Ordering::SeqCst) {
            // An external cancel (deadline expiry or `unload_session`/
            // `shutdown` racing an in-flight query) wins over whatever the
            // runner itself returned — spec §5/§8: the terminal event is
            // `query:failed{reason=canceled}`, not a generic error.
            self.publish(None, SessionEventKind::QueryFailed {
                reason: Some("canceled".to_string()),
            })
            .await;
        } else {
            match run_result {
                Ok(()) => {
                    self.publish(None, SessionEventKind::QueryCompleted {
                        prompt: Some(job.prompt.clone()),
                    })
                    .await;
                }
                Err(e) => {
                    let message = e.to_string();
                    self.publish(None, SessionEventKind::Error {
                        message: message.clone(),
                        code: None,
                    })
                    .await;
                    self.publish(None, SessionEventKind::QueryFailed {
                        reason: Some(message),
                    })
                    .await;
                }
            }
        }

        self.flush_write_ahead().await;

        *self.pending_echo.lock().await = None;
        self.clear_active_query().await;
        self.publish_status().await;
    }

    /// Bring the EE up if it isn't already ready, publishing `ee:creating`
    /// / `ee:ready` around the wait (spec §4.3's lazy-start contract: the
    /// first query on a fresh session is what provisions its sandbox).
    async fn ensure_ee_ready(&self) -> HostResult<()> {
        use crate::model::EeStatus;
        if self.ee.snapshot().await.status == EeStatus::Ready {
            return Ok(());
        }
        self.publish(None, SessionEventKind::EeCreating {
            ee_id: None,
            status_message: None,
        })
        .await;
        match self.ee.start().await {
            Ok(handle) => {
                self.publish(None, SessionEventKind::EeReady {
                    ee_id: Some(handle.id),
                    status_message: None,
                })
                .await;
                Ok(())
            }
            Err(e) => {
                self.publish(None, SessionEventKind::EeError {
                    ee_id: None,
                    status_message: Some(e.to_string()),
                })
                .await;
                Err(e.into())
            }
        }
    }

    /// Spec §5: race `run_future` against `deadline`. On expiry, cancel the
    /// runner and give it `hard_cancel_timeout` to return before
    /// escalating to `force_kill`; marks the query `canceled` either way so
    /// `run_query` reports it as such regardless of what `run_future`
    /// itself eventually resolves to.
    async fn run_with_deadline<F>(&self, run_future: F, deadline: Duration) -> crate::error::RunnerResult<()>
    where
        F: std::future::Future<Output = crate::error::RunnerResult<()>>,
    {
        tokio::pin!(run_future);
        if let Ok(result) = tokio::time::timeout(deadline, &mut run_future).await {
            return result;
        }
        self.canceled.store(true, std::sync::atomic::Ordering::SeqCst);
        self.runner.cancel().await;
        if let Ok(result) = tokio::time::timeout(self.config.hard_cancel_timeout, &mut run_future).await {
            return result;
        }
        warn!(
            session_id = %self.session_id,
            "runner ignored cancel within hard_cancel_timeout, force-killing"
        );
        self.runner.force_kill().await;
        run_future.await
    }

    async fn clear_active_query(&self) {
        self.runtime.lock().await.active_query = None;
    }

    async fn publish_status(&self) {
        let runtime = self.runtime.lock().await.clone();
        self.publish(None, SessionEventKind::Status { runtime }).await;
    }

    /// Construct a `SessionEvent` around `kind` and hand it to the bus,
    /// for supervisor-originated events that don't already carry an
    /// `EventContext` the way converter-produced ones do.
    async fn publish(&self, conversation_id: Option<ConversationId>, kind: SessionEventKind) {
        if !kind.is_publishable() {
            return;
        }
        let event = SessionEvent::new(
            EventContext::new(
                self.session_id.clone(),
                conversation_id,
                EventSource::Supervisor,
                Utc::now().timestamp_millis(),
            ),
            kind,
        );
        self.record_locally(&event).await;
        self.bus.publish(&self.session_id, event).await;
    }

    /// Feed one raw vendor message through the converter, fold every
    /// resulting event into conversation state, append it to the
    /// write-ahead buffer, and fan it out — the same pipeline
    /// `transcript::parse_combined_transcript` replays offline (invariant
    /// 3.5, stream/replay parity).
    async fn process_raw_message(self: &Arc<Self>, raw: &Value) {
        let events = {
            let mut converter = self.converter.lock().await;
            converter.parse_event(&self.session_id, raw)
        };
        if events.is_empty() {
            return;
        }

        let buffer_key = events
            .iter()
            .find_map(|e| e.context.conversation_id.clone())
            .unwrap_or(ConversationId::Main);
        {
            let mut write_ahead = self.write_ahead.lock().await;
            write_ahead.entry(buffer_key).or_default().push(raw.to_string());
        }

        for mut event in events {
            self.reconcile_echo(&mut event).await;
            let conversation_id = event
                .context
                .conversation_id
                .clone()
                .unwrap_or(ConversationId::Main);

            let fold_result = {
                let mut conversation = self.conversation.lock().await;
                reducer::fold(&mut conversation, &conversation_id, &event.kind)
            };
            if let Err(e) = fold_result {
                warn!(error = %e, %conversation_id, "dropping event that failed to fold");
                self.publish(Some(conversation_id), SessionEventKind::Error {
                    message: e.to_string(),
                    code: None,
                })
                .await;
                continue;
            }

            self.record_locally(&event).await;
            if event.kind.is_publishable() {
                self.bus.publish(&self.session_id, event).await;
            }
        }
    }

    /// Spec §4.2's user-message echo policy: when the runner emits a
    /// `block:upsert{UserMessage}` whose content exactly matches the
    /// prompt that started this query, rewrite its block id to the
    /// caller-supplied optimistic one instead of leaving it to land as a
    /// second, duplicate block.
    async fn reconcile_echo(&self, event: &mut SessionEvent) {
        let mut pending = self.pending_echo.lock().await;
        let Some((prompt, optimistic_id)) = pending.clone() else {
            return;
        };
        if let SessionEventKind::BlockUpsert { block } = &mut event.kind {
            if let BlockPayload::UserMessage { content } = &block.payload {
                if *content == prompt {
                    block.id = optimistic_id;
                    *pending = None;
                }
            }
        }
    }

    async fn record_locally(&self, event: &SessionEvent) {
        self.debug_events
            .lock()
            .await
            .push(DebugEvent::new(event.clone()));
        if let SessionEventKind::Log { level, message, data } = &event.kind {
            self.logs.lock().await.push(SessionLogEntry::new(
                *level,
                message.clone(),
                data.clone(),
            ));
        }
    }

    /// Drain the write-ahead buffer and hand each conversation's
    /// accumulated raw lines to `PersistenceAdapter::save_transcript`,
    /// retrying transient failures before demoting the session to
    /// read-only. `TranscriptChanged` marks the bookkeeping internally (it
    /// is never published — `SessionEventKind::is_publishable` excludes
    /// it).
    async fn flush_write_ahead(&self) {
        let pending: HashMap<ConversationId, Vec<String>> = {
            let mut write_ahead = self.write_ahead.lock().await;
            std::mem::take(&mut *write_ahead)
        };
        for (conversation_id, lines) in pending {
            if lines.is_empty() {
                continue;
            }
            let blob = lines.join("\n");
            if let Err(e) = self.save_transcript_with_retry(&conversation_id, &blob).await {
                self.demote_to_read_only(&e.to_string()).await;
                continue;
            }
            debug_assert!(!SessionEventKind::TranscriptChanged {
                conversation_id: conversation_id.clone(),
            }
            .is_publishable());
            tracing::debug!(%conversation_id, "transcript flushed");
        }
    }

    async fn save_transcript_with_retry(
        &self,
        conversation_id: &ConversationId,
        blob: &str,
    ) -> Result<(), crate::error::PersistenceError> {
        let conv_ref = (!conversation_id.is_main()).then_some(conversation_id);
        let mut last_err = None;
        for attempt in 0..=TRANSCRIPT_WRITE_RETRIES {
            match self.persistence.save_transcript(&self.session_id, blob, conv_ref).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, error = %e, "transcript write failed, retrying");
                    last_err = Some(e);
                    if attempt < TRANSCRIPT_WRITE_RETRIES {
                        tokio::time::sleep(TRANSCRIPT_WRITE_RETRY_BASE * 2u32.pow(attempt)).await;
                    }
                }
            }
        }
        Err(last_err.expect("loop runs at least once"))
    }

    async fn demote_to_read_only(&self, reason: &str) {
        self.runtime.lock().await.read_only = true;
        self.publish(None, SessionEventKind::Log {
            level: LogLevel::Error,
            message: format!("transcript writes failing, session demoted to read-only: {reason}"),
            data: None,
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::testing::EchoConverter;
    use crate::ee::testing::FlakyDriver;
    use crate::model::Architecture;
    use crate::persistence::memory::InMemoryPersistence;
    use crate::runner::testing::ScriptedRunner;
    use serde_json::json;

    fn record() -> SessionRecord {
        SessionRecord::new(
            SessionId::from("s1"),
            crate::ids::AgentProfileRef::from("default"),
            Architecture::ClaudeSdk,
            Value::Null,
        )
    }

    fn user_message_block(content: &str) -> SessionEventKind {
        SessionEventKind::BlockUpsert {
            block: Block::new(
                BlockId::from("optimistic-0"),
                Utc::now(),
                crate::model::BlockStatus::Complete,
                BlockPayload::UserMessage {
                    content: content.to_string(),
                },
            ),
        }
    }

    fn make_session(
        script: Vec<Value>,
    ) -> Arc<Session<ScriptedRunner, FlakyDriver, InMemoryPersistence>> {
        let bus = Arc::new(EventBus::new(&HostConfig::default()));
        let (session, _handle) = Session::spawn(
            record(),
            ConversationState::new(),
            Box::new(EchoConverter),
            ScriptedRunner::new(script),
            FlakyDriver::new(0),
            InMemoryPersistence::new(),
            bus,
            HostConfig::default(),
            false,
        );
        session
    }

    #[tokio::test]
    async fn enqueue_runs_query_and_completes() {
        let session = make_session(vec![json!({"hello": "world"})]);
        session.enqueue_query("hi").await.unwrap();

        for _ in 0..50 {
            if session.get_state().await.runtime.active_query.is_none() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let state = session.get_state().await;
        assert!(state.runtime.active_query.is_none());
        assert_eq!(state.runtime.execution_environment.status, crate::model::EeStatus::Ready);
    }

    #[tokio::test]
    async fn enqueue_while_busy_rejects_with_busy_by_default() {
        let session = make_session(vec![json!({"a": 1}), json!({"b": 2})]);
        session.enqueue_query("first").await.unwrap();
        // Queue depth is 1 and the current-thread test runtime hasn't
        // polled the spawned executor yet, so the channel is still full.
        let second = session.enqueue_query("second").await;
        assert!(matches!(second, Err(HostError::Busy { .. })));
    }

    #[tokio::test]
    async fn sync_now_flushes_pending_transcript() {
        let session = make_session(vec![json!({"x": 1})]);
        session.enqueue_query("hi").await.unwrap();

        for _ in 0..50 {
            if session.get_state().await.runtime.active_query.is_none() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        // By the time the query completes, run_query already flushed.
        session.sync_now().await;
    }

    #[tokio::test]
    async fn deadline_expiry_cancels_query_and_reports_it_as_canceled() {
        use crate::runner::testing::HangingRunner;

        let bus = Arc::new(EventBus::new(&HostConfig::default()));
        let config = HostConfig {
            hard_cancel_timeout: Duration::from_millis(200),
            ..HostConfig::default()
        };
        let (session, _handle) = Session::spawn(
            record(),
            ConversationState::new(),
            Box::new(EchoConverter),
            HangingRunner::new(true),
            FlakyDriver::new(0),
            InMemoryPersistence::new(),
            bus,
            config,
            false,
        );
        session
            .enqueue_query_with_deadline("hi", Some(Duration::from_millis(20)))
            .await
            .unwrap();

        for _ in 0..200 {
            if session.get_state().await.runtime.active_query.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(session.get_state().await.runtime.active_query.is_none());

        let failed_reason = session.debug_events().await.into_iter().find_map(|e| match e.event.kind {
            SessionEventKind::QueryFailed { reason } => Some(reason),
            _ => None,
        });
        assert_eq!(failed_reason, Some(Some("canceled".to_string())));
    }

    #[tokio::test]
    async fn deadline_expiry_escalates_to_force_kill_when_runner_ignores_cancel() {
        use crate::runner::testing::HangingRunner;

        let runner = Arc::new(HangingRunner::new(false));
        let runner_handle = Arc::clone(&runner);
        let bus = Arc::new(EventBus::new(&HostConfig::default()));
        let config = HostConfig {
            hard_cancel_timeout: Duration::from_millis(30),
            ..HostConfig::default()
        };
        let (session, _handle) = Session::spawn(
            record(),
            ConversationState::new(),
            Box::new(EchoConverter),
            runner,
            FlakyDriver::new(0),
            InMemoryPersistence::new(),
            bus,
            config,
            false,
        );
        session
            .enqueue_query_with_deadline("hi", Some(Duration::from_millis(20)))
            .await
            .unwrap();

        for _ in 0..200 {
            if session.get_state().await.runtime.active_query.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(session.get_state().await.runtime.active_query.is_none());
        assert!(runner_handle.was_force_killed());
    }

    #[tokio::test]
    async fn cancel_active_query_and_wait_marks_running_query_canceled() {
        use crate::runner::testing::HangingRunner;

        let bus = Arc::new(EventBus::new(&HostConfig::default()));
        let config = HostConfig {
            hard_cancel_timeout: Duration::from_millis(200),
            ..HostConfig::default()
        };
        let (session, _handle) = Session::spawn(
            record(),
            ConversationState::new(),
            Box::new(EchoConverter),
            HangingRunner::new(true),
            FlakyDriver::new(0),
            InMemoryPersistence::new(),
            bus,
            config,
            false,
        );
        session.enqueue_query("hi").await.unwrap();

        for _ in 0..50 {
            if session.get_state().await.runtime.active_query.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(session.get_state().await.runtime.active_query.is_some());

        session.cancel_active_query_and_wait().await;
        assert!(session.get_state().await.runtime.active_query.is_none());

        let failed_reason = session.debug_events().await.into_iter().find_map(|e| match e.event.kind {
            SessionEventKind::QueryFailed { reason } => Some(reason),
            _ => None,
        });
        assert_eq!(failed_reason, Some(Some("canceled".to_string())));
    }

    struct AlwaysFailingPersistence;

    #[async_trait::async_trait]
    impl PersistenceAdapter for AlwaysFailingPersistence {
        async fn list_all_sessions(&self) -> crate::error::PersistenceResult<Vec<SessionRecord>> {
            Ok(vec![])
        }

        async fn load_session(
            &self,
            _id: &SessionId,
        ) -> crate::error::PersistenceResult<Option<crate::persistence::LoadedSession>> {
            Ok(None)
        }

        async fn create_session_record(&self, _record: &SessionRecord) -> crate::error::PersistenceResult<()> {
            Ok(())
        }

        async fn update_session_record(&self, _record: &SessionRecord) -> crate::error::PersistenceResult<()> {
            Ok(())
        }

        async fn save_transcript(
            &self,
            _session_id: &SessionId,
            _raw_transcript: &str,
            _conversation_id: Option<&ConversationId>,
        ) -> crate::error::PersistenceResult<()> {
            Err(crate::error::PersistenceError::Backend("disk full".into()))
        }

        async fn save_workspace_file(
            &self,
            _session_id: &SessionId,
            _file: &crate::model::WorkspaceFile,
        ) -> crate::error::PersistenceResult<()> {
            Ok(())
        }

        async fn delete_session_file(&self, _session_id: &SessionId, _path: &str) -> crate::error::PersistenceResult<()> {
            Ok(())
        }

        async fn list_agent_profiles(&self) -> crate::error::PersistenceResult<Vec<crate::ids::AgentProfileRef>> {
            Ok(vec![])
        }

        async fn load_agent_profile(
            &self,
            _id: &crate::ids::AgentProfileRef,
        ) -> crate::error::PersistenceResult<Option<Value>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn persistent_transcript_failure_demotes_session_to_read_only() {
        let bus = Arc::new(EventBus::new(&HostConfig::default()));
        let (session, _handle) = Session::spawn(
            record(),
            ConversationState::new(),
            Box::new(EchoConverter),
            ScriptedRunner::new(vec![json!({"x": 1})]),
            FlakyDriver::new(0),
            AlwaysFailingPersistence,
            bus,
            HostConfig::default(),
            false,
        );
        session.enqueue_query("hi").await.unwrap();

        for _ in 0..200 {
            if session.get_state().await.runtime.read_only {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(session.get_state().await.runtime.read_only);

        let rejected = session.enqueue_query("again").await;
        assert!(matches!(rejected, Err(HostError::ReadOnly { .. })));
    }

    #[test]
    fn reconcile_echo_rewrites_matching_block_id() {
        let mut kind = user_message_block("hello there");
        let optimistic = BlockId::from("client-generated-1");
        if let SessionEventKind::BlockUpsert { block } = &mut kind {
            if let BlockPayload::UserMessage { content } = &block.payload {
                if content == "hello there" {
                    block.id = optimistic.clone();
                }
            }
        }
        match kind {
            SessionEventKind::BlockUpsert { block } => assert_eq!(block.id, optimistic),
            _ => unreachable!(),
        }
    }
}
