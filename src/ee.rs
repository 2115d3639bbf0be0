//! Execution-environment supervisor (spec §4.3).
//!
//! `ExecutionEnvironment` owns the `EeStatus` state machine for one
//! session's sandbox/workspace, drives `EEDriver` lifecycle calls, and
//! restarts on failure with jittered exponential backoff (SPEC_FULL.md
//! §C.2), grounded in the teacher's `Effect::ScheduleRetry` / `retry_delay`
//! (`state_machine/transition.rs`) — the same backoff idea applied to
//! process restarts instead of LLM-request retries.

use crate::config::HostConfig;
use crate::error::{EeError, EeResult};
use crate::model::session::{EeLastError, EeStatus, ExecutionEnvironmentState};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

const BACKOFF_BASE: Duration = Duration::from_millis(200);
const BACKOFF_FACTOR: u32 = 2;
const BACKOFF_CAP: Duration = Duration::from_secs(5);
const BACKOFF_JITTER: f64 = 0.2;

/// Spec §4.3: health checks only flip the EE to `error` after this many
/// *consecutive* failed probes, not on the first blip.
const HEALTH_CHECK_FAILURE_THRESHOLD: u32 = 3;

/// Handle to a provisioned sandbox/workspace, returned by `EEDriver::create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EeHandle {
    pub id: String,
    pub workspace_dir: std::path::PathBuf,
}

/// SPEC_FULL.md §C.4: whether `EEDriver::terminate` stopped the sandbox by
/// asking nicely or had to force-kill it, so callers can tell "unloaded
/// cleanly" from "runner had to be killed."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    Clean,
    Forced,
}

/// Vendor-agnostic sandbox lifecycle contract (spec §4.3). Left
/// unimplemented by this crate: concrete drivers (container pool,
/// local-directory, firecracker VM, ...) are supplied by the embedder.
#[async_trait]
pub trait EEDriver: Send + Sync {
    async fn create(&self) -> EeResult<EeHandle>;
    async fn health_check(&self, handle: &EeHandle) -> EeResult<()>;
    async fn terminate(&self, handle: &EeHandle) -> EeResult<TerminationOutcome>;
}

#[async_trait]
impl<T: EEDriver + ?Sized> EEDriver for Arc<T> {
    async fn create(&self) -> EeResult<EeHandle> {
        (**self).create().await
    }

    async fn health_check(&self, handle: &EeHandle) -> EeResult<()> {
        (**self).health_check(handle).await
    }

    async fn terminate(&self, handle: &EeHandle) -> EeResult<TerminationOutcome> {
        (**self).terminate(handle).await
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_FACTOR.saturating_pow(attempt.saturating_sub(1));
    let raw = BACKOFF_BASE.saturating_mul(exp).min(BACKOFF_CAP);
    let jitter_range = (raw.as_secs_f64() * BACKOFF_JITTER).max(0.0);
    let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
    Duration::from_secs_f64((raw.as_secs_f64() + jitter).max(0.0))
}

/// Drives one session's EE lifecycle: `inactive -> starting -> ready`, with
/// `error -> starting` restarts bounded by `HostConfig::max_restarts` and
/// `terminated` as the only hard-dead end (invariant 7).
pub struct ExecutionEnvironment<D: EEDriver> {
    driver: D,
    config: HostConfig,
    state: Mutex<ExecutionEnvironmentState>,
    handle: Mutex<Option<EeHandle>>,
    consecutive_health_failures: AtomicU32,
}

impl<D: EEDriver> ExecutionEnvironment<D> {
    pub fn new(driver: D, config: HostConfig) -> Self {
        Self {
            driver,
            config,
            state: Mutex::new(ExecutionEnvironmentState::default()),
            handle: Mutex::new(None),
            consecutive_health_failures: AtomicU32::new(0),
        }
    }

    pub async fn snapshot(&self) -> ExecutionEnvironmentState {
        self.state.lock().await.clone()
    }

    pub async fn current_handle(&self) -> Option<EeHandle> {
        self.handle.lock().await.clone()
    }

    async fn transition(&self, next: EeStatus) {
        let mut state = self.state.lock().await;
        debug_assert!(
            state.status.can_transition_to(next),
            "illegal EE transition {:?} -> {:?}",
            state.status,
            next
        );
        state.status = next;
    }

    /// Bring the EE up from `inactive`, retrying through `error` with
    /// backoff until `ready`, `max_restarts` is exhausted, or the driver
    /// fails in a way that leaves it `terminated`.
    pub async fn start(&self) -> EeResult<EeHandle> {
        self.transition(EeStatus::Starting).await;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.driver.create().await {
                Ok(handle) => {
                    *self.handle.lock().await = Some(handle.clone());
                    let mut state = self.state.lock().await;
                    state.status = EeStatus::Ready;
                    state.id = Some(handle.id.clone());
                    state.status_message = None;
                    drop(state);
                    info!(ee_id = %handle.id, attempt, "execution environment ready");
                    return Ok(handle);
                }
                Err(e) => {
                    let mut state = self.state.lock().await;
                    state.status = EeStatus::Error;
                    state.last_error = Some(EeLastError {
                        message: e.to_string(),
                        code: None,
                        timestamp: Utc::now(),
                    });
                    drop(state);

                    if attempt > self.config.max_restarts {
                        self.transition(EeStatus::Terminated).await;
                        return Err(EeError::Unavailable {
                            attempts: attempt,
                            source: Box::new(crate::error::RunnerError::Protocol(e.to_string())),
                        });
                    }

                    self.state.lock().await.restart_count += 1;

                    let delay = backoff_delay(attempt);
                    warn!(attempt, ?delay, error = %e, "execution environment create failed, retrying");
                    tokio::time::sleep(delay).await;
                    self.transition(EeStatus::Starting).await;
                }
            }
        }
    }

    /// Probe health; only flips to `error` (and counts as a restart) after
    /// `HEALTH_CHECK_FAILURE_THRESHOLD` consecutive failures (spec §4.3) —
    /// a single transient probe failure just gets logged. Does nothing if
    /// health checks are disabled.
    pub async fn health_check(&self) -> EeResult<()> {
        if !self.config.health_checks_enabled() {
            return Ok(());
        }
        let Some(handle) = self.current_handle().await else {
            return Ok(());
        };
        match self.driver.health_check(&handle).await {
            Ok(()) => {
                self.consecutive_health_failures.store(0, Ordering::SeqCst);
                let mut state = self.state.lock().await;
                state.last_health_check = Some(Utc::now());
                Ok(())
            }
            Err(e) => {
                let failures = self.consecutive_health_failures.fetch_add(1, Ordering::SeqCst) + 1;
                let mut state = self.state.lock().await;
                state.last_health_check = Some(Utc::now());
                state.last_error = Some(EeLastError {
                    message: e.to_string(),
                    code: None,
                    timestamp: Utc::now(),
                });
                if failures >= HEALTH_CHECK_FAILURE_THRESHOLD {
                    state.status = EeStatus::Error;
                    state.restart_count += 1;
                    warn!(failures, "execution environment failed health check threshold");
                } else {
                    warn!(failures, error = %e, "execution environment health check failed, below threshold");
                }
                Err(e)
            }
        }
    }

    pub async fn terminate(&self) -> EeResult<()> {
        if let Some(handle) = self.handle.lock().await.take() {
            let ee_id = handle.id.clone();
            if self.driver.terminate(&handle).await? == TerminationOutcome::Forced {
                let mut state = self.state.lock().await;
                state.last_error = Some(EeLastError {
                    message: "execution environment did not stop cleanly and was force-killed".into(),
                    code: None,
                    timestamp: Utc::now(),
                });
                warn!(%ee_id, "execution environment force-killed on terminate");
            }
        }
        self.transition(EeStatus::Terminated).await;
        Ok(())
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod testing {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Driver that fails `create` a fixed number of times before
    /// succeeding, for exercising the restart/backoff path without a
    /// real sandbox.
    pub struct FlakyDriver {
        fail_times: u32,
        attempts: AtomicU32,
    }

    impl FlakyDriver {
        pub fn new(fail_times: u32) -> Self {
            Self {
                fail_times,
                attempts: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl EEDriver for FlakyDriver {
        async fn create(&self) -> EeResult<EeHandle> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_times {
                return Err(EeError::HealthCheck("simulated create failure".into()));
            }
            Ok(EeHandle {
                id: format!("ee-{n}"),
                workspace_dir: std::path::PathBuf::from("/tmp/ee"),
            })
        }

        async fn health_check(&self, _handle: &EeHandle) -> EeResult<()> {
            Ok(())
        }

        async fn terminate(&self, _handle: &EeHandle) -> EeResult<TerminationOutcome> {
            Ok(TerminationOutcome::Clean)
        }
    }

    /// Driver whose `health_check` always fails, for exercising the
    /// consecutive-failure threshold.
    pub struct AlwaysUnhealthyDriver;

    #[async_trait]
    impl EEDriver for AlwaysUnhealthyDriver {
        async fn create(&self) -> EeResult<EeHandle> {
            Ok(EeHandle {
                id: "ee-1".into(),
                workspace_dir: std::path::PathBuf::from("/tmp/ee"),
            })
        }

        async fn health_check(&self, _handle: &EeHandle) -> EeResult<()> {
            Err(EeError::HealthCheck("simulated probe failure".into()))
        }

        async fn terminate(&self, _handle: &EeHandle) -> EeResult<TerminationOutcome> {
            Ok(TerminationOutcome::Clean)
        }
    }

    /// Driver whose `terminate` always has to force-kill, for exercising
    /// §C.4's clean-vs-forced bookkeeping.
    pub struct NeverStopsCleanlyDriver;

    #[async_trait]
    impl EEDriver for NeverStopsCleanlyDriver {
        async fn create(&self) -> EeResult<EeHandle> {
            Ok(EeHandle {
                id: "ee-1".into(),
                workspace_dir: std::path::PathBuf::from("/tmp/ee"),
            })
        }

        async fn health_check(&self, _handle: &EeHandle) -> EeResult<()> {
            Ok(())
        }

        async fn terminate(&self, _handle: &EeHandle) -> EeResult<TerminationOutcome> {
            Ok(TerminationOutcome::Forced)
        }
    }
}
