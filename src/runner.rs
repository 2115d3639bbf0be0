//! `Runner` — the per-query adapter contract (spec §4.4).
//!
//! Runners are stateless w.r.t. conversation: they shell out to a vendor
//! SDK process and hand back its raw messages in order, nothing more.
//! Grounded on the teacher's `tools::bash::BashTool` for the
//! spawn/process-group/timeout/kill shape, generalized from "run one shell
//! command to completion" to "stream a long-lived subprocess's stdout
//! until it ends or is canceled."

pub mod claude_sdk;
pub mod opencode;
pub mod process;

use crate::error::RunnerResult;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Sink a runner writes raw vendor messages into, in order (spec §4.4).
/// A thin alias over an async callback so `Runner` stays object-safe
/// without an associated stream type.
pub type MessageSink = Box<dyn FnMut(Value) + Send>;

#[async_trait]
pub trait Runner: Send + Sync {
    /// Drive one query to completion, calling `sink` for every raw message
    /// as it arrives. Returns once the vendor process ends cleanly, fails,
    /// or is canceled.
    async fn run_query(&self, prompt: &str, session_options: &Value, sink: MessageSink) -> RunnerResult<()>;

    /// Best-effort cancellation; should cause an in-flight `run_query` to
    /// return promptly. `Session` gives a runner `HostConfig::hard_cancel_timeout`
    /// to honor this before escalating to [`Runner::force_kill`].
    async fn cancel(&self);

    /// Last-resort termination after `cancel()` is ignored past
    /// `HostConfig::hard_cancel_timeout`. Default forwards to `cancel()`
    /// for runners with nothing sharper to reach for; process-backed
    /// runners override this to send SIGKILL instead of SIGTERM.
    async fn force_kill(&self) {
        self.cancel().await;
    }
}

#[async_trait]
impl<T: Runner + ?Sized> Runner for Arc<T> {
    async fn run_query(&self, prompt: &str, session_options: &Value, sink: MessageSink) -> RunnerResult<()> {
        (**self).run_query(prompt, session_options, sink).await
    }

    async fn cancel(&self) {
        (**self).cancel().await;
    }

    async fn force_kill(&self) {
        (**self).force_kill().await;
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod testing {
    use super::*;
    use tokio::sync::Mutex;

    /// A runner that replays a fixed script of raw messages, for
    /// `Session`/`EventBus` tests that don't need a real subprocess.
    /// Grounded on `runtime::testing::MockLlmClient`'s "canned response
    /// queue behind a mutex" shape.
    pub struct ScriptedRunner {
        script: Mutex<Vec<Value>>,
        canceled: std::sync::atomic::AtomicBool,
    }

    impl ScriptedRunner {
        pub fn new(script: Vec<Value>) -> Self {
            Self {
                script: Mutex::new(script),
                canceled: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Runner for ScriptedRunner {
        async fn run_query(
            &self,
            _prompt: &str,
            _session_options: &Value,
            mut sink: MessageSink,
        ) -> RunnerResult<()> {
            let messages = {
                let mut script = self.script.lock().await;
                std::mem::take(&mut *script)
            };
            for msg in messages {
                if self.canceled.load(std::sync::atomic::Ordering::SeqCst) {
                    break;
                }
                sink(msg);
            }
            Ok(())
        }

        async fn cancel(&self) {
            self.canceled.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    /// A runner whose `run_query` never returns on its own, for exercising
    /// `Session`'s deadline/`hard_cancel_timeout` escalation. Constructed
    /// with `honors_cancel`: when `true`, `cancel()` makes `run_query`
    /// return; when `false`, only `force_kill()` does.
    pub struct HangingRunner {
        honors_cancel: bool,
        canceled: std::sync::atomic::AtomicBool,
        force_killed: std::sync::atomic::AtomicBool,
        notify: tokio::sync::Notify,
    }

    impl HangingRunner {
        pub fn new(honors_cancel: bool) -> Self {
            Self {
                honors_cancel,
                canceled: std::sync::atomic::AtomicBool::new(false),
                force_killed: std::sync::atomic::AtomicBool::new(false),
                notify: tokio::sync::Notify::new(),
            }
        }

        pub fn was_force_killed(&self) -> bool {
            self.force_killed.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Runner for HangingRunner {
        async fn run_query(&self, _prompt: &str, _session_options: &Value, _sink: MessageSink) -> RunnerResult<()> {
            loop {
                self.notify.notified().await;
                if self.canceled.load(std::sync::atomic::Ordering::SeqCst)
                    || self.force_killed.load(std::sync::atomic::Ordering::SeqCst)
                {
                    return Ok(());
                }
            }
        }

        async fn cancel(&self) {
            if self.honors_cancel {
                self.canceled.store(true, std::sync::atomic::Ordering::SeqCst);
                self.notify.notify_one();
            }
        }

        async fn force_kill(&self) {
            self.force_killed.store(true, std::sync::atomic::Ordering::SeqCst);
            self.notify.notify_one();
        }
    }
}
