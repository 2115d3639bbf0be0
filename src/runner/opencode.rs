//! OpenCode `Runner`: drives the `opencode` CLI in its JSON event-stream
//! mode. Shape mirrors `claude_sdk.rs`; the two runners differ only in
//! how the vendor CLI is invoked, not in how stdout is consumed.

use super::process::ManagedProcess;
use super::{MessageSink, Runner};
use crate::error::{RunnerError, RunnerResult};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub struct OpencodeRunner {
    cli_path: String,
    workspace_dir: PathBuf,
    current: Mutex<Option<Arc<ManagedProcess>>>,
}

impl OpencodeRunner {
    pub fn new(cli_path: impl Into<String>, workspace_dir: PathBuf) -> Self {
        Self {
            cli_path: cli_path.into(),
            workspace_dir,
            current: Mutex::new(None),
        }
    }

    fn build_args(prompt: &str, session_options: &Value) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            prompt.to_string(),
            "--print-logs".to_string(),
            "--format".to_string(),
            "json".to_string(),
        ];
        if let Some(session_id) = session_options.get("sessionId").and_then(Value::as_str) {
            args.push("--session".to_string());
            args.push(session_id.to_string());
        }
        if let Some(model) = session_options.get("model").and_then(Value::as_str) {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        args
    }
}

#[async_trait]
impl Runner for OpencodeRunner {
    async fn run_query(&self, prompt: &str, session_options: &Value, mut sink: MessageSink) -> RunnerResult<()> {
        let args = Self::build_args(prompt, session_options);
        let proc = Arc::new(ManagedProcess::spawn(&self.cli_path, &args, &self.workspace_dir)?);
        *self.current.lock().await = Some(proc.clone());

        let mut lines = proc
            .take_stdout_lines()
            .await
            .ok_or_else(|| RunnerError::Protocol("runner stdout unavailable".into()))?;

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(&line) {
                        Ok(value) => sink(value),
                        Err(e) => warn!(error = %e, "opencode runner produced unparseable line"),
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(RunnerError::Io(e)),
            }
        }

        let status = proc.wait().await?;
        *self.current.lock().await = None;
        debug!(exit_status = ?status, "opencode runner exited");

        if status.success() {
            Ok(())
        } else {
            match status.code() {
                Some(code) => Err(RunnerError::NonZeroExit(code)),
                None => Err(RunnerError::Signaled),
            }
        }
    }

    async fn cancel(&self) {
        if let Some(proc) = self.current.lock().await.as_ref() {
            proc.cancel();
        }
    }

    async fn force_kill(&self) {
        if let Some(proc) = self.current.lock().await.as_ref() {
            proc.force_kill();
        }
    }
}
