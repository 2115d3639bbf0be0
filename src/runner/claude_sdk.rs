//! Claude-SDK `Runner`: shells out to the Claude Code CLI in
//! stream-json mode and forwards its stdout lines as raw messages.

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

pub struct ClaudeSdkRunner {
    cli_path: String,
    workspace_dir: PathBuf,
    current: Mutex<Option<Arc<ManagedProcess>>>,
}

impl ClaudeSdkRunner {
    pub fn new(cli_path: impl Into<String>, workspace_dir: PathBuf) -> Self {
        Self {
            cli_path: cli_path.into(),
            workspace_dir,
            current: Mutex::new(None),
        }
    }

    fn build_args(prompt: &str, session_options: &Value) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            prompt.to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--include-partial-messages".to_string(),
            "--verbose".to_string(),
        ];
        if let Some(model) = session_options.get("model").and_then(Value::as_str) {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        if let Some(resume) = session_options.get("resumeSessionId").and_then(Value::as_str) {
            args.push("--resume".to_string());
            args.push(resume.to_string());
        }
        args
    }
}

#[async_trait]
impl Runner for ClaudeSdkRunner {
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
                        Err(e) => warn!(error = %e, "claude-sdk runner produced unparseable line"),
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(RunnerError::Io(e)),
            }
        }

        let status = proc.wait().await?;
        *self.current.lock().await = None;
        debug!(exit_status = ?status, "claude-sdk runner exited");

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
