//! Shared subprocess plumbing used by both vendor runners.
//!
//! Grounded on the teacher's `tools::bash::BashTool` (process-group setup
//! via `pre_exec`/`setpgid`, `killpg` on cancellation) and on
//! `other_examples/..._process_manager.rs`'s stdout-line-reader task
//! parsing newline-delimited JSON ("stream-json") output.

use crate::error::RunnerError;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// A spawned vendor CLI process plus the machinery to stream its stdout
/// as newline-delimited JSON and to cancel it cleanly.
pub struct ManagedProcess {
    child: Mutex<Option<Child>>,
    pgid: Option<i32>,
}

impl ManagedProcess {
    /// Spawn `program args...` in its own process group, in `working_dir`,
    /// with stdin/stdout/stderr piped.
    pub fn spawn(program: &str, args: &[String], working_dir: &std::path::Path) -> Result<Self, RunnerError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        unsafe {
            use std::os::unix::process::CommandExt;
            cmd.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0)).ok();
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(RunnerError::Spawn)?;
        let pgid = child.id().map(|pid| pid as i32);

        Ok(Self {
            child: Mutex::new(Some(child)),
            pgid,
        })
    }

    /// Take stdout as a line reader. Each line is expected to be one JSON
    /// message (the "stream-json" wire format both vendor CLIs use).
    pub async fn take_stdout_lines(&self) -> Option<tokio::io::Lines<BufReader<tokio::process::ChildStdout>>> {
        let mut guard = self.child.lock().await;
        let stdout = guard.as_mut()?.stdout.take()?;
        Some(BufReader::new(stdout).lines())
    }

    pub async fn write_stdin(&self, data: &[u8]) -> Result<(), RunnerError> {
        use tokio::io::AsyncWriteExt;
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return Err(RunnerError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "process already reaped",
            )));
        };
        let Some(stdin) = child.stdin.as_mut() else {
            return Err(RunnerError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stdin already taken",
            )));
        };
        stdin.write_all(data).await.map_err(RunnerError::Io)?;
        stdin.flush().await.map_err(RunnerError::Io)
    }

    /// Best-effort SIGTERM to the whole process group.
    pub fn cancel(&self) {
        if let Some(pgid) = self.pgid {
            let _ = killpg(Pid::from_raw(pgid), Signal::SIGTERM);
        }
    }

    /// SIGKILL the process group; used when `cancel` did not make the
    /// process exit within `hardCancelTimeout`.
    pub fn force_kill(&self) {
        if let Some(pgid) = self.pgid {
            let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
        }
    }

    /// Wait for the child to exit, consuming it. Returns the exit status.
    pub async fn wait(&self) -> Result<std::process::ExitStatus, RunnerError> {
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return Err(RunnerError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "process already reaped",
            )));
        };
        child.wait().await.map_err(RunnerError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawns_and_reads_stdout_lines() {
        let proc = ManagedProcess::spawn(
            "sh",
            &["-c".to_string(), "echo '{\"type\":\"a\"}'".to_string()],
            std::path::Path::new("."),
        )
        .expect("spawn");
        let mut lines = proc.take_stdout_lines().await.expect("stdout");
        let line = lines.next_line().await.expect("read").expect("some line");
        assert_eq!(line, r#"{"type":"a"}"#);
        let status = proc.wait().await.expect("wait");
        assert!(status.success());
    }

    #[tokio::test]
    async fn cancel_terminates_a_long_running_process() {
        let proc = ManagedProcess::spawn(
            "sh",
            &["-c".to_string(), "sleep 30".to_string()],
            std::path::Path::new("."),
        )
        .expect("spawn");
        proc.cancel();
        let status = proc.wait().await.expect("wait");
        assert!(!status.success());
    }
}
