// src/build/process.rs

//! Subprocess execution for build stages
//!
//! Output of both streams is copied line by line into the build log with a
//! `[stage]` prefix. Cancellation sends SIGTERM and escalates to SIGKILL if
//! the process has not exited after [`TERMINATE_GRACE`].

use super::BuildLog;
use crate::error::{Error, Result};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const TERMINATE_GRACE: Duration = Duration::from_secs(10);

/// Run `command` to completion, streaming its output into `log`
pub async fn run_logged(
    mut command: Command,
    stage: &str,
    log: &BuildLog,
    cancel: &CancellationToken,
) -> Result<()> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("Spawning {:?}", command.as_std());
    let mut child = command
        .spawn()
        .map_err(|e| Error::BuildFailure(format!("failed to spawn {stage}: {e}")))?;

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, tx.clone());
    }
    drop(tx);

    let status = loop {
        tokio::select! {
            Some(line) = rx.recv() => log.append(&format!("[{stage}] {line}")).await?,
            status = child.wait() => break status?,
            _ = cancel.cancelled() => {
                terminate(&mut child).await;
                log.append(&format!("[{stage}] terminated")).await?;
                return Err(Error::Cancelled);
            }
        }
    };

    while let Some(line) = rx.recv().await {
        log.append(&format!("[{stage}] {line}")).await?;
    }
    check_status(stage, status)
}

fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

fn check_status(stage: &str, status: ExitStatus) -> Result<()> {
    if status.success() {
        Ok(())
    } else {
        Err(Error::BuildFailure(format!(
            "{stage} failed with exit code {}",
            status.code().unwrap_or(-1)
        )))
    }
}

/// SIGTERM, then SIGKILL after the grace period
pub async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!("Failed to signal process {}: {}", pid, e);
        }
    }
    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!("Process did not exit after SIGTERM, killing");
            let _ = child.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_success_and_failure() {
        let cancel = CancellationToken::new();
        let log = BuildLog::discard();

        let mut ok = Command::new("sh");
        ok.args(["-c", "echo hello; echo oops >&2"]);
        run_logged(ok, "echo", &log, &cancel).await.unwrap();

        let mut bad = Command::new("sh");
        bad.args(["-c", "exit 3"]);
        let err = run_logged(bad, "exit", &log, &cancel).await.unwrap_err();
        assert!(err.to_string().contains("exit code 3"));
    }

    #[tokio::test]
    async fn test_cancellation_terminates_process() {
        let cancel = CancellationToken::new();
        let log = BuildLog::discard();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let mut slow = Command::new("sleep");
        slow.arg("30");
        let started = std::time::Instant::now();
        let result = run_logged(slow, "sleep", &log, &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_missing_binary_is_build_failure() {
        let result = run_logged(
            Command::new("/nonexistent/binary"),
            "missing",
            &BuildLog::discard(),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(Error::BuildFailure(_))));
    }
}
