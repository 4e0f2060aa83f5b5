// Subprocess plumbing shared by the decoder supervisor, the audio splitter,
// and the whisper back-end.
//
// Cancellation is two-phase: the child first gets an interrupt so it can
// flush buffers and finalize its output, and only gets killed once the
// graceful-shutdown grace period has elapsed.

use std::process::{ExitStatus, Output, Stdio};

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::DEFAULT_GRACEFUL_SHUTDOWN;

/// The result of running a command under a cancellation token.
#[derive(Debug)]
pub(crate) enum CommandOutcome {
    Completed(Output),
    /// The token fired and the command died before completing normally.
    Cancelled,
}

/// Send SIGINT to a running child process.
pub(crate) fn interrupt(child: &Child) {
    if let Some(pid) = child.id() {
        // SAFETY: sending a signal to a pid we just spawned.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGINT);
        }
    }
}

/// Wait for the child, interrupting it when the token fires and killing it
/// outright if it ignores the interrupt for too long.
pub(crate) async fn wait_with_graceful_shutdown(
    child: &mut Child,
    token: &CancellationToken,
) -> std::io::Result<ExitStatus> {
    tokio::select! {
        status = child.wait() => status,
        _ = token.cancelled() => {
            interrupt(child);
            match timeout(DEFAULT_GRACEFUL_SHUTDOWN, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    log::warn!("subprocess ignored the interrupt, killing it");
                    child.start_kill()?;
                    child.wait().await
                }
            }
        }
    }
}

/// Run a command to completion, capturing stdout and stderr.
///
/// On cancellation the child is interrupted (then killed) and
/// [`CommandOutcome::Cancelled`] is returned instead of an error.
pub(crate) async fn run_command(
    mut cmd: Command,
    token: &CancellationToken,
) -> Result<CommandOutcome> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("unable to start {:?}", cmd.as_std().get_program()))?;

    let mut stdout_pipe = child.stdout.take().context("stdout wasn't piped")?;
    let mut stderr_pipe = child.stderr.take().context("stderr wasn't piped")?;

    let stdout_task = tokio::spawn(async move {
        let mut buffer = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buffer).await;
        buffer
    });
    let stderr_task = tokio::spawn(async move {
        let mut buffer = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buffer).await;
        buffer
    });

    let status = wait_with_graceful_shutdown(&mut child, token).await?;
    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    if token.is_cancelled() && !status.success() {
        return Ok(CommandOutcome::Cancelled);
    }

    Ok(CommandOutcome::Completed(Output {
        status,
        stdout,
        stderr,
    }))
}
