use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::context::CommandContext;
use crate::error::CommandError;
use crate::io::CommandIo;

/// How a child process run ended.
#[derive(Debug)]
pub enum ChildExit {
    Exited(ExitStatus),
    /// The context expired and the child was killed.
    Cancelled,
}

/// Run `command`, streaming stdout and stderr to `io` as they arrive.
///
/// With `forward_input`, lines read from `io` are written to the child's
/// stdin and end of stream on `io` closes it.
pub async fn run_child(
    io: &mut CommandIo,
    ctx: &CommandContext,
    mut command: Command,
    forward_input: bool,
) -> Result<ChildExit, CommandError> {
    command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if forward_input {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);

    let program = command.as_std().get_program().to_string_lossy().into_owned();
    let mut child = command
        .spawn()
        .map_err(|err| CommandError::failed(format!("failed to start {program}: {err}")))?;
    debug!(program = %program, pid = ?child.id(), "child started");

    let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(CommandError::failed("child pipes unavailable"));
    };
    let mut stdin = child.stdin.take();

    let mut out_buf = [0u8; 4096];
    let mut err_buf = [0u8; 4096];
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                kill(&mut child, &program).await;
                return Ok(ChildExit::Cancelled);
            }
            read = stdout.read(&mut out_buf), if out_open => match read {
                Ok(0) | Err(_) => out_open = false,
                Ok(n) => io.write_all(&out_buf[..n]).await?,
            },
            read = stderr.read(&mut err_buf), if err_open => match read {
                Ok(0) | Err(_) => err_open = false,
                Ok(n) => io.write_all(&err_buf[..n]).await?,
            },
            line = io.read_line(), if stdin.is_some() => match line {
                Ok(Some(line)) => {
                    if let Some(pipe) = stdin.as_mut() {
                        let mut payload = line.into_bytes();
                        payload.push(b'\n');
                        if pipe.write_all(&payload).await.is_err() {
                            stdin = None;
                        }
                    }
                }
                Ok(None) | Err(_) => stdin = None,
            },
        }
    }
    drop(stdin);

    tokio::select! {
        biased;
        _ = ctx.cancelled() => {
            kill(&mut child, &program).await;
            Ok(ChildExit::Cancelled)
        }
        status = child.wait() => Ok(ChildExit::Exited(status?)),
    }
}

async fn kill(child: &mut tokio::process::Child, program: &str) {
    if let Err(err) = child.kill().await {
        warn!(program = %program, error = %err, "failed to kill child");
    } else {
        debug!(program = %program, "child killed on cancellation");
    }
}

/// One-line summary of a finished child, as shown after its output.
pub fn describe_exit(exit: &ChildExit) -> String {
    match exit {
        ChildExit::Exited(status) if status.success() => "Command completed successfully".to_string(),
        ChildExit::Exited(status) => match status.code() {
            Some(code) => format!("Command failed with exit code: {code}"),
            None => format!("Command terminated: {status}"),
        },
        ChildExit::Cancelled => "Command cancelled before completion".to_string(),
    }
}
