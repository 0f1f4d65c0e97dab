//! # Shell Executor
//!
//! Runs `exec` commands dispatched over the tunnel: `sh -c <shell>` with
//! combined stdout/stderr, a hard timeout, and bounded output. Dry runs
//! rewrite apt/apt-get invocations to their simulate form and refuse to
//! execute anything else. `reboot` is fire-and-forget.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{error, info, warn};

use burrow_protocol::{to_base64, Frame};

/// Hard wall-clock limit on a single exec.
const EXEC_TIMEOUT: Duration = Duration::from_secs(60);

/// Combined output is truncated at this size.
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Outcome of one exec, before framing.
#[derive(Debug)]
pub struct CommandOutcome {
    pub exit_code: i32,
    pub output: Vec<u8>,
    pub error: Option<String>,
}

impl CommandOutcome {
    /// Frame this outcome as the `command_result` reply.
    pub fn into_frame(self, command_id: String) -> Frame {
        Frame::CommandResult {
            command_id,
            exit_code: self.exit_code,
            output: to_base64(&self.output),
            error: self.error,
        }
    }
}

/// Rewrite an apt/apt-get command line to its simulate form by inserting
/// `-s` after the program token. Returns `None` when the command is not
/// a package-manager invocation (token-bounded match, so `apt-cacher`
/// does not qualify).
fn rewrite_dry_run(shell: &str) -> Option<String> {
    for program in ["apt-get ", "apt "] {
        if let Some(rest) = shell.strip_prefix(program) {
            return Some(format!("{}-s {rest}", program));
        }
    }
    None
}

/// Run `shell` under `sh -c`, honoring the dry-run contract.
pub async fn run_exec(shell: &str, dry_run: bool) -> CommandOutcome {
    let effective = if dry_run {
        match rewrite_dry_run(shell) {
            Some(rewritten) => rewritten,
            None => {
                // Anything that is not a package-manager call is only
                // described, never executed.
                return CommandOutcome {
                    exit_code: 0,
                    output: format!("[dry run] would execute: {shell}").into_bytes(),
                    error: None,
                };
            }
        }
    } else {
        shell.to_string()
    };

    info!(dry_run, "executing shell command");
    execute(&effective).await
}

/// Spawn `sh -c` with merged stdout/stderr and collect up to
/// [`MAX_OUTPUT_BYTES`], enforcing the timeout. The child is killed on
/// timeout; the result reports exit −1 with an error string.
async fn execute(shell: &str) -> CommandOutcome {
    // Brace-group the command so the redirect covers the whole string,
    // not just its last simple command.
    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(format!("{{ {shell}\n}} 2>&1"))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            return CommandOutcome {
                exit_code: -1,
                output: Vec::new(),
                error: Some(format!("failed to spawn shell: {e}")),
            };
        }
    };

    let mut stdout = match child.stdout.take() {
        Some(stdout) => stdout,
        None => {
            return CommandOutcome {
                exit_code: -1,
                output: Vec::new(),
                error: Some("child stdout unavailable".to_string()),
            };
        }
    };

    let collect = async {
        let mut output = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if output.len() < MAX_OUTPUT_BYTES {
                        let take = n.min(MAX_OUTPUT_BYTES - output.len());
                        output.extend_from_slice(&buf[..take]);
                    }
                    // Past the cap we keep draining so the child is not
                    // blocked on a full pipe.
                }
                Err(_) => break,
            }
        }
        let status = child.wait().await;
        (output, status)
    };

    match tokio::time::timeout(EXEC_TIMEOUT, collect).await {
        Ok((output, Ok(status))) => CommandOutcome {
            exit_code: status.code().unwrap_or(-1),
            output,
            error: None,
        },
        Ok((output, Err(e))) => CommandOutcome {
            exit_code: -1,
            output,
            error: Some(format!("failed to wait for child: {e}")),
        },
        Err(_) => CommandOutcome {
            exit_code: -1,
            output: Vec::new(),
            error: Some(format!(
                "command timed out after {}s",
                EXEC_TIMEOUT.as_secs()
            )),
        },
    }
}

/// Best-effort system reboot. Success is only ever observable by the
/// connection dropping, so the outcome is logged and nothing is framed.
pub fn run_reboot() {
    tokio::spawn(async {
        warn!("reboot requested by server");
        match Command::new("sh")
            .arg("-c")
            .arg("reboot")
            .status()
            .await
        {
            Ok(status) if status.success() => info!("reboot command dispatched"),
            Ok(status) => error!("reboot command exited with {status}"),
            Err(e) => error!("failed to run reboot: {e}"),
        }
    });
}
