//! # PTY Manager
//!
//! Owns the interactive shell sessions opened from the server. Each
//! `terminal_open` spawns the user's login shell under a pseudo-terminal
//! sized to the browser's geometry; a reader task streams PTY output
//! back as `terminal_data` frames in ≤ 4 KiB chunks and reports
//! `terminal_close` when the shell exits.
//!
//! Sessions die with the connection: the manager is rebuilt on every
//! reconnect, and `close_all` reaps every child on shutdown.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;
use std::sync::Arc;

use nix::pty::{openpty, Winsize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use burrow_protocol::{to_base64, Frame};

/// PTY output is chunked at this size before framing.
const READ_CHUNK: usize = 4096;

nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, Winsize);

fn winsize(rows: u16, cols: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// The user's shell: `$SHELL`, else bash, else sh.
fn login_shell() -> String {
    if let Ok(shell) = std::env::var("SHELL") {
        if !shell.is_empty() {
            return shell;
        }
    }
    if std::path::Path::new("/bin/bash").exists() {
        return "/bin/bash".to_string();
    }
    "/bin/sh".to_string()
}

struct PtySession {
    /// Write half of the PTY master; keystrokes go here verbatim.
    writer: tokio::fs::File,
    /// Kept for resize ioctls.
    master: OwnedFd,
    reader: JoinHandle<()>,
}

impl PtySession {
    /// Stop the reader; dropping its `Child` kills and reaps the shell
    /// (`kill_on_drop`), and dropping the fds closes the PTY.
    fn terminate(&self) {
        self.reader.abort();
    }
}

pub struct PtyManager {
    sessions: Arc<Mutex<HashMap<String, PtySession>>>,
    outbound: mpsc::UnboundedSender<Frame>,
}

impl PtyManager {
    /// `outbound` is the connection's frame queue; the manager lives as
    /// long as that connection does.
    pub fn new(outbound: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            outbound,
        }
    }

    /// Handle `terminal_open`. A session id collision closes the old
    /// session first. Spawn failures are reported as `terminal_close` so
    /// the server releases the browser, and are never fatal.
    pub async fn open(&self, session_id: String, rows: u16, cols: u16) {
        if let Some(existing) = self.sessions.lock().await.remove(&session_id) {
            warn!(session_id = %session_id, "duplicate terminal session, closing predecessor");
            existing.terminate();
        }

        let (writer, reader_file, master, child) = match spawn_shell(rows, cols) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(session_id = %session_id, "failed to spawn shell: {e}");
                let _ = self.outbound.send(Frame::TerminalClose {
                    session_id,
                });
                return;
            }
        };

        info!(session_id = %session_id, rows, cols, "terminal session opened");

        // Hold the map lock across spawn+insert: the reader's exit path
        // takes the same lock, so even an instantly-exiting shell cannot
        // race past its own registration.
        let mut sessions_guard = self.sessions.lock().await;

        let sessions = self.sessions.clone();
        let outbound = self.outbound.clone();
        let sid = session_id.clone();
        let reader = tokio::spawn(async move {
            let mut reader_file = reader_file;
            let mut child = child;
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match reader_file.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let frame = Frame::TerminalData {
                            session_id: sid.clone(),
                            data_base64: to_base64(&buf[..n]),
                        };
                        if outbound.send(frame).is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = child.wait().await;
            debug!(session_id = %sid, "shell exited");

            // Only an organic exit still has a registered session; a
            // server-initiated close already removed it.
            if sessions.lock().await.remove(&sid).is_some() {
                let _ = outbound.send(Frame::TerminalClose { session_id: sid });
            }
        });

        sessions_guard.insert(
            session_id,
            PtySession {
                writer,
                master,
                reader,
            },
        );
    }

    /// Write inbound terminal bytes to the PTY.
    pub async fn write(&self, session_id: &str, data: &[u8]) {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(session_id) else {
            debug!(session_id = %session_id, "data for unknown terminal session dropped");
            return;
        };
        if session.writer.write_all(data).await.is_err() {
            warn!(session_id = %session_id, "failed to write to pty");
        }
    }

    /// Adjust the PTY window.
    pub async fn resize(&self, session_id: &str, rows: u16, cols: u16) {
        let sessions = self.sessions.lock().await;
        let Some(session) = sessions.get(session_id) else {
            return;
        };
        let size = winsize(rows, cols);
        if let Err(e) = unsafe { tiocswinsz(session.master.as_raw_fd(), &size) } {
            warn!(session_id = %session_id, "pty resize failed: {e}");
        }
    }

    /// Server-initiated close: kill the shell and release resources.
    pub async fn close(&self, session_id: &str) {
        if let Some(session) = self.sessions.lock().await.remove(session_id) {
            info!(session_id = %session_id, "terminal session closed by server");
            session.terminate();
        }
    }

    /// Shutdown path: close every session and tell the server.
    pub async fn close_all(&self) {
        let mut sessions = self.sessions.lock().await;
        for (session_id, session) in sessions.drain() {
            session.terminate();
            let _ = self.outbound.send(Frame::TerminalClose { session_id });
        }
    }
}

type SpawnedShell = (tokio::fs::File, tokio::fs::File, OwnedFd, tokio::process::Child);

/// Allocate a PTY of the requested size and spawn the login shell on its
/// slave side, in its own session with the slave as controlling
/// terminal.
fn spawn_shell(rows: u16, cols: u16) -> std::io::Result<SpawnedShell> {
    let size = winsize(rows, cols);
    let pty = openpty(&size, None).map_err(std::io::Error::from)?;

    let slave_stdin = Stdio::from(pty.slave.try_clone()?);
    let slave_stdout = Stdio::from(pty.slave.try_clone()?);
    let slave_stderr = Stdio::from(pty.slave);

    let mut command = tokio::process::Command::new(login_shell());
    command
        .env("TERM", "xterm-256color")
        .stdin(slave_stdin)
        .stdout(slave_stdout)
        .stderr(slave_stderr)
        .kill_on_drop(true);

    // New session with the PTY slave (wired to stdin) as controlling
    // terminal, so job control works inside the shell.
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command.spawn()?;

    let reader = tokio::fs::File::from_std(std::fs::File::from(pty.master.try_clone()?));
    let writer = tokio::fs::File::from_std(std::fs::File::from(pty.master.try_clone()?));

    Ok((writer, reader, pty.master, child))
}
