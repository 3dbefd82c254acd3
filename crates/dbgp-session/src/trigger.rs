//! The command that makes the debuggee run (an HTTP request, a CLI script).
//!
//! It runs independently of the debug connection: it may exit before the
//! engine connects, while the session is paused, or never. Its exit status
//! and output are recorded for status reporting only.

use std::{path::Path, process::Stdio, sync::Arc};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
};
use tokio_util::sync::CancellationToken;

/// Bytes kept per stream.
pub const MAX_CAPTURE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerStatus {
    pub command: String,
    pub pid: Option<u32>,
    pub running: bool,
    pub exit_code: Option<i32>,
    /// Set when the process was terminated by the session rather than
    /// exiting on its own.
    pub killed: bool,
    pub stdout: String,
    pub stderr: String,
    /// Either stream produced more than [`MAX_CAPTURE_BYTES`].
    pub truncated: bool,
}

#[derive(Debug, Default)]
struct Capture {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

#[derive(Debug)]
pub struct TriggerProcess {
    status: Arc<Mutex<TriggerStatus>>,
    capture: Arc<Mutex<Capture>>,
    kill: CancellationToken,
}

impl TriggerProcess {
    /// Run `command` through the platform shell in `cwd`.
    pub fn spawn(command: &str, cwd: &Path) -> std::io::Result<Self> {
        let mut cmd = shell_command(command);
        cmd.current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let pid = child.id();
        tracing::info!(target = "dbgp.trigger", pid, command, cwd = %cwd.display(), "spawned trigger command");

        let status = Arc::new(Mutex::new(TriggerStatus {
            command: command.to_string(),
            pid,
            running: true,
            ..TriggerStatus::default()
        }));
        let capture = Arc::new(Mutex::new(Capture::default()));
        let kill = CancellationToken::new();

        let stdout = child.stdout.take().map(|out| {
            let capture = capture.clone();
            let status = status.clone();
            tokio::spawn(async move {
                read_bounded(out, &capture, &status, |c| &mut c.stdout).await;
            })
        });
        let stderr = child.stderr.take().map(|err| {
            let capture = capture.clone();
            let status = status.clone();
            tokio::spawn(async move {
                read_bounded(err, &capture, &status, |c| &mut c.stderr).await;
            })
        });

        let task_status = status.clone();
        let task_kill = kill.clone();
        tokio::spawn(async move {
            let (exit, killed) = tokio::select! {
                exit = child.wait() => (exit, false),
                _ = task_kill.cancelled() => {
                    let _ = child.start_kill();
                    (child.wait().await, true)
                }
            };
            // Output readers finish once the pipes close; a killed shell may
            // leave grandchildren holding them, so do not wait on them then.
            if !killed {
                for reader in [stdout, stderr].into_iter().flatten() {
                    let _ = reader.await;
                }
            }

            let exit_code = exit.as_ref().ok().and_then(|status| status.code());
            {
                let mut status = task_status.lock();
                status.running = false;
                status.killed = killed;
                status.exit_code = exit_code;
            }
            match exit {
                Ok(exit) => tracing::info!(target = "dbgp.trigger", ?exit_code, killed, success = exit.success(), "trigger command finished"),
                Err(err) => tracing::warn!(target = "dbgp.trigger", error = %err, "failed to wait for trigger command"),
            }
        });

        Ok(Self {
            status,
            capture,
            kill,
        })
    }

    pub fn status(&self) -> TriggerStatus {
        let mut status = self.status.lock().clone();
        let capture = self.capture.lock();
        status.stdout = String::from_utf8_lossy(&capture.stdout).into_owned();
        status.stderr = String::from_utf8_lossy(&capture.stderr).into_owned();
        status
    }

    pub fn is_running(&self) -> bool {
        self.status.lock().running
    }

    /// Terminate the process if it is still running. Idempotent.
    pub fn kill(&self) {
        self.kill.cancel();
    }
}

impl Drop for TriggerProcess {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

async fn read_bounded(
    mut reader: impl AsyncRead + Unpin,
    capture: &Mutex<Capture>,
    status: &Mutex<TriggerStatus>,
    stream: fn(&mut Capture) -> &mut Vec<u8>,
) {
    let mut buf = [0u8; 8 * 1024];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };

        let mut capture = capture.lock();
        let out = stream(&mut *capture);
        let remaining = MAX_CAPTURE_BYTES.saturating_sub(out.len());
        let to_store = remaining.min(n);
        out.extend_from_slice(&buf[..to_store]);
        if to_store < n {
            status.lock().truncated = true;
        }
    }
}
