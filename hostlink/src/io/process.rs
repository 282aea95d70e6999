//! Long-running child processes with bounded stderr capture and exit notification.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What is known about a child once it has exited.
#[derive(Debug)]
pub struct ProcessExit {
    pub status: Option<ExitStatus>,
    pub stderr: String,
    pub stderr_truncated: usize,
}

pub type ExitCallback = Box<dyn FnOnce(ProcessExit) + Send>;

/// A spawned child watched by a background waiter thread.
#[derive(Debug, Clone)]
pub struct ManagedProcess {
    id: u32,
    child: Arc<Mutex<Child>>,
    exited: Arc<AtomicBool>,
}

impl ManagedProcess {
    /// Spawn `cmd` with piped stderr. `on_exit` runs once on the waiter thread
    /// after the process exits and its stderr has been drained.
    #[instrument(skip_all, fields(stderr_limit_bytes))]
    pub fn spawn(mut cmd: Command, stderr_limit_bytes: usize, on_exit: ExitCallback) -> Result<Self> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        debug!("spawning child process");
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                error!(err = %e, "failed to spawn command");
                return Err(e).context("spawn command");
            }
        };
        let id = child.id();
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;
        let stderr_handle = thread::spawn(move || read_stream_limited(stderr, stderr_limit_bytes));

        let child = Arc::new(Mutex::new(child));
        let exited = Arc::new(AtomicBool::new(false));
        let waiter_child = Arc::clone(&child);
        let waiter_exited = Arc::clone(&exited);
        thread::Builder::new()
            .name(format!("hostlink-wait-{id}"))
            .spawn(move || {
                let status = wait_for_exit(&waiter_child);
                waiter_exited.store(true, Ordering::Release);
                let (stderr, stderr_truncated) = match stderr_handle.join() {
                    Ok(Ok(output)) => output,
                    Ok(Err(err)) => {
                        warn!(err = %err, "failed to read child stderr");
                        (Vec::new(), 0)
                    }
                    Err(_) => {
                        warn!("stderr reader thread panicked");
                        (Vec::new(), 0)
                    }
                };
                if stderr_truncated > 0 {
                    warn!(stderr_truncated, "child stderr truncated");
                }
                debug!(pid = id, exit_code = ?status.and_then(|s| s.code()), "child exited");
                on_exit(ProcessExit {
                    status,
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                    stderr_truncated,
                });
            })
            .context("spawn waiter thread")?;

        Ok(Self { id, child, exited })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Kill the child if it is still running.
    pub fn terminate(&self) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        let mut child = self
            .child
            .lock()
            .map_err(|_| anyhow!("child state poisoned"))?;
        if child.try_wait().context("poll child")?.is_some() {
            return Ok(());
        }
        debug!(pid = self.id, "killing child");
        child.kill().context("kill child")
    }
}

fn wait_for_exit(child: &Mutex<Child>) -> Option<ExitStatus> {
    loop {
        let polled = match child.lock() {
            Ok(mut child) => child.wait_timeout(EXIT_POLL_INTERVAL),
            Err(_) => return None,
        };
        match polled {
            Ok(Some(status)) => return Some(status),
            Ok(None) => thread::yield_now(),
            Err(err) => {
                warn!(err = %err, "waiting for child failed");
                return None;
            }
        }
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn shell(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn spawn_and_wait(script: &str, limit: usize) -> ProcessExit {
        let (tx, rx) = mpsc::channel();
        let process = ManagedProcess::spawn(
            shell(script),
            limit,
            Box::new(move |exit| {
                let _ = tx.send(exit);
            }),
        )
        .expect("spawn");
        let exit = rx.recv_timeout(Duration::from_secs(10)).expect("exit");
        assert!(process.has_exited());
        exit
    }

    #[test]
    fn reports_stderr_and_status_on_exit() {
        let exit = spawn_and_wait("echo boom >&2; exit 3", 1024);
        assert_eq!(exit.stderr, "boom\n");
        assert_eq!(exit.status.and_then(|s| s.code()), Some(3));
        assert_eq!(exit.stderr_truncated, 0);
    }

    #[test]
    fn stderr_is_bounded() {
        let exit = spawn_and_wait("printf abcdef >&2", 2);
        assert_eq!(exit.stderr, "ab");
        assert_eq!(exit.stderr_truncated, 4);
    }

    #[test]
    fn terminate_kills_running_child() {
        let (tx, rx) = mpsc::channel();
        let process = ManagedProcess::spawn(
            shell("exec sleep 30"),
            1024,
            Box::new(move |exit| {
                let _ = tx.send(exit);
            }),
        )
        .expect("spawn");
        process.terminate().expect("terminate");
        let exit = rx.recv_timeout(Duration::from_secs(10)).expect("exit");
        assert!(exit.status.is_some_and(|s| !s.success()));
        process.terminate().expect("terminate again");
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        let err = ManagedProcess::spawn(
            Command::new("hostlink-definitely-missing-binary"),
            16,
            Box::new(|_| {}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("spawn command"));
    }
}
