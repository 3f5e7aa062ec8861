use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use brenda_core::error::TaskError;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::Child;

/// Sentinel stored in [`UploadTask::code`] while the uploader is running.
pub(crate) const UPLOAD_RUNNING: i32 = i32::MIN;

/// Handle to the in-process uploader task. The task publishes its exit code
/// (0 success, 1 failure) through `code` when it finishes.
pub(crate) struct UploadTask {
    pub(crate) handle: tokio::task::JoinHandle<()>,
    pub(crate) code: Arc<AtomicI32>,
}

/// The two kinds of worker a slot can be driving: an OS child running a task
/// script, or the in-process uploader. The scheduler only ever polls for an
/// exit code or stops them.
pub(crate) enum TaskProcess {
    Render(Child),
    Upload(UploadTask),
}

impl TaskProcess {
    /// Non-blocking exit check; `None` while still running.
    pub(crate) fn poll(&mut self) -> Result<Option<i32>, TaskError> {
        match self {
            Self::Render(child) => match child.try_wait() {
                Ok(status) => Ok(status.map(exit_code)),
                Err(err) => Err(TaskError::transient(anyhow::anyhow!(
                    "polling render subprocess: {err}"
                ))),
            },
            Self::Upload(task) => {
                let code = task.code.load(Ordering::SeqCst);
                Ok((code != UPLOAD_RUNNING).then_some(code))
            }
        }
    }

    /// Request termination and wait for it, returning the exit code.
    pub(crate) async fn stop(&mut self) -> Result<i32, TaskError> {
        match self {
            Self::Render(child) => {
                if let Some(pid) = child.id() {
                    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                }
                let status = child.wait().await.map_err(|err| {
                    TaskError::transient(anyhow::anyhow!("waiting for render subprocess: {err}"))
                })?;
                Ok(exit_code(status))
            }
            Self::Upload(task) => {
                let code = task.code.load(Ordering::SeqCst);
                if code != UPLOAD_RUNNING {
                    return Ok(code);
                }
                task.handle.abort();
                let _ = (&mut task.handle).await;
                let code = task.code.load(Ordering::SeqCst);
                Ok(if code == UPLOAD_RUNNING { 1 } else { code })
            }
        }
    }
}

/// Map an exit status to the shell convention: signal death is 128+signo.
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}
