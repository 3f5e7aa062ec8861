//! Public types and the driver traits the task loop is written against.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use brenda_core::config::Config;
use brenda_core::error::TaskError;
use brenda_core::fsutil;
use brenda_core::retry::RetryPolicy;

/// One received work item: the task script plus the opaque receipt used to
/// extend, return or delete it.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Raw task script text, starting with a shebang.
    pub body: String,
    /// String message attributes; `script_name` is the one the node needs.
    pub attributes: HashMap<String, String>,
    /// Receipt handle identifying this delivery to the queue.
    pub receipt: String,
}

impl QueueMessage {
    pub fn script_name(&self) -> Result<&str, TaskError> {
        self.attributes
            .get("script_name")
            .map(String::as_str)
            .ok_or_else(|| TaskError::fatal_msg("queue message has no script_name attribute"))
    }
}

/// The work queue operations the task loop needs. Returning a message to the
/// queue is `extend(receipt, 0)`.
pub trait WorkQueue: Send + Sync {
    /// Short-poll for one message; `None` when the queue is empty.
    fn receive(&self) -> impl Future<Output = Result<Option<QueueMessage>, TaskError>> + Send;

    /// Reset the message's visibility timer to `seconds` from now.
    fn extend(&self, receipt: &str, seconds: u32)
    -> impl Future<Output = Result<(), TaskError>> + Send;

    /// Final acknowledgement; the message is gone after this.
    fn delete(&self, receipt: &str) -> impl Future<Output = Result<(), TaskError>> + Send;
}

/// Where finished frames go. Uploads are idempotent: re-uploading a name
/// overwrites the same object.
pub trait ObjectStore: Send + Sync + 'static {
    fn upload(&self, local_path: &Path, name: &str)
    -> impl Future<Output = Result<(), TaskError>> + Send;

    /// Display URL of the object `name` would land at, for logging.
    fn object_url(&self, name: &str) -> String;
}

/// What the node does once the queue has drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Done {
    /// Exit the worker process.
    Exit,
    /// Shut the host down (cancelling our spot request first).
    Shutdown,
    /// Keep polling for new work.
    Poll,
}

impl Done {
    /// Resolve the post-drain behaviour at startup: the `--shutdown` flag
    /// wins, then an explicit `DONE` key, then the `SHUTDOWN` flag.
    pub fn resolve(conf: &Config, shutdown_flag: bool) -> Result<Self, TaskError> {
        if shutdown_flag {
            return Ok(Self::Shutdown);
        }
        if let Some(raw) = conf.get("DONE") {
            return raw.parse();
        }
        if conf.get_flag_or("SHUTDOWN", false) {
            Ok(Self::Shutdown)
        } else {
            Ok(Self::Exit)
        }
    }
}

impl FromStr for Done {
    type Err = TaskError;

    fn from_str(raw: &str) -> Result<Self, TaskError> {
        match raw {
            "exit" => Ok(Self::Exit),
            "shutdown" => Ok(Self::Shutdown),
            "poll" => Ok(Self::Poll),
            other => Err(TaskError::fatal_msg(format!(
                "DONE must be one of exit, shutdown, poll (got {other:?})"
            ))),
        }
    }
}

impl fmt::Display for Done {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Exit => "exit",
            Self::Shutdown => "shutdown",
            Self::Poll => "poll",
        })
    }
}

/// Persist the chosen post-drain behaviour to `$WORK_DIR/DONE`.
pub fn write_done_marker(work_dir: &Path, done: Done) -> Result<(), TaskError> {
    fsutil::write_atomic(&work_dir.join("DONE"), &format!("{done}\n")).map_err(TaskError::fatal)
}

/// Read the marker back. A missing or unreadable file means `exit`; a
/// malformed value is a configuration error.
pub fn read_done_marker(work_dir: &Path) -> Result<Done, TaskError> {
    match std::fs::read_to_string(work_dir.join("DONE")) {
        Ok(raw) => raw.lines().next().unwrap_or("").trim().parse(),
        Err(_) => Ok(Done::Exit),
    }
}

/// Tunables for the task loop.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Scratch directory holding per-task outdirs, the DONE marker and the
    /// accounting files.
    pub work_dir: PathBuf,
    /// Queue visibility timeout in seconds; the value re-asserted on every
    /// lease refresh.
    pub visibility_timeout: u32,
    /// Number of wait-phase ticks between lease refreshes.
    pub reassert_after: u32,
    /// Wait-phase tick length.
    pub tick: Duration,
    /// Sleep between queue polls when `DONE == poll` and the queue is empty.
    pub poll_sleep: Duration,
    /// Retry budget shared by the loop and the uploader.
    pub retry: RetryPolicy,
}

impl NodeConfig {
    pub fn from_config(conf: &Config) -> Result<Self, TaskError> {
        Ok(Self {
            work_dir: conf.work_dir().map_err(TaskError::fatal)?,
            visibility_timeout: conf.get_u32_or("VISIBILITY_TIMEOUT", 120),
            reassert_after: conf.get_u32_or("VISIBILITY_TIMEOUT_REASSERT", 30),
            tick: Duration::from_secs(1),
            poll_sleep: Duration::from_secs(15),
            retry: RetryPolicy::from_config(conf),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_round_trips() {
        for done in [Done::Exit, Done::Shutdown, Done::Poll] {
            assert_eq!(done.to_string().parse::<Done>().unwrap(), done);
        }
        assert!("reboot".parse::<Done>().is_err());
    }

    #[test]
    fn done_marker_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        for done in [Done::Exit, Done::Shutdown, Done::Poll] {
            write_done_marker(dir.path(), done).unwrap();
            let raw = std::fs::read_to_string(dir.path().join("DONE")).unwrap();
            assert_eq!(raw, format!("{done}\n"));
            assert_eq!(read_done_marker(dir.path()).unwrap(), done);
        }
    }

    #[test]
    fn missing_marker_reads_as_exit() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_done_marker(dir.path()).unwrap(), Done::Exit);
    }

    #[test]
    fn malformed_marker_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("DONE"), "restart\n").unwrap();
        assert!(read_done_marker(dir.path()).is_err());
    }

    #[test]
    fn resolve_precedence() {
        let mut conf = Config::new();
        assert_eq!(Done::resolve(&conf, false).unwrap(), Done::Exit);
        assert_eq!(Done::resolve(&conf, true).unwrap(), Done::Shutdown);
        conf.set("SHUTDOWN", "1");
        assert_eq!(Done::resolve(&conf, false).unwrap(), Done::Shutdown);
        conf.set("DONE", "poll");
        assert_eq!(Done::resolve(&conf, false).unwrap(), Done::Poll);
        assert_eq!(Done::resolve(&conf, true).unwrap(), Done::Shutdown);
        conf.set("DONE", "never");
        assert!(Done::resolve(&conf, false).is_err());
    }

    #[test]
    fn missing_script_name_is_fatal() {
        let msg = QueueMessage {
            body: "#!/bin/sh\n".to_string(),
            attributes: HashMap::new(),
            receipt: "r-1".to_string(),
        };
        assert!(msg.script_name().is_err());
    }
}
