use std::path::PathBuf;

use crate::api::QueueMessage;
use crate::process::TaskProcess;

/// Worker-local state of one task. A slot is created when a message is read
/// and released once its output has been uploaded and the message deleted
/// (or on the cleanup path). The `Option` fields are cleared as each
/// resource is handed off or torn down, so cleanup never double-frees.
pub(crate) struct TaskSlot {
    pub(crate) msg: Option<QueueMessage>,
    pub(crate) script_name: String,
    pub(crate) id: u64,
    pub(crate) process: Option<TaskProcess>,
    pub(crate) outdir: Option<PathBuf>,
    pub(crate) retcode: Option<i32>,
}

impl TaskSlot {
    pub(crate) fn is_running(&self) -> bool {
        self.process.is_some()
    }
}
