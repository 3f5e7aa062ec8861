#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Worker node engine: the two-slot cooperative task loop that pulls render
//! tasks from the work queue, runs them as subprocesses, uploads their
//! output and acknowledges the queue only once the upload has landed.

pub mod api;
mod node;
mod process;
mod slot;
mod uploader;

pub use api::{
    Done, NodeConfig, ObjectStore, QueueMessage, WorkQueue, read_done_marker, write_done_marker,
};
pub use node::NodeRuntime;
