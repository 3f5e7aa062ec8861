//! End-to-end exercises of the worker task loop against an in-memory queue
//! and object store, with real `/bin/sh` task scripts.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use brenda_core::error::TaskError;
use brenda_core::retry::RetryPolicy;
use brenda_engine::{
    Done, NodeConfig, NodeRuntime, ObjectStore, QueueMessage, WorkQueue, write_done_marker,
};

type EventLog = Arc<Mutex<Vec<String>>>;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueueMessage>,
    inflight: HashMap<String, QueueMessage>,
    extends: Vec<(String, u32)>,
    deleted: Vec<String>,
}

struct FakeQueue {
    state: Mutex<QueueState>,
    log: EventLog,
}

impl FakeQueue {
    fn new(log: EventLog) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            log,
        })
    }

    fn push(&self, msg: QueueMessage) {
        self.state.lock().unwrap().pending.push_back(msg);
    }

    fn pending_len(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    fn inflight_len(&self) -> usize {
        self.state.lock().unwrap().inflight.len()
    }

    fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    fn extends(&self) -> Vec<(String, u32)> {
        self.state.lock().unwrap().extends.clone()
    }
}

impl WorkQueue for Arc<FakeQueue> {
    async fn receive(&self) -> Result<Option<QueueMessage>, TaskError> {
        let mut state = self.state.lock().unwrap();
        match state.pending.pop_front() {
            Some(msg) => {
                state.inflight.insert(msg.receipt.clone(), msg.clone());
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }

    async fn extend(&self, receipt: &str, seconds: u32) -> Result<(), TaskError> {
        let mut state = self.state.lock().unwrap();
        state.extends.push((receipt.to_string(), seconds));
        if seconds == 0 {
            // Immediate return to the queue.
            if let Some(msg) = state.inflight.remove(receipt) {
                state.pending.push_front(msg);
            }
        }
        Ok(())
    }

    async fn delete(&self, receipt: &str) -> Result<(), TaskError> {
        let mut state = self.state.lock().unwrap();
        state.inflight.remove(receipt);
        state.deleted.push(receipt.to_string());
        self.log.lock().unwrap().push(format!("delete:{receipt}"));
        Ok(())
    }
}

struct FakeStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    fail: bool,
    log: EventLog,
}

impl FakeStore {
    fn new(log: EventLog) -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(HashMap::new()),
            fail: false,
            log,
        })
    }

    fn failing(log: EventLog) -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(HashMap::new()),
            fail: true,
            log,
        })
    }

    fn object_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

impl ObjectStore for Arc<FakeStore> {
    async fn upload(&self, local_path: &Path, name: &str) -> Result<(), TaskError> {
        if self.fail {
            return Err(TaskError::transient_msg("store is down"));
        }
        let data = std::fs::read(local_path).map_err(TaskError::transient)?;
        self.objects.lock().unwrap().insert(name.to_string(), data);
        self.log.lock().unwrap().push(format!("upload:{name}"));
        Ok(())
    }

    fn object_url(&self, name: &str) -> String {
        format!("s3://fake/{name}")
    }
}

fn test_config(work_dir: &Path) -> NodeConfig {
    NodeConfig {
        work_dir: work_dir.to_path_buf(),
        visibility_timeout: 77,
        reassert_after: 3,
        tick: Duration::from_millis(10),
        poll_sleep: Duration::from_millis(50),
        retry: RetryPolicy {
            retries: 2,
            pause: Duration::ZERO,
            reset: Duration::from_secs(3600),
        },
    }
}

fn msg(receipt: &str, body: &str) -> QueueMessage {
    let mut attributes = HashMap::new();
    attributes.insert("script_name".to_string(), "task.sh".to_string());
    QueueMessage {
        body: body.to_string(),
        attributes,
        receipt: receipt.to_string(),
    }
}

#[tokio::test]
async fn consumes_queue_and_acknowledges_after_upload() {
    let dir = tempfile::tempdir().unwrap();
    let log: EventLog = Arc::default();
    let queue = FakeQueue::new(log.clone());
    let store = FakeStore::new(log.clone());
    for i in 1..=3 {
        queue.push(msg(
            &format!("r-{i}"),
            &format!("#!/bin/sh\necho data{i} > frame_{i}.png\n"),
        ));
    }

    let mut node = NodeRuntime::new(queue.clone(), store.clone(), test_config(dir.path()));
    node.prepare(Done::Exit).unwrap();
    let completed = node.drain().await.unwrap();

    assert_eq!(completed, 3);
    assert_eq!(node.completed_count(), 3);
    assert_eq!(queue.pending_len(), 0);
    assert_eq!(queue.inflight_len(), 0);
    assert_eq!(queue.deleted().len(), 3);

    // Every delete happens strictly after that task's output was uploaded.
    let log = log.lock().unwrap().clone();
    for i in 1..=3 {
        let upload_at = log.iter().position(|e| e == &format!("upload:frame_{i}.png"));
        let delete_at = log.iter().position(|e| e == &format!("delete:r-{i}"));
        assert!(upload_at.unwrap() < delete_at.unwrap(), "log: {log:?}");
    }

    // The task script itself lives in the outdir, so it is uploaded too.
    assert_eq!(
        store.object_names(),
        vec!["frame_1.png", "frame_2.png", "frame_3.png", "task.sh"]
    );

    // Accounting files reflect the completed count.
    let count = std::fs::read_to_string(dir.path().join("task_count")).unwrap();
    assert_eq!(count, "3\n");
    let last = std::fs::read_to_string(dir.path().join("task_last")).unwrap();
    assert!(last.trim().parse::<i64>().is_ok());

    // All outdirs were released.
    assert_eq!(outdir_count(dir.path()), 0);
}

#[tokio::test]
async fn failed_render_returns_message_and_never_uploads() {
    let dir = tempfile::tempdir().unwrap();
    let log: EventLog = Arc::default();
    let queue = FakeQueue::new(log.clone());
    let store = FakeStore::new(log.clone());
    queue.push(msg("r-1", "#!/bin/sh\nexit 2\n"));

    let mut node = NodeRuntime::new(queue.clone(), store.clone(), test_config(dir.path()));
    node.prepare(Done::Exit).unwrap();
    let err = node.drain().await.unwrap_err();

    // Both retry attempts fail, then the budget is spent.
    assert!(matches!(err, TaskError::Fatal(_)));
    assert!(queue.deleted().is_empty());
    assert!(store.object_names().is_empty());
    // The message went back with zero visibility and is deliverable again.
    assert_eq!(queue.pending_len(), 1);
    assert!(queue.extends().iter().any(|(r, secs)| r == "r-1" && *secs == 0));
    assert_eq!(outdir_count(dir.path()), 0);
}

#[tokio::test]
async fn long_render_keeps_the_lease_alive() {
    let dir = tempfile::tempdir().unwrap();
    let log: EventLog = Arc::default();
    let queue = FakeQueue::new(log.clone());
    let store = FakeStore::new(log.clone());
    queue.push(msg("r-1", "#!/bin/sh\nsleep 0.3\necho done > out.png\n"));

    let mut node = NodeRuntime::new(queue.clone(), store.clone(), test_config(dir.path()));
    node.prepare(Done::Exit).unwrap();
    node.drain().await.unwrap();

    // reassert_after=3 ticks of 10ms over a ~300ms render: several
    // refreshes, every one restoring the full visibility timeout.
    let refreshes: Vec<_> = queue
        .extends()
        .iter()
        .filter(|(_, secs)| *secs > 0)
        .cloned()
        .collect();
    assert!(refreshes.len() >= 2, "extends: {refreshes:?}");
    assert!(refreshes.iter().all(|(r, secs)| r == "r-1" && *secs == 77));
}

#[tokio::test]
async fn cancelled_loop_cleans_up_and_returns_the_message() {
    let dir = tempfile::tempdir().unwrap();
    let log: EventLog = Arc::default();
    let queue = FakeQueue::new(log.clone());
    let store = FakeStore::new(log.clone());
    queue.push(msg("r-1", "#!/bin/sh\nsleep 30\n"));

    let mut node = NodeRuntime::new(queue.clone(), store.clone(), test_config(dir.path()));
    node.prepare(Done::Exit).unwrap();

    // Cancel the loop mid-render, the way the signal arms do.
    let res = tokio::time::timeout(Duration::from_millis(300), node.drain()).await;
    assert!(res.is_err(), "render should still be in flight");
    node.cleanup().await;

    assert!(queue.extends().iter().any(|(r, secs)| r == "r-1" && *secs == 0));
    assert_eq!(queue.pending_len(), 1);
    assert!(queue.deleted().is_empty());
    assert_eq!(outdir_count(dir.path()), 0);

    // Idempotent: a second pass finds nothing to tear down.
    node.cleanup().await;
    assert_eq!(queue.pending_len(), 1);
}

#[tokio::test]
async fn poll_mode_waits_for_late_work() {
    let dir = tempfile::tempdir().unwrap();
    let log: EventLog = Arc::default();
    let queue = FakeQueue::new(log.clone());
    let store = FakeStore::new(log.clone());

    let mut node = NodeRuntime::new(queue.clone(), store.clone(), test_config(dir.path()));
    node.prepare(Done::Poll).unwrap();

    let work_dir = dir.path().to_path_buf();
    let feeder_queue = queue.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(120)).await;
        feeder_queue.push(msg("r-1", "#!/bin/sh\necho late > frame.png\n"));
        while feeder_queue.deleted().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // Flip the marker so the drained node stops polling.
        write_done_marker(&work_dir, Done::Exit).unwrap();
    });

    let completed = tokio::time::timeout(Duration::from_secs(10), node.drain())
        .await
        .expect("node should notice the marker flip")
        .unwrap();
    assert_eq!(completed, 1);
    assert_eq!(queue.deleted().len(), 1);
}

#[tokio::test]
async fn failed_upload_is_fatal_but_releases_the_message() {
    let dir = tempfile::tempdir().unwrap();
    let log: EventLog = Arc::default();
    let queue = FakeQueue::new(log.clone());
    let store = FakeStore::failing(log.clone());
    queue.push(msg("r-1", "#!/bin/sh\necho data > frame.png\n"));

    let mut node = NodeRuntime::new(queue.clone(), store.clone(), test_config(dir.path()));
    node.prepare(Done::Exit).unwrap();
    let err = node.drain().await.unwrap_err();

    assert!(matches!(err, TaskError::Fatal(_)));
    assert!(queue.deleted().is_empty());
    // Cleanup handed the un-acknowledged message straight back.
    assert_eq!(queue.pending_len(), 1);
    assert_eq!(outdir_count(dir.path()), 0);
}

fn outdir_count(work_dir: &Path) -> usize {
    std::fs::read_dir(work_dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.path().is_dir() && e.file_name().to_string_lossy().contains("_out_"))
        .count()
}
