use std::sync::Arc;

use brenda_core::error::TaskError;
use brenda_core::fsutil;
use brenda_core::retry::retry;
use tokio::process::Command;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info, warn};

use crate::api::{
    Done, NodeConfig, ObjectStore, QueueMessage, WorkQueue, read_done_marker, write_done_marker,
};
use crate::process::TaskProcess;
use crate::slot::TaskSlot;
use crate::uploader::start_upload;

/// The worker node scheduler.
///
/// One render slot and one upload slot, driven from a single task: each
/// outer-loop iteration pulls at most one message, runs its script, then
/// hands the finished outdir to the uploader while the next render starts.
/// A message is deleted from the queue only after its upload exits 0; every
/// earlier failure puts it back.
pub struct NodeRuntime<Q, S> {
    queue: Q,
    store: Arc<S>,
    cfg: NodeConfig,
    render: Option<TaskSlot>,
    upload: Option<TaskSlot>,
    id_counter: u64,
    completed: u64,
}

impl<Q: WorkQueue, S: ObjectStore> NodeRuntime<Q, S> {
    pub fn new(queue: Q, store: S, cfg: NodeConfig) -> Self {
        Self {
            queue,
            store: Arc::new(store),
            cfg,
            render: None,
            upload: None,
            id_counter: 0,
            completed: 0,
        }
    }

    /// Tasks completed (uploaded and acknowledged) so far.
    pub fn completed_count(&self) -> u64 {
        self.completed
    }

    /// Prepare the work dir for a fresh run: drop stale accounting files and
    /// persist the post-drain behaviour.
    pub fn prepare(&self, done: Done) -> Result<(), TaskError> {
        fsutil::rm(&self.cfg.work_dir.join("task_count"));
        fsutil::rm(&self.cfg.work_dir.join("task_last"));
        write_done_marker(&self.cfg.work_dir, done)
    }

    /// Run until the queue drains (or a signal arrives), then tear down any
    /// live slots. Returns the number of completed tasks.
    pub async fn run(&mut self) -> Result<u64, TaskError> {
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|err| TaskError::fatal(anyhow::anyhow!("installing SIGINT handler: {err}")))?;
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|err| TaskError::fatal(anyhow::anyhow!("installing SIGTERM handler: {err}")))?;

        let result = tokio::select! {
            res = self.drain() => res,
            _ = sigint.recv() => {
                warn!("exit on SIGINT");
                Err(TaskError::Cancelled)
            }
            _ = sigterm.recv() => {
                warn!("exit on SIGTERM");
                Err(TaskError::Cancelled)
            }
        };
        // The drain future cleans up after itself; this covers the signal
        // arms, which cancel it mid-flight.
        self.cleanup().await;
        result
    }

    /// The retried task loop, without signal handling.
    pub async fn drain(&mut self) -> Result<u64, TaskError> {
        let policy = self.cfg.retry.clone();
        retry(&policy, async || self.attempt().await).await?;
        info!("completed {} tasks", self.completed);
        Ok(self.completed)
    }

    /// One retry-harness attempt at the task loop; slots are torn down on
    /// every exit edge so a retried attempt starts clean and the queue gets
    /// its messages back.
    async fn attempt(&mut self) -> Result<(), TaskError> {
        let result = self.task_loop().await;
        self.cleanup().await;
        result
    }

    async fn task_loop(&mut self) -> Result<(), TaskError> {
        loop {
            debug!("reading work queue");
            let msg = self.queue.receive().await?;
            match &self.upload {
                Some(slot) => info!("running upload task #{}", slot.id),
                None => debug!("no upload task running"),
            }

            if let Some(msg) = msg {
                self.start_render(msg)?;
            }

            self.wait_for_slots().await?;

            // The upload slot is finished; its message was deleted in the
            // wait phase, so releasing it just drops the outdir.
            if let Some(slot) = self.upload.take() {
                self.cleanup_slot(slot).await;
            }

            // Hand the rendered outdir to the uploader and free the render
            // slot for the next message. A non-zero render exit never gets
            // here: the wait phase already raised it as a transient error.
            if let Some(mut slot) = self.render.take() {
                debug!(
                    "render task #{} finished with status {:?}, starting upload",
                    slot.id, slot.retcode
                );
                let outdir = slot
                    .outdir
                    .clone()
                    .ok_or_else(|| TaskError::fatal_msg("render slot lost its outdir"))?;
                slot.process = Some(TaskProcess::Upload(start_upload(
                    self.store.clone(),
                    outdir,
                    self.cfg.retry.clone(),
                )));
                self.upload = Some(slot);
            }

            if self.render.is_none() && self.upload.is_none() {
                match read_done_marker(&self.cfg.work_dir)? {
                    Done::Poll => {
                        info!("waiting for tasks");
                        tokio::time::sleep(self.cfg.poll_sleep).await;
                    }
                    _ => {
                        info!("work queue drained, exiting");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Materialise the task script into a fresh outdir and spawn it.
    fn start_render(&mut self, msg: QueueMessage) -> Result<(), TaskError> {
        self.id_counter += 1;
        let id = self.id_counter;
        let script_name = msg.script_name()?.to_string();

        let outdir = self.cfg.work_dir.join(format!("{script_name}_out_{id}"));
        info!("task folder: {}", outdir.display());
        fsutil::rmtree(&outdir);
        std::fs::create_dir_all(&outdir).map_err(|err| {
            TaskError::fatal(anyhow::anyhow!("creating {}: {err}", outdir.display()))
        })?;

        let script_path = outdir.join(&script_name);
        std::fs::write(&script_path, &msg.body).map_err(|err| {
            TaskError::fatal(anyhow::anyhow!("writing {}: {err}", script_path.display()))
        })?;
        fsutil::mark_executable(&script_path).map_err(TaskError::fatal)?;

        info!("executing task script: {}", script_path.display());
        let child = Command::new(&script_path)
            .current_dir(&outdir)
            .spawn()
            .map_err(|err| {
                TaskError::fatal(anyhow::anyhow!("spawning {}: {err}", script_path.display()))
            })?;

        info!("running render task: {script_name} #{id}");
        self.render = Some(TaskSlot {
            msg: Some(msg),
            script_name,
            id,
            process: Some(TaskProcess::Render(child)),
            outdir: Some(outdir),
            retcode: None,
        });
        Ok(())
    }

    /// Tick until neither slot has a running process, re-asserting queue
    /// visibility every `reassert_after` ticks so the lease never lapses
    /// while work is in flight.
    async fn wait_for_slots(&mut self) -> Result<(), TaskError> {
        let mut count: u32 = 0;
        loop {
            let reassert = count >= self.cfg.reassert_after;
            self.poll_render(reassert).await?;
            self.poll_upload(reassert).await?;

            let render_running = self.render.as_ref().is_some_and(TaskSlot::is_running);
            let upload_running = self.upload.as_ref().is_some_and(TaskSlot::is_running);
            if !render_running && !upload_running {
                return Ok(());
            }

            if reassert {
                count = 0;
            }
            tokio::time::sleep(self.cfg.tick).await;
            count += 1;
        }
    }

    async fn poll_render(&mut self, reassert: bool) -> Result<(), TaskError> {
        let Some(slot) = self.render.as_mut() else {
            return Ok(());
        };
        if let Some(process) = slot.process.as_mut() {
            if let Some(code) = process.poll()? {
                slot.retcode = Some(code);
                slot.process = None;
                if code != 0 {
                    return Err(TaskError::transient_msg(format!(
                        "render task \"{} #{}\" exited with status code {code}",
                        slot.script_name, slot.id
                    )));
                }
                info!("finished render task: {} #{}", slot.script_name, slot.id);
            }
        }
        if reassert && slot.process.is_some() {
            if let Some(msg) = &slot.msg {
                debug!("reasserting render task #{} with the work queue", slot.id);
                self.queue
                    .extend(&msg.receipt, self.cfg.visibility_timeout)
                    .await?;
            }
        }
        Ok(())
    }

    async fn poll_upload(&mut self, reassert: bool) -> Result<(), TaskError> {
        let mut finished: Option<(u64, Option<QueueMessage>)> = None;
        {
            let Some(slot) = self.upload.as_mut() else {
                return Ok(());
            };
            if let Some(process) = slot.process.as_mut() {
                if let Some(code) = process.poll()? {
                    slot.retcode = Some(code);
                    slot.process = None;
                    if code != 0 {
                        return Err(TaskError::fatal_msg(format!(
                            "upload task #{} exited with status code {code}",
                            slot.id
                        )));
                    }
                    finished = Some((slot.id, slot.msg.take()));
                }
            }
            if reassert && slot.process.is_some() {
                if let Some(msg) = &slot.msg {
                    debug!("reasserting upload task #{} with the work queue", slot.id);
                    self.queue
                        .extend(&msg.receipt, self.cfg.visibility_timeout)
                        .await?;
                }
            }
        }
        if let Some((id, msg)) = finished {
            info!("finished upload task #{id}");
            if let Some(msg) = msg {
                self.queue.delete(&msg.receipt).await?;
            }
            self.completed += 1;
            self.write_accounting()?;
        }
        Ok(())
    }

    /// Tear down whatever slots exist. Safe to call on every exit path; each
    /// resource is detached from the slot before the call that releases it,
    /// so a repeated invocation finds nothing left to do.
    pub async fn cleanup(&mut self) {
        let slots = [self.render.take(), self.upload.take()];
        for slot in slots.into_iter().flatten() {
            self.cleanup_slot(slot).await;
        }
    }

    async fn cleanup_slot(&self, mut slot: TaskSlot) {
        if let Some(msg) = slot.msg.take() {
            debug!(
                "returning render task \"{} #{}\" back to the work queue",
                slot.script_name, slot.id
            );
            if let Err(err) = self.queue.extend(&msg.receipt, 0).await {
                warn!("failed returning task #{} to the queue: {err:#}", slot.id);
            }
        }
        if let Some(mut process) = slot.process.take() {
            debug!("stopping task: {} #{}", slot.script_name, slot.id);
            if let Err(err) = process.stop().await {
                warn!("failed stopping task #{}: {err:#}", slot.id);
            }
        }
        if let Some(outdir) = slot.outdir.take() {
            fsutil::rmtree(&outdir);
        }
    }

    /// Progress files for external observers, updated only after a message
    /// has been acknowledged.
    fn write_accounting(&self) -> Result<(), TaskError> {
        fsutil::write_atomic(
            &self.cfg.work_dir.join("task_count"),
            &format!("{}\n", self.completed),
        )
        .map_err(TaskError::fatal)?;
        fsutil::write_atomic(
            &self.cfg.work_dir.join("task_last"),
            &format!("{}\n", chrono::Utc::now().timestamp()),
        )
        .map_err(TaskError::fatal)?;
        Ok(())
    }
}
