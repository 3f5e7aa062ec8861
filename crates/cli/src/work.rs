use anyhow::Context as _;
use tracing::{debug, info};

use brenda_aws::queue::{BATCH_MAX, BatchEntry, SqsWorkQueue};
use brenda_core::Config;
use brenda_core::template::{JobParams, expand_tasks};

use crate::cli::{PushArgs, ResetArgs, WorkCommand};

pub async fn run(cmd: WorkCommand, conf: &Config) -> anyhow::Result<()> {
    match cmd {
        WorkCommand::Push(args) => push(args, conf).await,
        WorkCommand::Status => status(conf).await,
        WorkCommand::Reset(args) => reset(args, conf).await,
    }
}

/// Expand the task template and enqueue the tasks in batches.
async fn push(args: PushArgs, conf: &Config) -> anyhow::Result<()> {
    let template = std::fs::read_to_string(&args.task_script)
        .with_context(|| format!("reading task script {}", args.task_script.display()))?;
    let script_name = args
        .task_script
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .context("task script path has no file name")?;

    let params = JobParams {
        start: args.start,
        end: args.end,
        step: args.step,
        subdiv_x: args.subdiv_x,
        subdiv_y: args.subdiv_y,
        job_name: conf.get_or("JOB_NAME", "NONE").to_string(),
        job_url: conf.get_or("JOB_URL", "NONE").to_string(),
        randomize: args.randomize,
    };
    let tasks = expand_tasks(&template, &params)?;
    info!("expanded {} tasks from {script_name}", tasks.len());
    for (i, task) in tasks.iter().enumerate() {
        debug!("task #{:04}: {}", i + 1, task.replace('\n', " "));
    }
    if args.dry_run {
        info!("dry run, not queueing");
        return Ok(());
    }

    let queue = SqsWorkQueue::create(conf).await?;
    let mut queued = 0;
    for chunk in tasks.chunks(BATCH_MAX) {
        let entries: Vec<BatchEntry> = chunk
            .iter()
            .enumerate()
            .map(|(i, body)| BatchEntry {
                id: (i + 1).to_string(),
                body: body.clone(),
                delay_seconds: 0,
                script_name: script_name.clone(),
            })
            .collect();
        queue.write_batch(&entries).await?;
        queued += chunk.len();
        info!("queued {queued} of {} tasks", tasks.len());
    }
    Ok(())
}

async fn status(conf: &Config) -> anyhow::Result<()> {
    let queue = SqsWorkQueue::connect(conf).await?;
    let count = queue.approximate_count().await?;
    info!("{count} tasks queued on sqs://{}", queue.name());
    Ok(())
}

async fn reset(args: ResetArgs, conf: &Config) -> anyhow::Result<()> {
    let queue = SqsWorkQueue::connect(conf).await?;
    if args.hard {
        info!("deleting queue sqs://{}", queue.name());
        queue.delete_queue().await?;
    } else {
        info!("clearing queue sqs://{}", queue.name());
        queue.purge().await?;
    }
    Ok(())
}
