use std::io::Read as _;

use anyhow::Context as _;
use tracing::{info, warn};

use brenda_aws::compute::Ec2Compute;
use brenda_aws::metadata;
use brenda_aws::queue::SqsWorkQueue;
use brenda_aws::store::S3OutputStore;
use brenda_core::Config;
use brenda_engine::{Done, NodeConfig, NodeRuntime, read_done_marker};

use crate::cli::NodeArgs;

/// Run the worker node: wire the drivers, enter the task loop, honour the
/// post-drain behaviour.
pub async fn run(args: NodeArgs, mut conf: Config) -> anyhow::Result<()> {
    if args.daemon {
        // The fleet startup script feeds config through a here-document.
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("reading config from stdin")?;
        conf.merge_str(&raw);
    }

    let cfg = NodeConfig::from_config(&conf)?;
    let done = Done::resolve(&conf, args.shutdown)?;

    let store = S3OutputStore::connect(&conf).await?;
    info!("render output: {}", store.url().object_url(""));
    let queue = SqsWorkQueue::connect(&conf).await?;
    info!("work queue: sqs://{}", queue.name());

    // Know our own spot request up front so a shutdown drain can cancel it.
    let mut spot_request_id = None;
    if conf.get_flag_or("RUNNING_ON_EC2", true) {
        match metadata::self_instance_id().await {
            Ok(instance_id) => {
                let compute = Ec2Compute::connect(&conf).await;
                match compute.get_spot_request_of(&instance_id).await {
                    Ok(sir) => {
                        info!("spot request id: {sir:?}");
                        spot_request_id = sir;
                    }
                    Err(err) => warn!("failed getting own spot request: {err:#}"),
                }
            }
            Err(err) => warn!("failed getting own instance id: {err:#}"),
        }
    }

    let work_dir = cfg.work_dir.clone();
    let mut node = NodeRuntime::new(queue, store, cfg);
    node.prepare(done)?;

    if args.dry_run {
        info!("dry run, not entering the task loop");
        return Ok(());
    }

    node.run().await?;

    if read_done_marker(&work_dir)? == Done::Shutdown {
        if let Some(sir) = &spot_request_id {
            // A persistent spot request would re-launch this worker unless
            // it is cancelled before the host goes down.
            info!("cancelling own spot request: {sir}");
            let compute = Ec2Compute::connect(&conf).await;
            if let Err(err) = compute.cancel_spot_requests(&[sir.clone()], false).await {
                warn!("failed cancelling spot request {sir}: {err:#}");
            }
        }
        shutdown_host().await?;
    }
    Ok(())
}

async fn shutdown_host() -> anyhow::Result<()> {
    info!("shutting the host down");
    let status = tokio::process::Command::new("/sbin/shutdown")
        .args(["-h", "0"])
        .status()
        .await
        .context("running /sbin/shutdown")?;
    if !status.success() {
        anyhow::bail!("shutdown command exited with {status}");
    }
    Ok(())
}
