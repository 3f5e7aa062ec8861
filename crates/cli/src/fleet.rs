use std::time::Duration;

use anyhow::Context as _;
use chrono::Utc;
use tracing::{debug, info};

use brenda_aws::compute::{
    Ec2Compute, InstanceFilters, LaunchSpec, SpotKind, format_uptime,
};
use brenda_core::Config;
use brenda_core::error::TaskError;
use brenda_engine::Done;

use crate::cli::{CancelArgs, FarmCommand, FilterArgs, LaunchArgs, ScriptArgs, SpotArgs, StopArgs};

/// Config keys the startup script must carry for the worker to run.
const REQUIRED_SCRIPT_KEYS: &[&str] = &["WORK_QUEUE", "OUTPUT_URL"];

/// Config keys passed through to the worker when present.
const OPTIONAL_SCRIPT_KEYS: &[&str] = &[
    "S3_REGION",
    "SQS_REGION",
    "EC2_REGION",
    "VISIBILITY_TIMEOUT",
    "VISIBILITY_TIMEOUT_REASSERT",
    "ERROR_RETRIES",
    "ERROR_PAUSE",
    "ERROR_RESET",
    "WORK_DIR",
    "SHUTDOWN",
    "DONE",
    "RUNNING_ON_EC2",
];

const TAG_POLL_INTERVAL: Duration = Duration::from_secs(3);

pub async fn run(cmd: FarmCommand, conf: &Config) -> anyhow::Result<()> {
    match cmd {
        FarmCommand::Demand(args) => demand(args, conf).await,
        FarmCommand::Spot(args) => spot(args, conf).await,
        FarmCommand::Stop(args) => stop(args, conf).await,
        FarmCommand::Cancel(args) => cancel(args, conf).await,
        FarmCommand::Status(args) => status(args, conf).await,
        FarmCommand::Script(args) => script(args, conf),
    }
}

async fn demand(args: LaunchArgs, conf: &Config) -> anyhow::Result<()> {
    let startup = startup_script(conf, args.shutdown)?;
    let user_data = (!args.idle).then(|| startup.clone());
    let spec = launch_spec(conf, &args, user_data)?;
    print_summary(&spec, None, &startup);

    let compute = Ec2Compute::connect(conf).await;
    let ids = compute.run_on_demand(&spec).await?;
    if !ids.is_empty() && !args.tags.is_empty() {
        tag_instances(&compute, &ids, &args.tags).await?;
    }
    Ok(())
}

async fn spot(args: SpotArgs, conf: &Config) -> anyhow::Result<()> {
    let startup = startup_script(conf, args.launch.shutdown)?;
    let user_data = (!args.launch.idle).then(|| startup.clone());
    let spec = launch_spec(conf, &args.launch, user_data)?;
    let price = conf
        .opt_or_key(args.price.as_deref(), "BID_PRICE")
        .ok_or_else(|| TaskError::fatal_msg("config key \"BID_PRICE\" is missing"))?
        .to_string();
    let kind = if args.persistent {
        SpotKind::Persistent
    } else {
        SpotKind::OneTime
    };
    print_summary(&spec, Some((&price, kind)), &startup);

    let compute = Ec2Compute::connect(conf).await;
    let request_ids = compute.run_spot(&spec, kind, &price).await?;
    if request_ids.is_empty() || args.launch.tags.is_empty() {
        return Ok(());
    }

    // Tag the requests now; instances and their volumes once fulfilled.
    compute.create_tags(&request_ids, &args.launch.tags).await?;
    for request_id in &request_ids {
        let instance_id = wait_for_fulfilment(&compute, request_id).await?;
        tag_instances(&compute, &[instance_id], &args.launch.tags).await?;
    }
    Ok(())
}

async fn stop(args: StopArgs, conf: &Config) -> anyhow::Result<()> {
    let compute = Ec2Compute::connect(conf).await;
    let instances = compute.filter_instances(&instance_filters(&args.filter)?).await?;
    let ids: Vec<String> = instances.iter().map(|i| i.id.clone()).collect();
    compute.shutdown_instances(&ids, args.terminate, args.dry_run).await?;
    Ok(())
}

async fn cancel(args: CancelArgs, conf: &Config) -> anyhow::Result<()> {
    let compute = Ec2Compute::connect(conf).await;
    let mut filters = tag_filters(&args.tags);
    filters.push((
        "state".to_string(),
        vec!["open".to_string(), "active".to_string()],
    ));
    let requests = compute.list_spot_requests(&filters).await?;
    let ids: Vec<String> = requests.into_iter().map(|r| r.id).collect();
    info!("cancelling spot requests: {ids:?}");
    compute.cancel_spot_requests(&ids, args.dry_run).await?;
    Ok(())
}

async fn status(args: FilterArgs, conf: &Config) -> anyhow::Result<()> {
    let compute = Ec2Compute::connect(conf).await;

    let mut filters = instance_filters(&args)?;
    filters
        .extra
        .push(("instance-state-name".to_string(), vec!["running".to_string()]));
    let instances = compute.filter_instances(&filters).await?;
    let now = Utc::now().timestamp();
    if !instances.is_empty() {
        println!("Running Instances");
    }
    for instance in &instances {
        println!(
            "  {} {} {} {:?}",
            instance.image_id,
            format_uptime(now - instance.launch_time),
            instance.public_dns_name,
            instance.tags
        );
    }

    let mut filters = tag_filters(&args.tags);
    filters.push((
        "state".to_string(),
        vec!["active".to_string(), "open".to_string()],
    ));
    let requests = compute.list_spot_requests(&filters).await?;
    if !requests.is_empty() {
        println!("Active Spot Requests");
    }
    for request in &requests {
        println!(
            "  {} {} ${} {} {} {:?}",
            request.id,
            request.kind.as_deref().unwrap_or("-"),
            request.price.as_deref().unwrap_or("-"),
            request.state,
            request.status.as_deref().unwrap_or("-"),
            request.tags
        );
    }
    Ok(())
}

fn script(args: ScriptArgs, conf: &Config) -> anyhow::Result<()> {
    println!("{}", startup_script(conf, args.shutdown)?);
    Ok(())
}

/// The user-data script a fresh instance boots with: change into the work
/// dir and run the node in daemon mode with its config fed through a
/// here-document. Credentials are deliberately absent; the instance profile
/// carries them.
fn startup_script(conf: &Config, shutdown: bool) -> Result<String, TaskError> {
    // Fail here, not on the instance, if the DONE behaviour is misconfigured.
    Done::resolve(conf, shutdown)?;

    let work_dir = conf.get_or("WORK_DIR", "/mnt/brenda");
    let mut script = String::from("#!/bin/bash\n");
    script.push_str(&format!("B=\"{work_dir}\"\nmkdir -p \"$B\"\ncd \"$B\"\n"));
    script.push_str("/usr/local/bin/brenda node --daemon");
    if shutdown {
        script.push_str(" --shutdown");
    }
    script.push_str(" <<EOF\n");
    for key in REQUIRED_SCRIPT_KEYS {
        let value = if *key == "OUTPUT_URL" {
            conf.get("OUTPUT_URL").or_else(|| conf.get("RENDER_OUTPUT"))
        } else {
            conf.get(key)
        };
        let value = value.ok_or_else(|| {
            TaskError::fatal_msg(format!("config key {key:?} must be defined"))
        })?;
        script.push_str(&format!("{key}={value}\n"));
    }
    for key in OPTIONAL_SCRIPT_KEYS {
        if let Some(value) = conf.get(key) {
            script.push_str(&format!("{key}={value}\n"));
        }
    }
    script.push_str("EOF\n");
    Ok(script)
}

fn launch_spec(
    conf: &Config,
    args: &LaunchArgs,
    user_data: Option<String>,
) -> Result<LaunchSpec, TaskError> {
    let ami_id = conf
        .opt_or_key(args.ami.as_deref(), "AMI_ID")
        .ok_or_else(|| TaskError::fatal_msg("config key \"AMI_ID\" is missing"))?
        .to_string();
    let instance_type = conf
        .opt_or_key(args.instance_type.as_deref(), "INSTANCE_TYPE")
        .unwrap_or("m2.xlarge")
        .to_string();
    Ok(LaunchSpec {
        ami_id,
        instance_type,
        key_name: conf.get_or("SSH_KEY_NAME", "brenda").to_string(),
        security_groups: vec![conf.get_or("SECURITY_GROUP", "brenda").to_string()],
        instance_profile: conf.get("INSTANCE_PROFILE").map(str::to_string),
        user_data,
        count: args.n_instances,
        dry_run: args.dry_run,
    })
}

fn print_summary(spec: &LaunchSpec, spot: Option<(&str, SpotKind)>, startup: &str) {
    println!("----------------------------");
    println!("AMI ID: {}", spec.ami_id);
    if let Some((price, kind)) = spot {
        println!("Max bid price: ${price}");
        println!(
            "Request type: {}",
            match kind {
                SpotKind::OneTime => "one-time",
                SpotKind::Persistent => "persistent",
            }
        );
    }
    println!("Instance type: {}", spec.instance_type);
    println!("Instance count: {}", spec.count);
    println!("SSH key name: {}", spec.key_name);
    println!("Security groups: {:?}", spec.security_groups);
    if spec.user_data.is_some() {
        println!("Startup script:");
        for line in startup.lines() {
            println!("  {line}");
        }
    }
}

/// Poll until the spot request leaves `open`, returning the instance that
/// fulfilled it.
async fn wait_for_fulfilment(
    compute: &Ec2Compute,
    request_id: &str,
) -> Result<String, TaskError> {
    loop {
        debug!("waiting for spot request {request_id} to be fulfilled...");
        tokio::time::sleep(TAG_POLL_INTERVAL).await;
        let requests = compute
            .list_spot_requests(&[(
                "spot-instance-request-id".to_string(),
                vec![request_id.to_string()],
            )])
            .await?;
        let Some(request) = requests.first() else {
            continue;
        };
        if request.state != "open" {
            return request.instance_id.clone().ok_or_else(|| {
                TaskError::fatal_msg(format!(
                    "spot request {request_id} reached state {:?} without an instance",
                    request.state
                ))
            });
        }
    }
}

/// Tag instances and, once they appear, their attached volumes.
async fn tag_instances(
    compute: &Ec2Compute,
    instance_ids: &[String],
    tags: &[(String, String)],
) -> Result<(), TaskError> {
    let mut resources = Vec::new();
    for id in instance_ids {
        resources.push(id.clone());
        resources.extend(wait_for_volumes(compute, id).await?);
    }
    compute.create_tags(&resources, tags).await
}

async fn wait_for_volumes(compute: &Ec2Compute, id: &str) -> Result<Vec<String>, TaskError> {
    loop {
        debug!("waiting for block volumes of {id}...");
        tokio::time::sleep(TAG_POLL_INTERVAL).await;
        if let Some(info) = compute.describe_instance(id).await? {
            if !info.volume_ids.is_empty() {
                return Ok(info.volume_ids);
            }
        }
    }
}

fn tag_filters(tags: &[(String, String)]) -> Vec<(String, Vec<String>)> {
    tags.iter()
        .map(|(key, value)| (format!("tag:{key}"), vec![value.clone()]))
        .collect()
}

fn instance_filters(args: &FilterArgs) -> anyhow::Result<InstanceFilters> {
    let mut hosts = Vec::new();
    if let Some(path) = &args.hosts_file {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading hosts file {}", path.display()))?;
        hosts.extend(
            raw.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string),
        );
    }
    hosts.extend(args.host.iter().cloned());
    Ok(InstanceFilters {
        tags: args.tags.clone(),
        instance_type: args.imatch.clone(),
        hosts,
        extra: Vec::new(),
        uptime_threshold_minutes: args.threshold,
    })
}
