use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "brenda", version, about = "Render farm orchestrator for AWS")]
pub struct Cli {
    /// Config file (default: $BRENDA_CONFIG, then ~/.brenda.conf).
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the worker node task loop.
    Node(NodeArgs),
    /// Submit and inspect render tasks.
    #[command(subcommand)]
    Work(WorkCommand),
    /// Launch and reap render farm instances.
    #[command(subcommand)]
    Farm(FarmCommand),
}

#[derive(Debug, Args)]
pub struct NodeArgs {
    /// Read additional KEY=VALUE config from stdin and run unattended.
    #[arg(long)]
    pub daemon: bool,

    /// Shut the host down once the queue drains.
    #[arg(long)]
    pub shutdown: bool,

    /// Validate configuration without entering the task loop.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Subcommand)]
pub enum WorkCommand {
    /// Expand a task template and enqueue the resulting tasks.
    Push(PushArgs),
    /// Show the approximate number of queued tasks.
    Status,
    /// Drop all queued tasks.
    Reset(ResetArgs),
}

#[derive(Debug, Args)]
pub struct PushArgs {
    /// Task template script (must start with a shebang).
    #[arg(short = 'T', long = "task-script")]
    pub task_script: PathBuf,

    /// First frame, inclusive.
    #[arg(short = 's', long)]
    pub start: u32,

    /// Last frame, inclusive.
    #[arg(short = 'e', long)]
    pub end: u32,

    /// Frames per task.
    #[arg(long, default_value_t = 1)]
    pub step: u32,

    /// Horizontal subframe subdivisions (tiled rendering).
    #[arg(long, default_value_t = 0)]
    pub subdiv_x: u32,

    /// Vertical subframe subdivisions (tiled rendering).
    #[arg(long, default_value_t = 0)]
    pub subdiv_y: u32,

    /// Shuffle the task list for load balancing.
    #[arg(long)]
    pub randomize: bool,

    /// Expand only; do not touch the queue.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Args)]
pub struct ResetArgs {
    /// Delete the queue itself instead of purging it.
    #[arg(long)]
    pub hard: bool,
}

#[derive(Debug, Subcommand)]
pub enum FarmCommand {
    /// Launch on-demand worker instances.
    Demand(LaunchArgs),
    /// Request spot worker instances.
    Spot(SpotArgs),
    /// Stop (or terminate) matching instances.
    Stop(StopArgs),
    /// Cancel open and active spot requests.
    Cancel(CancelArgs),
    /// Show running instances and live spot requests.
    Status(FilterArgs),
    /// Print the worker startup script.
    Script(ScriptArgs),
}

#[derive(Debug, Args)]
pub struct LaunchArgs {
    /// Number of instances to launch.
    #[arg(short = 'N', long, default_value_t = 1)]
    pub n_instances: u32,

    /// AMI to launch (default: AMI_ID config key).
    #[arg(long)]
    pub ami: Option<String>,

    /// Instance type (default: INSTANCE_TYPE config key).
    #[arg(short = 'i', long)]
    pub instance_type: Option<String>,

    /// Launch idle, without the worker startup script.
    #[arg(long)]
    pub idle: bool,

    /// Bake DONE=shutdown into the startup script.
    #[arg(long)]
    pub shutdown: bool,

    /// Ask the provider to validate the launch without running it.
    #[arg(long)]
    pub dry_run: bool,

    /// Tag launched resources, KEY=VALUE (repeatable).
    #[arg(short = 't', long = "tag", value_parser = parse_key_val)]
    pub tags: Vec<(String, String)>,
}

#[derive(Debug, Args)]
pub struct SpotArgs {
    #[command(flatten)]
    pub launch: LaunchArgs,

    /// Maximum bid price (default: BID_PRICE config key).
    #[arg(short = 'p', long)]
    pub price: Option<String>,

    /// Issue a persistent request instead of a one-time one.
    #[arg(long)]
    pub persistent: bool,
}

#[derive(Debug, Args)]
pub struct StopArgs {
    #[command(flatten)]
    pub filter: FilterArgs,

    /// Terminate instead of stopping.
    #[arg(long)]
    pub terminate: bool,

    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Args)]
pub struct CancelArgs {
    /// Only requests carrying these tags, KEY=VALUE (repeatable).
    #[arg(short = 't', long = "tag", value_parser = parse_key_val)]
    pub tags: Vec<(String, String)>,

    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Args)]
pub struct FilterArgs {
    /// Only instances carrying these tags, KEY=VALUE (repeatable).
    #[arg(short = 't', long = "tag", value_parser = parse_key_val)]
    pub tags: Vec<(String, String)>,

    /// Only instances of this type.
    #[arg(long)]
    pub imatch: Option<String>,

    /// Only instances with this public DNS name (repeatable).
    #[arg(long)]
    pub host: Vec<String>,

    /// File of public DNS names, one per line.
    #[arg(long)]
    pub hosts_file: Option<PathBuf>,

    /// Only instances in the last N minutes of their billing hour.
    #[arg(short = 'T', long)]
    pub threshold: Option<u32>,
}

#[derive(Debug, Args)]
pub struct ScriptArgs {
    /// Bake DONE=shutdown into the printed script.
    #[arg(long)]
    pub shutdown: bool,
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn key_val_parser() {
        assert_eq!(
            parse_key_val("project=shot01").unwrap(),
            ("project".to_string(), "shot01".to_string())
        );
        assert_eq!(parse_key_val("k=").unwrap(), ("k".to_string(), String::new()));
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=v").is_err());
    }

    #[test]
    fn push_args_parse() {
        let cli = Cli::try_parse_from([
            "brenda", "work", "push", "-T", "frame.sh", "-s", "1", "-e", "240", "--step", "4",
            "--subdiv-x", "2", "--subdiv-y", "2", "--randomize",
        ])
        .unwrap();
        let Command::Work(WorkCommand::Push(args)) = cli.command else {
            panic!("expected work push");
        };
        assert_eq!(args.start, 1);
        assert_eq!(args.end, 240);
        assert_eq!(args.step, 4);
        assert_eq!((args.subdiv_x, args.subdiv_y), (2, 2));
        assert!(args.randomize);
        assert!(!args.dry_run);
    }
}
