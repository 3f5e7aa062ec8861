mod cli;
mod fleet;
mod node;
mod work;

use clap::Parser;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use brenda_core::Config;

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(err) = run(cli).await {
        error!("{err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let conf = Config::load(cli.config.as_deref())?;
    match cli.command {
        Command::Node(args) => node::run(args, conf).await,
        Command::Work(cmd) => work::run(cmd, &conf).await,
        Command::Farm(cmd) => fleet::run(cmd, &conf).await,
    }
}
