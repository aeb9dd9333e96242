mod cli;
mod commands;
mod config;

use std::process;

use clap::Parser;
use cli::Cli;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    let _ = rt.block_on(run_cli());
}

async fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing based on --debug flag
    let level = if cli.global.debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let result = match cli.command {
        cli::Commands::Provision(args) => commands::provision::execute(args, &cli.global).await,
        cli::Commands::Tar2vhd(args) => commands::tar2vhd::execute(args, &cli.global).await,
        cli::Commands::Vhd2tar(args) => commands::vhd2tar::execute(args, &cli.global).await,
        cli::Commands::Completion(args) => commands::completion::execute(args),
    };

    if let Err(error) = result {
        eprintln!("Error: {}", error);
        process::exit(1);
    }

    Ok(())
}
