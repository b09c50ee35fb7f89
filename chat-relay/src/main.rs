use anyhow::Result;
use clap::Parser;
use tracing::{error, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

use chat_relay::{
    cli::{Cli, Command},
    display,
};

/// Diagnostics go to stderr; stdout carries the chat transcript and relay log.
fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let result = match Cli::parse().command {
        Command::Server(args) => display::run_server(args.resolve()?).await,
        Command::Client(args) => display::run_client(args.resolve()?).await,
    };
    if let Err(err) = &result {
        error!("chat-relay exited with error: {err:#}");
    }
    result
}
