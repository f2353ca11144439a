use anyhow::Result;
use clap::Parser;

use chat_relay::{
    cli::{Cli, Command},
    console,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries chat lines; diagnostics go to stderr.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => console::run_server(args).await?,
        Command::Client(args) => console::run_client(args).await?,
    }

    Ok(())
}
