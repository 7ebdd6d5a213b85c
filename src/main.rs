mod args;
mod cmd_daemon;

use args::Cli;
use clap::Parser;
use steward::clienv;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(clienv::log_filter()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = cmd_daemon::cmd_daemon(cli).await?;
    if code != 0 {
        std::process::exit(code);
    }

    Ok(())
}
