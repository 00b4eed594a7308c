//! flow.ci server entrypoint.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod config;
mod serve;

use config::ServerConfig;

#[derive(Parser)]
#[command(name = "flowci")]
#[command(author, version, about = "flow.ci job scheduling server", long_about = None)]
struct Cli {
    /// YAML configuration file, layered over the built-in defaults.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Serve,
    /// Apply database migrations and exit
    Migrate,
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is not an error.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = ServerConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => serve::run(config).await?,
        Commands::Migrate => serve::migrate(&config).await?,
        Commands::Config => print!("{}", serde_yaml::to_string(&config.redacted())?),
    }

    Ok(())
}
