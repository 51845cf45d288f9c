use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;
mod logging;

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Event-driven chat automation runtime", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file to use instead of ~/.courier/config.yaml
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log at debug level regardless of the configured level
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the config and serve until interrupted
    Run,
    /// Validate the config and dry-build everything it names
    Check,
    /// Generate shell completion scripts
    Completions {
        /// Target shell: bash, zsh, fish, powershell, elvish
        shell: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => commands::run_cmd::run(cli.config, cli.verbose).await?,
        Commands::Check => commands::check_cmd::run(cli.config, cli.verbose).await?,
        Commands::Completions { shell } => commands::completions_cmd::run(&shell).await?,
    }

    Ok(())
}
