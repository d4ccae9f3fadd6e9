//! Parlingest - Italian parliamentary document ingestion
//!
//! Main entry point for the parlingest CLI application.

use std::process::ExitCode;

use console::style;
use tracing_subscriber::EnvFilter;

use parlingest::cli::{self, Cli, Commands};
use parlingest::error::Result;

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Set up logging
    setup_logging(&cli);

    // Run the application
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

/// Set up logging based on CLI arguments
fn setup_logging(cli: &Cli) {
    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();
}

/// Main application logic
async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Run(args) => cli::execute_run(&args, config_path).await,
        Commands::Camera(args) => cli::execute_camera(&args, config_path).await,
        Commands::Senato(args) => cli::execute_senato(&args, config_path).await,
        Commands::Youtube(args) => cli::execute_youtube(&args, config_path).await,
        Commands::Drive(args) => cli::execute_drive(&args, config_path).await,
        Commands::Upload(args) => cli::execute_upload(&args, config_path).await,
        Commands::Rename(args) => cli::execute_rename(&args, config_path).await,
        Commands::Config(args) => cli::execute_config(&args, config_path).await,
    }
}
