use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

mod config;
mod telemetry;

use config::Config;

#[derive(Parser)]
#[command(about = "Upserts CRM contacts and enrolls them into cadences")]
struct Cli {
    /// YAML config file. Defaults and environment variables apply without it.
    #[arg(long, env = "ENROLLER_CONFIG_FILE")]
    config_file: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config_file.as_deref(), |key| std::env::var(key).ok()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading config: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _telemetry = match telemetry::init(&config.common) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error initializing telemetry: {e}");
            return ExitCode::FAILURE;
        }
    };

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!("Starting enroller");
    match rt.block_on(enrollment::run(config.enrollment)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Enroller stopped");
            ExitCode::FAILURE
        }
    }
}
