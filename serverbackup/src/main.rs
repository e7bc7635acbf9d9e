//! serverbackup - main entry point
//!
//! Loads one job configuration and runs it to completion.

use clap::Parser;
use serverbackup::config::{Config, DEFAULT_CONFIG_PATH};
use serverbackup::{utils, BackupError, BackupExecutor};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = utils::logger::init(&args.log_level) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    tracing::info!(
        "Starting serverbackup v{} (config: {})",
        env!("CARGO_PKG_VERSION"),
        args.config.display()
    );

    match run(&args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = %e, "Backup run aborted");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(args: &Args) -> Result<u8, BackupError> {
    let plan = Config::from_file(&args.config)?.validate()?;

    if args.check {
        tracing::info!(
            job = %plan.name,
            backup_dir = %plan.backup_dir.display(),
            retention = ?plan.retention,
            upload = ?plan.upload.as_ref().map(|t| t.destination()),
            encrypted = plan.encryption.is_some(),
            "Configuration is valid"
        );
        return Ok(0);
    }

    let report = BackupExecutor::new(plan).execute().await?;
    Ok(report.exit_code())
}
