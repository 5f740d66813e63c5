use anyhow::Result;
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;
mod config;
mod output;

use cli::Cli;
use commands::run_cli;
use config::{ensure_default_config_exists, load_app_config};
use output::output_error;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    if cli.config.is_none() {
        if let Err(err) = ensure_default_config_exists() {
            warn!(error = %err, "config bootstrap failed");
        }
    }
    let config = match load_app_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => return output_error(&format!("{:#}", err)),
    };
    let rt = tokio::runtime::Runtime::new()?;
    if let Err(err) = run_cli(&rt, cli.command, &config) {
        return output_error(&format!("{:#}", err));
    }
    Ok(())
}

/// Logs go to stderr so stdout stays machine readable.
fn init_tracing() {
    let filter = std::env::var("MERGEMAIL_LOG")
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
