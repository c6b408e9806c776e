// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # LGSS CLI
//!
//! The `lgss` binary inspects configuration and the helper wire formats of
//! the secure RPC context layer.
//!
//! ## Commands
//!
//! - `lgss config show|validate|generate` - Configuration management
//! - `lgss upcall decode-request|encode-downcall|check-reply` - Helper protocol tools

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

mod commands;

use commands::{ConfigCommand, UpcallCommand};
use lgss_core::domain::config::{GssConfigManifest, ObservabilityConfig};

/// LGSS - secure RPC context tools
#[derive(Parser)]
#[command(name = "lgss")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "LGSS_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); defaults to the config file
    #[arg(long, global = true, env = "LGSS_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (text or json); defaults to the config file
    #[arg(long, global = true, env = "LGSS_LOG_FORMAT")]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Helper protocol tools
    #[command(name = "upcall")]
    Upcall {
        #[command(subcommand)]
        command: UpcallCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // an unreadable file is reported by the command itself
    let observability = GssConfigManifest::load_or_default(cli.config.clone())
        .map(|config| config.spec.observability)
        .unwrap_or_default();
    let (level, format) = logging_settings(cli.log_level, cli.log_format, observability);
    init_logging(&level, &format)?;

    match cli.command {
        Some(Commands::Config { command }) => {
            commands::config::handle_command(command, cli.config).await
        }
        Some(Commands::Upcall { command }) => commands::upcall::handle_command(command).await,
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Command line flags win over the config file's observability section.
fn logging_settings(
    level: Option<String>,
    format: Option<String>,
    observability: ObservabilityConfig,
) -> (String, String) {
    (
        level.unwrap_or(observability.log_level),
        format.unwrap_or(observability.log_format),
    )
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        builder.json().init();
    } else {
        builder.compact().init();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_supplies_logging_defaults() {
        let observability = ObservabilityConfig {
            log_level: "debug".to_string(),
            log_format: "json".to_string(),
        };
        assert_eq!(
            logging_settings(None, None, observability.clone()),
            ("debug".to_string(), "json".to_string())
        );
        assert_eq!(
            logging_settings(Some("warn".to_string()), None, observability),
            ("warn".to_string(), "json".to_string())
        );
        assert_eq!(
            logging_settings(None, None, ObservabilityConfig::default()),
            ("info".to_string(), "text".to_string())
        );
    }
}
