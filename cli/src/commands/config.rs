// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;
use tracing::info;

use lgss_core::domain::config::GssConfigManifest;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,

        /// Print the effective manifest as YAML
        #[arg(long)]
        yaml: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./lgss-config.yaml)
        #[arg(short, long, default_value = "./lgss-config.yaml")]
        output: PathBuf,

        /// Include examples and comments
        #[arg(long)]
        examples: bool,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths, yaml } => show(config_override, paths, yaml).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, examples } => generate(output, examples).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool, as_yaml: bool) -> Result<()> {
    let config = GssConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. LGSS_CONFIG_PATH: {}",
            std::env::var("LGSS_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./lgss-config.yaml");
        println!("  4. ~/.lgss/config.yaml");
        println!("  5. /etc/lgss/config.yaml");
        println!();
    }

    if as_yaml {
        let yaml = serde_yaml::to_string(&config).context("Failed to render configuration")?;
        print!("{}", yaml);
        return Ok(());
    }

    println!("{}", "Current configuration:".bold());
    println!("  Name: {}", config.metadata.name);
    println!();

    let client = &config.spec.client;
    println!("{}", "Client:".bold());
    println!("  Upcall timeout: {}s", client.upcall_timeout_secs);
    println!("  Namespace check: {}", client.check_upcall_ns);
    println!("  Helper: {}", client.helper_path.display());
    if !client.helper_args.is_empty() {
        println!("  Helper args: {}", client.helper_args.join(" "));
    }
    println!(
        "  Helper retry: {} x {}ms",
        client.helper_max_retries, client.helper_retry_interval_ms
    );
    println!("  Reverse expire nice: {}s", client.reverse_expire_nice_secs);
    println!();

    let server = &config.spec.server;
    println!("{}", "Server:".bold());
    println!("  Upcall timeout: {}s", server.upcall_timeout_secs);
    println!("  New entry TTL: {}s", server.new_entry_ttl_secs);
    println!("  Reverse expire: {}s", server.reverse_expire_secs);
    println!("  Sequence window: {}", server.seq_window);
    println!("  Helper: {}", server.helper_path.display());
    println!(
        "  Helper wait: {} x {}ms",
        server.helper_wait_attempts, server.helper_wait_interval_ms
    );
    println!();

    println!("{}", "Garbage collection:".bold());
    if config.spec.gc.enabled {
        println!("  Interval: {}s", config.spec.gc.interval_secs);
    } else {
        println!("  {}", "disabled".dimmed());
    }
    println!();

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = GssConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: PathBuf, with_examples: bool) -> Result<()> {
    let sample = if with_examples {
        include_str!("../../templates/config-with-examples.yaml")
    } else {
        include_str!("../../templates/config-minimal.yaml")
    };

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write config to {:?}", output))?;
    info!(path = %output.display(), examples = with_examples, "sample configuration written");

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}
