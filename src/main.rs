//! devrun CLI - device test invocation harness.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use devrun::command::execute_command;
use devrun::config::{self, DeviceTarget};
use devrun::invocation::Configuration;
use devrun::listener::CollectingListener;
use devrun::logging::{HostLog, init_logging};
use devrun::report::{ConsoleReporter, JunitReporter, LogSaver, RunSummary, print_summary};

#[derive(Parser)]
#[command(name = "devrun")]
#[command(about = "Device test invocation harness", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "devrun.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured invocation
    Run {
        /// Override the number of shards
        #[arg(short, long)]
        shard_count: Option<usize>,

        /// Let shards of non-shardable modules pull from a shared pool
        #[arg(long)]
        dynamic: bool,

        /// List tests without executing them
        #[arg(long)]
        collect_only: bool,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let host_log = HostLog::new();
    init_logging(cli.verbose, &host_log)?;

    match cli.command {
        Commands::Run {
            shard_count,
            dynamic,
            collect_only,
            junit,
            json,
        } => {
            let overrides = RunOverrides {
                shard_count,
                dynamic,
                collect_only,
                junit,
            };
            let code = run(&cli.config, overrides, json, cli.verbose, &host_log).await?;
            std::process::exit(code);
        }
        Commands::Validate => validate(&cli.config),
        Commands::Init => init_config(&cli.config),
    }
}

struct RunOverrides {
    shard_count: Option<usize>,
    dynamic: bool,
    collect_only: bool,
    junit: Option<PathBuf>,
}

async fn run(
    config_path: &Path,
    overrides: RunOverrides,
    json: bool,
    verbose: bool,
    host_log: &HostLog,
) -> Result<i32> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    if let Some(shard_count) = overrides.shard_count {
        config.invocation.shard_count = Some(shard_count);
    }
    config.invocation.dynamic_modules |= overrides.dynamic;
    config.invocation.collect_only |= overrides.collect_only;
    config::validate_config(&config)?;

    info!("Loaded configuration from {}", config_path.display());

    let mut configuration = Configuration::from_config(&config)?;
    let collector = Arc::new(CollectingListener::new());

    if !json {
        configuration
            .listeners
            .push(Arc::new(ConsoleReporter::new(verbose)));
    }
    if config.report.junit {
        let junit_path = overrides
            .junit
            .unwrap_or_else(|| config.report.output_dir.join(&config.report.junit_file));
        configuration.listeners.push(Arc::new(
            JunitReporter::new(junit_path).with_name(&config.invocation.name),
        ));
    }
    if config.report.save_logs {
        configuration
            .listeners
            .push(Arc::new(LogSaver::new(config.report.output_dir.join("logs"))));
    }
    configuration.listeners.push(collector.clone());

    let outcome = execute_command(&configuration, host_log).await;
    info!(
        "Command finished with {:?} after {} attempt(s), {} rescheduled invocation(s)",
        outcome.status, outcome.attempts, outcome.rescheduled_invocations
    );

    let summary = RunSummary::from_listener(&collector);
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    let code = match outcome.status.exit_code() {
        0 if !summary.success() => 1,
        code => code,
    };
    Ok(code)
}

fn validate(config_path: &Path) -> Result<()> {
    let result = config::load_config(config_path).and_then(|config| {
        config::validate_config(&config)?;
        Ok(config)
    });
    match result {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Name: {}", config.invocation.name);
            match config.invocation.shard_count {
                Some(count) => println!("  Shards: {}", count),
                None => println!("  Shards: none"),
            }
            println!("  Dynamic modules: {}", config.invocation.dynamic_modules);
            for device in &config.devices {
                let kind = match &device.target {
                    DeviceTarget::Local(_) => "local",
                    DeviceTarget::Stub(_) => "stub",
                };
                println!(
                    "  Device: {} ({}, serial {})",
                    device.name,
                    kind,
                    device.target.serial()
                );
            }
            println!("  Modules: {}", config.modules.len());
            println!("  Tests: {}", config.tests.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

const INIT_TEMPLATE: &str = r#"# devrun configuration file

[invocation]
name = "devrun"
# shard_count = 2
dynamic_modules = false
max_command_retries = 0

[[devices]]
name = "primary"
[devices.target]
type = "local"
working_dir = "."
shell = "/bin/sh"
[devices.build]
build_id = "local"

[[modules]]
name = "smoke"
[[modules.tests]]
name = "basic"
cases = [
  { name = "true", command = "true" },
  { name = "echo", command = "echo hello" },
]

[report]
output_dir = "devrun-results"
junit = true
junit_file = "junit.xml"
"#;

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
        std::process::exit(1);
    }

    std::fs::write(path, INIT_TEMPLATE)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  devrun run");

    Ok(())
}
