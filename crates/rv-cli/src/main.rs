//! rvx - recovery verification runs from the command line
//!
//! Exit codes: 0 when the run succeeded, 1 when it completed with failures,
//! 2 when it could not run at all.

mod config;

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use config::CliConfig;
use rv_api::rest::connect;
use rv_api::{RestBackupCatalog, RestHypervisor, RestRecoveryControl};
use rv_core::{RunError, RunSummary, SystemProbe, VerificationEngine};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    let config_arg = Arg::new("config")
        .long("config")
        .short('c')
        .default_value("rvx.toml")
        .value_parser(value_parser!(PathBuf))
        .help("Path to the configuration file");

    Command::new("rvx")
        .version(rv_core::VERSION)
        .about("Prove that backups restore, boot and answer in an isolated network")
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("run")
                .about("Recover, verify and clean up every workload in scope")
                .arg(config_arg.clone())
                .arg(
                    Arg::new("compact")
                        .long("compact")
                        .action(ArgAction::SetTrue)
                        .help("Print the summary on one line"),
                ),
        )
        .subcommand(
            Command::new("dry-run")
                .about("Discover, preflight and plan without recovering anything")
                .arg(config_arg.clone()),
        )
        .subcommand(
            Command::new("check-config")
                .about("Load and validate the configuration file")
                .arg(config_arg),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn engine(config: &CliConfig) -> Result<VerificationEngine> {
    let backup = connect(&config.api.backup).context("backup catalog connection")?;
    let hypervisor = connect(&config.api.hypervisor).context("hypervisor connection")?;
    let recovery = connect(&config.api.recovery).context("recovery control connection")?;
    let probe = SystemProbe::new().context("network probe")?;

    Ok(VerificationEngine::new(
        Arc::new(RestBackupCatalog::new(backup)),
        Arc::new(RestHypervisor::new(hypervisor)),
        Arc::new(RestRecoveryControl::new(recovery)),
        Arc::new(probe),
    ))
}

fn print_summary(summary: &RunSummary, compact: bool) -> Result<()> {
    let text = if compact {
        serde_json::to_string(summary)?
    } else {
        serde_json::to_string_pretty(summary)?
    };
    println!("{text}");
    Ok(())
}

fn config_path(args: &ArgMatches) -> PathBuf {
    args.get_one::<PathBuf>("config")
        .cloned()
        .unwrap_or_else(|| PathBuf::from("rvx.toml"))
}

/// Returns whether the run succeeded
async fn execute(matches: &ArgMatches) -> Result<bool> {
    match matches.subcommand() {
        Some(("run", args)) => {
            let config = CliConfig::load(&config_path(args))?;
            let outcome = engine(&config)?.run(config.run).await;
            match outcome {
                Ok(summary) => {
                    print_summary(&summary, args.get_flag("compact"))?;
                    if summary.cleanup_failures > 0 {
                        tracing::warn!(
                            "{} workload(s) failed cleanup; inspect inventory for leftovers",
                            summary.cleanup_failures
                        );
                    }
                    Ok(summary.overall_success)
                }
                Err(RunError::PreflightBlocked(report)) => {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                    anyhow::bail!("preflight blocked the run: {}", report.blocking_summary())
                }
                Err(e) => Err(e.into()),
            }
        }
        Some(("dry-run", args)) => {
            let config = CliConfig::load(&config_path(args))?;
            let summary = engine(&config)?.dry_run(config.run).await?;
            print_summary(&summary, false)?;
            Ok(summary.overall_success)
        }
        Some(("check-config", args)) => {
            let path = config_path(args);
            let config = CliConfig::load(&path)?;
            tracing::info!(
                "{} is valid: strategy {}, isolated network {}, {} group(s)",
                path.display(),
                config.run.strategy,
                config.run.isolated_network,
                config.run.groups.len()
            );
            Ok(true)
        }
        _ => anyhow::bail!("unknown command"),
    }
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));

    let code = match execute(&matches).await {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            tracing::error!("{:#}", e);
            2
        }
    };
    std::process::exit(code);
}
