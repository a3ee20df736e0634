mod config;
mod database;
mod monitoring;
mod notifications;
mod orchestrator;
mod pool;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::info;

use config::Config;
use monitoring::params::TemplateVariableMap;
use monitoring::{CheckContext, CheckRegistry, MonitoringExecutor};
use orchestrator::Orchestrator;

#[derive(Debug, Parser)]
#[command(version, about = "Grid monitoring and problem notification service")]
struct Cli {
    /// Config file, defaults to $XDG_CONFIG_HOME/gridwatch/config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the checks and notifications until interrupted (default)
    Run,
    /// Run one check and print its result
    Check {
        #[arg(long = "type")]
        check_type: String,
        #[arg(long, default_value = "cli")]
        grid: String,
        #[arg(long)]
        row: String,
        #[arg(long)]
        col: String,
        /// Check parameters as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Run one notification once and exit
    Notify {
        #[arg(long)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    logger::init_tracing();

    let cli = Cli::parse();
    let config = Config::from_config(cli.config.as_ref())?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            info!("{}", config);
            let pool = pool::open_pool(&config.database, config.pool_size).await?;
            Orchestrator::start(config, pool).await
        }
        Command::Check { check_type, grid, row, col, params, timeout } => {
            let params: Map<String, Value> =
                serde_json::from_str(&params).context("--params must be a JSON object")?;
            let no_vars = TemplateVariableMap::new();
            let ctx = CheckContext {
                grid_name: &grid,
                row_name: &row,
                col_name: &col,
                params: &params,
                row_vars: &no_vars,
                col_vars: &no_vars,
                timeout_seconds: timeout.unwrap_or(config.check_timeout_seconds),
            };

            let executor = MonitoringExecutor::new(CheckRegistry::with_defaults(reqwest::Client::new()));
            let result = executor.execute(&check_type, &ctx).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            // exit like a plug-in so the command can be chained into other monitors
            std::process::exit(result.status.code())
        }
        Command::Notify { name } => {
            let pool = pool::open_pool(&config.database, config.pool_size).await?;
            let orchestrator = Orchestrator::new(config, pool).await?;
            let summary = orchestrator.run_notification(&name).await?;
            info!(
                notification = %name,
                observed = summary.observed,
                notified = summary.notified,
                resolved = summary.resolved,
                "Notification run complete"
            );
            let open = orchestrator.open_problems(&name).await?;
            println!("{}", serde_json::to_string_pretty(&open)?);
            Ok(())
        }
    }
}
