//! Manual transfer invocations.

use std::sync::Arc;

use clap::{Args, Subcommand};
use serde::Serialize;
use tabled::Tabled;

use stowage_core::error::AppError;
use stowage_worker::{InvocationReport, TransferWorker};

use crate::output::{self, OutputFormat};

/// Arguments for transfer commands
#[derive(Debug, Args)]
pub struct TransferArgs {
    /// Transfer subcommand
    #[command(subcommand)]
    pub command: TransferCommand,
}

/// Transfer subcommands
#[derive(Debug, Subcommand)]
pub enum TransferCommand {
    /// Run one worker invocation, as the daemon would
    Step {
        /// Only advance this package
        #[arg(short, long)]
        package: Option<i64>,
    },
}

/// One step of an invocation
#[derive(Debug, Serialize, Tabled)]
struct StepRow {
    /// Package ID
    package: i64,
    /// Storage ID
    storage: i64,
    /// What the step did
    outcome: String,
}

/// Execute transfer commands
pub async fn execute(
    args: &TransferArgs,
    config_path: &str,
    format: OutputFormat,
) -> Result<(), AppError> {
    let (config, manager) = super::open_manager(config_path).await?;
    let holder = format!("stowage-cli-{}", std::process::id());
    let worker = TransferWorker::new(Arc::new(manager), holder, config.transfer);

    match &args.command {
        TransferCommand::Step { package } => {
            let reports = match package {
                Some(id) => vec![worker.run_package(*id).await?],
                None => worker.run_pending().await?,
            };
            let rows: Vec<StepRow> = reports.iter().flat_map(step_rows).collect();
            output::print_list(&rows, format);
            if format == OutputFormat::Table {
                for report in &reports {
                    output::print_kv(&format!("Package {}", report.package_id), report.status.as_str());
                }
            }
        }
    }

    Ok(())
}

fn step_rows(report: &InvocationReport) -> Vec<StepRow> {
    let mut rows: Vec<StepRow> = report
        .steps
        .iter()
        .map(|(storage, outcome)| StepRow {
            package: report.package_id,
            storage: *storage,
            outcome: outcome.to_string(),
        })
        .collect();
    rows.extend(report.skipped.iter().map(|storage| StepRow {
        package: report.package_id,
        storage: *storage,
        outcome: "busy".to_string(),
    }));
    rows
}
