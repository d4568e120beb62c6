//! Stale multipart sweep command.

use stowage_core::error::AppError;

use crate::output;

/// Abort every S3 multipart upload older than the configured age.
pub async fn execute(config_path: &str) -> Result<(), AppError> {
    let (config, manager) = super::open_manager(config_path).await?;
    let aborted = manager.sweep_stale_multipart().await?;
    output::print_success(&format!(
        "Aborted {aborted} multipart uploads older than {} hours",
        config.transfer.stale_multipart_hours
    ));
    Ok(())
}
