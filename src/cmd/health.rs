//! The `health` and `recon-status` subcommands.

use crate::capabilities::ReconStatus;
use crate::config::Settings;
use crate::patterns::PatternStore;
use crate::prelude::*;
use crate::storage::StorageService;

use super::print_json;

/// The `health` subcommand: probe the backing services and report.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_health(settings: Arc<Settings>) -> Result<()> {
    let aws = crate::aws::load_aws_config(&settings.aws_region).await;
    let storage = StorageService::new(&aws, &settings);
    let patterns = PatternStore::new(&settings);
    let report = crate::health::check(&settings, &storage, &patterns).await;
    print_json(&report)
}

/// The `recon-status` subcommand: report the reconstruction capability.
pub async fn cmd_recon_status(settings: Arc<Settings>) -> Result<()> {
    print_json(&ReconStatus::current(settings.enable_reconstruction))
}
