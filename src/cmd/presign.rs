//! The `presign` subcommand: issue time-limited upload credentials.

use clap::Args;

use crate::config::Settings;
use crate::prelude::*;
use crate::storage::StorageService;

use super::print_json;

/// Command line arguments for the `presign` subcommand.
#[derive(Debug, Args)]
pub struct PresignOpts {
    /// The object key the client will upload to.
    pub key: String,

    /// Content type the upload is constrained to.
    #[clap(long, default_value = "application/octet-stream")]
    pub content_type: String,

    /// Ticket validity, in seconds.
    #[clap(long, default_value_t = 3600)]
    pub expires_in: u64,
}

/// The `presign` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_presign(settings: Arc<Settings>, opts: &PresignOpts) -> Result<()> {
    let aws = crate::aws::load_aws_config(&settings.aws_region).await;
    let storage = StorageService::new(&aws, &settings);
    let ticket = storage
        .issue_upload_ticket(&opts.key, &opts.content_type, opts.expires_in)
        .await?;
    print_json(&ticket)
}
