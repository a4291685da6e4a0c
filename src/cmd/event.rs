//! The `handle-event` subcommand: feed an object-store event payload
//! through the trigger handler.

use clap::Args;
use uuid::Uuid;

use crate::config::Settings;
use crate::events::{EventTriggerHandler, S3Event};
use crate::prelude::*;
use crate::storage::StorageService;
use crate::textract::TextractService;

use super::print_json;

/// Command line arguments for the `handle-event` subcommand.
#[derive(Debug, Args)]
pub struct EventOpts {
    /// Path to the event payload (a `Records[]` JSON document).
    pub event_path: PathBuf,
}

/// The `handle-event` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_handle_event(settings: Arc<Settings>, opts: &EventOpts) -> Result<()> {
    let raw = tokio::fs::read_to_string(&opts.event_path)
        .await
        .with_context(|| format!("Failed to read {:?}", opts.event_path))?;
    let event: S3Event =
        serde_json::from_str(&raw).context("Failed to parse event payload")?;

    let aws = crate::aws::load_aws_config(&settings.aws_region).await;
    let textract = Arc::new(TextractService::new(&aws, settings.aws_max_retries));
    let storage = Arc::new(StorageService::new(&aws, &settings));
    let handler =
        EventTriggerHandler::new(textract, storage, settings.output_prefix.clone());

    let request_id = Uuid::new_v4().to_string();
    let outcome = handler.handle(&event, &request_id).await;
    print_json(&outcome)
}
