//! The `submit` subcommand: durably enqueue a job.

use base64::{Engine as _, prelude::BASE64_STANDARD};
use clap::Args;
use redis::aio::ConnectionManager;

use crate::config::Settings;
use crate::jobs::{JobRecord, submit_job};
use crate::prelude::*;

use super::print_json;

/// Command line arguments for the `submit` subcommand.
#[derive(Debug, Args)]
pub struct SubmitOpts {
    /// The image file to enqueue.
    pub input_path: PathBuf,

    /// Document type recorded on the job.
    #[clap(long)]
    pub doc_type: Option<String>,

    /// Store only the file path on the job record instead of inlining the
    /// bytes. The worker must share the filesystem.
    #[clap(long)]
    pub by_path: bool,
}

/// The `submit` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_submit(settings: Arc<Settings>, opts: &SubmitOpts) -> Result<()> {
    let client = redis::Client::open(settings.redis_url.as_str())
        .context("Invalid Redis URL")?;
    let mut conn = ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;

    let mut record = JobRecord::new_queued();
    record.doc_type = opts.doc_type.clone();
    if opts.by_path {
        let path = tokio::fs::canonicalize(&opts.input_path)
            .await
            .with_context(|| format!("Failed to resolve {:?}", opts.input_path))?;
        record.image_path = Some(path);
    } else {
        let bytes = tokio::fs::read(&opts.input_path)
            .await
            .with_context(|| format!("Failed to read {:?}", opts.input_path))?;
        record.image_bytes = Some(BASE64_STANDARD.encode(bytes));
    }

    submit_job(&mut conn, &record).await?;
    print_json(&json!({
        "job_id": record.id,
        "status": "QUEUED",
        "check_url": format!("/api/v1/jobs/{}", record.id),
    }))
}
