//! The `process` subcommand: run the pipeline on one file.

use clap::Args;
use uuid::Uuid;

use crate::config::Settings;
use crate::prelude::*;
use crate::processor::{FileUpload, OcrProcessor, ProcessingFlags};

use super::{build_pipeline, print_json};

/// Command line arguments for the `process` subcommand.
#[derive(Debug, Args)]
pub struct ProcessOpts {
    /// The image file to process.
    pub input_path: PathBuf,

    /// Run the reconstruction preprocessor before OCR.
    #[clap(long)]
    pub reconstruct: bool,

    /// Use the AI-reconstruction path with learned context.
    #[clap(long)]
    pub advanced: bool,

    /// Document type, used to retrieve learned patterns.
    #[clap(long, default_value = "generic")]
    pub doc_type: String,
}

/// The `process` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_process(settings: Arc<Settings>, opts: &ProcessOpts) -> Result<()> {
    let pipeline = build_pipeline(&settings).await?;
    let processor = OcrProcessor::new(
        pipeline.engine,
        pipeline.storage,
        settings.enable_reconstruction,
    );

    let bytes = tokio::fs::read(&opts.input_path)
        .await
        .with_context(|| format!("Failed to read {:?}", opts.input_path))?;
    let filename = opts
        .input_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_owned());

    // Sniff the content type from the bytes; fall back to the extension.
    let content_type = infer::get(&bytes)
        .map(|kind| kind.mime_type().to_owned())
        .unwrap_or_else(|| {
            mime_guess::from_path(&opts.input_path)
                .first_or_octet_stream()
                .to_string()
        });

    let request_id = Uuid::new_v4().to_string();
    let document = processor
        .process_file(
            FileUpload {
                filename,
                content_type,
                bytes,
            },
            ProcessingFlags {
                reconstruct: opts.reconstruct,
                advanced: opts.advanced,
                doc_type: Some(opts.doc_type.clone()),
            },
            &request_id,
        )
        .await?;

    print_json(&document)
}
