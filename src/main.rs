use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::config::Settings;
use self::prelude::*;

mod aws;
mod capabilities;
mod cmd;
mod config;
mod confidence;
mod data_url;
mod engine;
mod events;
mod health;
mod imaging;
mod jobs;
mod layout;
mod patterns;
mod prelude;
mod processor;
mod providers;
mod recon;
mod retry;
mod storage;
mod textract;

/// Iterative OCR orchestration and document intelligence.
#[derive(Debug, Parser)]
#[clap(
    version,
    after_help = r#"
Environment Variables:
  - OCR_API_KEY (required): Secret gating the OCR surface.
  - S3_BUCKET_NAME (optional): Bucket for persisted uploads and results.
  - OPENAI_API_KEY, GEMINI_API_KEY, HUGGING_FACE_API_KEY,
    PERPLEXITY_API_KEY (optional): Presence registers the AI vision provider.
  - SUPABASE_URL, SUPABASE_SERVICE_ROLE (optional): Cloud pattern store.
  - REDIS_URL (optional): Job queue, defaults to redis://localhost:6379/.

  Standard AWS environment variables and credential files are used for
  S3 and Textract.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Run the OCR pipeline on a single image file.
    Process(cmd::process::ProcessOpts),
    /// Durably enqueue a job for asynchronous processing.
    Submit(cmd::submit::SubmitOpts),
    /// Run the queue-worker loop until interrupted.
    Worker,
    /// Feed an object-store upload event through the trigger handler.
    HandleEvent(cmd::event::EventOpts),
    /// Issue time-limited upload credentials for an object key.
    Presign(cmd::presign::PresignOpts),
    /// Probe the backing services and print a health report.
    Health,
    /// Print the reconstruction capability status.
    ReconStatus,
    /// Print JSON schemas for public record types.
    Schema(cmd::schema::SchemaOpts),
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main().await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main() -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Schema printing needs no configuration; everything else loads and
    // validates settings exactly once.
    if let Cmd::Schema(schema_opts) = &opts.subcmd {
        return cmd::schema::cmd_schema(schema_opts).await;
    }
    let settings = Settings::from_env()?;

    match &opts.subcmd {
        Cmd::Process(process_opts) => {
            cmd::process::cmd_process(settings, process_opts).await?;
        }
        Cmd::Submit(submit_opts) => {
            cmd::submit::cmd_submit(settings, submit_opts).await?;
        }
        Cmd::Worker => {
            cmd::worker::cmd_worker(settings).await?;
        }
        Cmd::HandleEvent(event_opts) => {
            cmd::event::cmd_handle_event(settings, event_opts).await?;
        }
        Cmd::Presign(presign_opts) => {
            cmd::presign::cmd_presign(settings, presign_opts).await?;
        }
        Cmd::Health => {
            cmd::health::cmd_health(settings).await?;
        }
        Cmd::ReconStatus => {
            cmd::health::cmd_recon_status(settings).await?;
        }
        Cmd::Schema(_) => unreachable!("handled above"),
    }
    Ok(())
}
