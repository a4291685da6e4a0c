//! The `schema` subcommand: print JSON Schemas for the public record types.

use clap::{Args, ValueEnum};
use schemars::schema_for;

use crate::prelude::*;

/// Which schema to print.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "kebab-case")]
pub enum SchemaKind {
    /// The enriched OCR response.
    Response,

    /// The durable job record.
    Job,

    /// The event-batch outcome.
    BatchOutcome,

    /// The service health report.
    Health,

    /// The reconstruction capability status.
    ReconStatus,
}

/// Command line arguments for the `schema` subcommand.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// The schema to print.
    #[clap(value_enum)]
    pub kind: SchemaKind,
}

/// The `schema` subcommand.
pub async fn cmd_schema(opts: &SchemaOpts) -> Result<()> {
    let schema = match opts.kind {
        SchemaKind::Response => schema_for!(crate::processor::ProcessedDocument),
        SchemaKind::Job => schema_for!(crate::jobs::JobRecord),
        SchemaKind::BatchOutcome => schema_for!(crate::events::BatchOutcome),
        SchemaKind::Health => schema_for!(crate::health::HealthReport),
        SchemaKind::ReconStatus => schema_for!(crate::capabilities::ReconStatus),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&schema).context("Failed to serialize schema")?
    );
    Ok(())
}
