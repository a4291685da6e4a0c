//! Aggregated service-health snapshot for the `/health` surface.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;

use crate::config::Settings;
use crate::patterns::PatternStore;
use crate::prelude::*;
use crate::storage::StorageService;

/// Per-dependency health flags.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct ServiceHealth {
    pub s3: bool,
    pub supabase: bool,
    pub openai: bool,
    pub gemini: bool,
}

/// The overall health report.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct HealthReport {
    /// `"healthy"` or `"degraded"`.
    pub status: String,

    pub timestamp: DateTime<Utc>,

    pub services: ServiceHealth,
}

/// Probe the backing services. Only an object-store failure degrades the
/// overall status; provider flags report credential presence.
pub async fn check(
    settings: &Settings,
    storage: &StorageService,
    patterns: &PatternStore,
) -> HealthReport {
    let (s3, supabase) = futures::join!(storage.health(), patterns.health());
    let status = if s3 { "healthy" } else { "degraded" };
    HealthReport {
        status: status.to_owned(),
        timestamp: Utc::now(),
        services: ServiceHealth {
            s3,
            supabase,
            openai: settings.openai_api_key.is_some(),
            gemini: settings.gemini_api_key.is_some(),
        },
    }
}
