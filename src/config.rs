//! Service configuration, loaded from the environment.
//!
//! All settings may be set in a standard `.env` file (loaded in `main`) or as
//! ordinary environment variables. Configuration is loaded exactly once per
//! process and shared as an immutable [`Settings`] value.

use std::env;

use crate::prelude::*;

/// Which environment are we running in?
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    /// Local development. Relaxed validation.
    #[default]
    Development,

    /// Production. Requires monitoring and at least one AI provider, and
    /// forbids wildcard CORS origins.
    Production,
}

impl Environment {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "development" => Ok(Environment::Development),
            "production" => Ok(Environment::Production),
            other => Err(anyhow!("Unknown environment: {:?}", other)),
        }
    }
}

/// Application settings.
///
/// Field names correspond to `SCREAMING_SNAKE_CASE` environment variables
/// (`ocr_api_key` ← `OCR_API_KEY`, and so on).
#[derive(Debug, Clone)]
pub struct Settings {
    /// Secret key gating the inbound OCR endpoints.
    pub ocr_api_key: Option<String>,

    /// Header carrying the API key.
    pub api_key_header_name: String,

    /// S3 bucket for uploads and persisted results. When unset, the storage
    /// adapter runs in a degraded no-op mode.
    pub s3_bucket_name: Option<String>,

    /// Key prefix for event-trigger outputs.
    pub output_prefix: String,

    /// Retry cap for AWS operations (S3, Textract). Minimum 1.
    pub aws_max_retries: u32,

    /// AWS region for cloud adapters.
    pub aws_region: String,

    /// Default reconstruction flag, applied when a request does not override.
    pub enable_reconstruction: bool,

    /// Number of passes in the iterative OCR loop.
    pub ocr_iterations: usize,

    /// Confidence below which the engine falls back to region-based OCR.
    pub confidence_threshold: f64,

    /// Maximum accepted input size, in MiB.
    pub max_image_size_mb: usize,

    pub environment: Environment,

    /// Allowed CORS origins for the HTTP surface.
    pub allowed_origins: Vec<String>,

    // AI vision providers. Presence of a credential registers the provider.
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub hugging_face_api_key: Option<String>,
    pub perplexity_api_key: Option<String>,

    // Learned-pattern store (cloud mode).
    pub supabase_url: Option<String>,
    pub supabase_service_role: Option<String>,

    /// Whether the pattern store keeps a local fallback file.
    pub use_local_fallback: bool,

    /// Path of the local learned-pattern file.
    pub local_data_path: PathBuf,

    /// Deadline for fire-and-forget cloud pattern writes, in seconds.
    pub cloud_write_deadline_secs: u64,

    /// Redis connection URL for the job queue and durable job records.
    pub redis_url: String,

    // Observability. Initialized by the serving layer, not by the pipeline.
    pub sentry_dsn: Option<String>,
    pub azure_application_insights_connection_string: Option<String>,

    // Consumed by the offline active-learning job, carried here so a single
    // `.env` configures the whole deployment.
    pub al_cycle_samples: usize,
    pub al_n_clusters: usize,
    pub reference_baseline_path: Option<PathBuf>,
    pub drift_report_path: Option<PathBuf>,
}

impl Settings {
    /// Load settings from the environment and validate them.
    pub fn from_env() -> Result<Arc<Self>> {
        let settings = Self {
            ocr_api_key: var_opt("OCR_API_KEY"),
            api_key_header_name: var_or("API_KEY_HEADER_NAME", "X-API-KEY"),
            s3_bucket_name: var_opt("S3_BUCKET_NAME"),
            output_prefix: var_or("OUTPUT_PREFIX", "textract_outputs/"),
            aws_max_retries: var_parsed("AWS_MAX_RETRIES", 3u32)?.max(1),
            aws_region: var_or("AWS_REGION", "us-east-1"),
            enable_reconstruction: var_parsed("ENABLE_RECONSTRUCTION", false)?,
            ocr_iterations: var_parsed("OCR_ITERATIONS", 3usize)?,
            confidence_threshold: var_parsed("CONFIDENCE_THRESHOLD", 0.5f64)?,
            max_image_size_mb: var_parsed("MAX_IMAGE_SIZE_MB", 10usize)?,
            environment: Environment::parse(&var_or("ENVIRONMENT", "development"))?,
            allowed_origins: var_list("ALLOWED_ORIGINS", "*"),
            openai_api_key: var_opt("OPENAI_API_KEY"),
            gemini_api_key: var_opt("GEMINI_API_KEY"),
            hugging_face_api_key: var_opt("HUGGING_FACE_API_KEY"),
            perplexity_api_key: var_opt("PERPLEXITY_API_KEY"),
            supabase_url: var_opt("SUPABASE_URL"),
            supabase_service_role: var_opt("SUPABASE_SERVICE_ROLE"),
            use_local_fallback: var_parsed("USE_LOCAL_FALLBACK", true)?,
            local_data_path: PathBuf::from(var_or(
                "LOCAL_DATA_PATH",
                "data/learning_patterns.json",
            )),
            cloud_write_deadline_secs: var_parsed("CLOUD_WRITE_DEADLINE_SECS", 2u64)?,
            redis_url: var_or("REDIS_URL", "redis://localhost:6379/"),
            sentry_dsn: var_opt("SENTRY_DSN"),
            azure_application_insights_connection_string: var_opt(
                "AZURE_APPLICATION_INSIGHTS_CONNECTION_STRING",
            ),
            al_cycle_samples: var_parsed("AL_CYCLE_SAMPLES", 100usize)?,
            al_n_clusters: var_parsed("AL_N_CLUSTERS", 8usize)?,
            reference_baseline_path: var_opt("REFERENCE_BASELINE_PATH")
                .map(PathBuf::from),
            drift_report_path: var_opt("DRIFT_REPORT_PATH").map(PathBuf::from),
        };
        settings.validate()?;
        Ok(Arc::new(settings))
    }

    /// Does at least one AI vision credential exist?
    pub fn has_ai_provider(&self) -> bool {
        self.openai_api_key.is_some()
            || self.gemini_api_key.is_some()
            || self.hugging_face_api_key.is_some()
            || self.perplexity_api_key.is_some()
    }

    /// Is the Supabase cloud pattern backend configured?
    pub fn supabase_configured(&self) -> bool {
        self.supabase_url.is_some() && self.supabase_service_role.is_some()
    }

    fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.ocr_api_key.is_none() {
            missing.push("OCR_API_KEY");
        }
        if self.environment == Environment::Production {
            if self.sentry_dsn.is_none() {
                missing.push("SENTRY_DSN");
            }
            if !self.has_ai_provider() {
                missing.push("an AI provider key (openai/gemini/huggingface/perplexity)");
            }
            if self.allowed_origins.iter().any(|o| o == "*") {
                return Err(anyhow!(
                    "Wildcard ALLOWED_ORIGINS is forbidden in production"
                ));
            }
        }
        if !missing.is_empty() {
            return Err(anyhow!("Missing required settings: {}", missing.join(", ")));
        }
        Ok(())
    }
}

/// Get an optional environment variable, treating empty strings as unset.
fn var_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

/// Get an environment variable, or a default.
fn var_or(name: &str, default: &str) -> String {
    var_opt(name).unwrap_or_else(|| default.to_owned())
}

/// Get a parsed environment variable, or a default.
fn var_parsed<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var_opt(name) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("Failed to parse {name}={raw:?}")),
        None => Ok(default),
    }
}

/// Get a comma-separated list variable, or a default.
fn var_list(name: &str, default: &str) -> Vec<String> {
    var_or(name, default)
        .split(',')
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .collect()
}
