//! AI vision providers.
//!
//! Each provider exposes one small operation: reconstruct the text content
//! of a document image. The set owns a single outbound HTTP client shared by
//! every registered provider, and the registration order defines the
//! fallback order.

use keen_retry::RetryResult;
use rand::Rng as _;
use reqwest::StatusCode;

use crate::config::Settings;
use crate::layout::LayoutKind;
use crate::prelude::*;
use crate::retry::{IntoRetryResult as _, IsKnownTransient as _, is_transient_status};

pub mod gemini;
pub mod huggingface;
pub mod openai;
pub mod perplexity;

/// How many consecutive rate-limit waits we tolerate before giving up.
/// Rate-limit responses don't consume ordinary attempts, so this is the
/// backstop that keeps a permanently throttled key from looping forever.
const MAX_RATE_LIMIT_WAITS: u32 = 8;

/// Base prompt for every reconstruction request.
const BASE_PROMPT: &str = "Analyze this document image. Identify any obscured, \
    pixelated, or layered parts. Reconstruct the underlying text and structure \
    pixel-by-pixel in your understanding and provide the full corrected text. \
    Eliminate any noise or overlays.";

/// An error from a single provider call.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The provider is missing a credential or required setting.
    #[error("Provider not configured: {0}")]
    ConfigMissing(String),

    /// A non-retryable network or TLS failure, or a retryable one that
    /// exhausted its attempt budget.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The provider kept rate-limiting us past our patience.
    #[error("Rate limited after repeated backoff")]
    RateLimited,

    /// The provider answered with a non-success HTTP status.
    #[error("HTTP status {code}: {body}")]
    HttpStatus { code: u16, body: String },

    /// The response decoded, but its shape diverged from the contract.
    #[error("Failed to parse provider response: {0}")]
    ParseFailure(String),

    /// Anything else.
    #[error("Unexpected provider failure: {0}")]
    Unknown(String),
}

/// A successful reconstruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reconstruction {
    /// The reconstructed document text.
    pub text: String,

    /// The model that produced it.
    pub model: String,
}

/// Interface trait for AI vision providers.
#[async_trait]
pub trait VisionProvider: Send + Sync + 'static {
    /// The registration name of this provider.
    fn name(&self) -> &'static str;

    /// Reconstruct the text content of a document image.
    async fn reconstruct(
        &self,
        image: &[u8],
        prompt: &str,
    ) -> Result<Reconstruction, ProviderError>;
}

/// Shared request policy for provider HTTP calls.
#[derive(Debug, Clone)]
pub struct RequestPolicy {
    /// Attempts before a transient failure becomes terminal.
    pub max_attempts: u32,

    /// Timeout applied to each individual attempt.
    pub per_attempt_timeout: Duration,
}

impl Default for RequestPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            per_attempt_timeout: Duration::from_secs(60),
        }
    }
}

/// POST a JSON request with the shared retry policy and decode the response
/// body as JSON.
///
/// Transient transport failures and 502/503/504 responses consume attempts;
/// HTTP 429 backs off without consuming an attempt. Other non-success
/// statuses surface immediately as [`ProviderError::HttpStatus`].
pub(crate) async fn request_json_with_retry<F>(
    policy: &RequestPolicy,
    build: F,
) -> Result<Value, ProviderError>
where
    F: Fn() -> reqwest::RequestBuilder + Send + Sync,
{
    let mut failures = 0u32;
    let mut rate_limit_waits = 0u32;

    loop {
        let send_result = build()
            .timeout(policy.per_attempt_timeout)
            .send()
            .await;

        let response = match send_result.into_retry_result(|e| e.is_known_transient()) {
            RetryResult::Ok { output, .. } => output,
            RetryResult::Transient { error, .. } => {
                failures += 1;
                if failures >= policy.max_attempts {
                    return Err(ProviderError::Transport(format!(
                        "HTTP error after {} attempts: {error}",
                        policy.max_attempts
                    )));
                }
                sleep_full_jitter(failures + rate_limit_waits).await;
                continue;
            }
            RetryResult::Fatal { error, .. } => {
                return Err(ProviderError::Transport(error.to_string()));
            }
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            rate_limit_waits += 1;
            if rate_limit_waits > MAX_RATE_LIMIT_WAITS {
                return Err(ProviderError::RateLimited);
            }
            warn!("Rate limited, backing off (wait {rate_limit_waits})");
            sleep_full_jitter(failures + rate_limit_waits).await;
            continue;
        }
        if is_transient_status(status) {
            failures += 1;
            if failures >= policy.max_attempts {
                let body = response.text().await.unwrap_or_default();
                return Err(ProviderError::HttpStatus {
                    code: status.as_u16(),
                    body,
                });
            }
            sleep_full_jitter(failures + rate_limit_waits).await;
            continue;
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("HTTP status error: {status} | body: {body}");
            return Err(ProviderError::HttpStatus {
                code: status.as_u16(),
                body,
            });
        }

        return response
            .json::<Value>()
            .await
            .map_err(|e| ProviderError::ParseFailure(e.to_string()));
    }
}

/// Sleep for a full-jitter exponential backoff: uniform in [0, 2^n) seconds.
async fn sleep_full_jitter(n: u32) {
    let ceiling = 2f64.powi(n.min(6) as i32);
    let secs = rand::thread_rng().gen_range(0.0..ceiling);
    tokio::time::sleep(Duration::from_secs_f64(secs)).await;
}

/// Learned context injected into the reconstruction prompt.
#[derive(Debug, Clone, Default)]
pub struct ReconstructionContext {
    /// Font observations from similar documents.
    pub font_metadata: Option<String>,

    /// Accuracy of previous similar reconstructions.
    pub accuracy_score: Option<f64>,

    /// Classified layout of this document.
    pub layout_type: LayoutKind,

    /// How many content regions were detected.
    pub region_count: usize,
}

/// Build the reconstruction prompt, with learned context appended when
/// available.
pub fn build_prompt(context: Option<&ReconstructionContext>) -> String {
    let Some(ctx) = context else {
        return BASE_PROMPT.to_owned();
    };
    let font_meta = ctx
        .font_metadata
        .as_deref()
        .unwrap_or("No font metadata available");
    let accuracy = ctx
        .accuracy_score
        .map(|s| s.to_string())
        .unwrap_or_else(|| "N/A".to_owned());
    format!(
        "{BASE_PROMPT}\n\nContext from similar documents: {font_meta}. \
         Accuracy of previous similar reconstructions: {accuracy}."
    )
}

/// An error from the provider set as a whole.
#[derive(Debug, thiserror::Error)]
pub enum ProviderSetError {
    #[error("No AI providers configured")]
    NoProvidersConfigured,

    #[error("All AI providers failed")]
    AllFailed,

    /// The primary provider failed and fallback was disabled.
    #[error(transparent)]
    Provider(ProviderError),
}

/// Uniform interface over the registered AI vision backends.
///
/// Owns the shared HTTP client; providers hold cheap handles to it. Dropping
/// the set tears the client down exactly once.
pub struct VisionProviderSet {
    providers: Vec<Box<dyn VisionProvider>>,
    #[allow(dead_code)]
    client: reqwest::Client,
}

impl VisionProviderSet {
    /// Register providers for every credential present in configuration.
    /// Registration order is the fallback order.
    pub fn from_settings(settings: &Settings) -> Self {
        let client = reqwest::Client::new();
        let policy = RequestPolicy::default();
        let mut providers: Vec<Box<dyn VisionProvider>> = Vec::new();

        if let Some(key) = &settings.openai_api_key {
            providers.push(Box::new(openai::OpenAiVision::new(
                client.clone(),
                key.clone(),
                policy.clone(),
            )));
        }
        if let Some(key) = &settings.gemini_api_key {
            providers.push(Box::new(gemini::GeminiVision::new(
                client.clone(),
                key.clone(),
                policy.clone(),
            )));
        }
        if let Some(key) = &settings.hugging_face_api_key {
            providers.push(Box::new(huggingface::HuggingFaceVision::new(
                client.clone(),
                key.clone(),
                policy.clone(),
            )));
        }
        if let Some(key) = &settings.perplexity_api_key {
            providers.push(Box::new(perplexity::PerplexityVision::new(
                client.clone(),
                key.clone(),
                policy.clone(),
            )));
        }

        info!(
            "Registered {} AI vision provider(s): {:?}",
            providers.len(),
            providers.iter().map(|p| p.name()).collect::<Vec<_>>()
        );
        Self { providers, client }
    }

    /// Build a set from explicit providers. The fallback order is the order
    /// given.
    pub fn with_providers(providers: Vec<Box<dyn VisionProvider>>) -> Self {
        Self {
            providers,
            client: reqwest::Client::new(),
        }
    }

    /// Names of the registered providers, in fallback order.
    pub fn names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Reconstruct a document with the preferred provider, falling back
    /// through the remaining providers in registration order.
    #[instrument(level = "debug", skip_all, fields(preferred = preferred.unwrap_or("-")))]
    pub async fn reconstruct_with_ai(
        &self,
        image: &[u8],
        preferred: Option<&str>,
        context: Option<&ReconstructionContext>,
        fallback_enabled: bool,
    ) -> Result<Reconstruction, ProviderSetError> {
        if self.providers.is_empty() {
            return Err(ProviderSetError::NoProvidersConfigured);
        }

        let primary_idx = preferred
            .and_then(|name| self.providers.iter().position(|p| p.name() == name))
            .unwrap_or_else(|| {
                if let Some(name) = preferred {
                    info!(
                        "Requested provider {name} unavailable, using {}",
                        self.providers[0].name()
                    );
                }
                0
            });

        let prompt = build_prompt(context);

        let primary = &self.providers[primary_idx];
        match primary.reconstruct(image, &prompt).await {
            Ok(result) => return Ok(result),
            Err(err) if !fallback_enabled => {
                warn!("Primary provider {} failed: {err}", primary.name());
                return Err(ProviderSetError::Provider(err));
            }
            Err(err) => {
                warn!("Primary provider {} failed: {err}", primary.name());
            }
        }

        for (idx, provider) in self.providers.iter().enumerate() {
            if idx == primary_idx {
                continue;
            }
            info!("Falling back to provider {}", provider.name());
            match provider.reconstruct(image, &prompt).await {
                Ok(result) => return Ok(result),
                Err(err) => warn!("Fallback provider {} failed: {err}", provider.name()),
            }
        }
        Err(ProviderSetError::AllFailed)
    }
}
