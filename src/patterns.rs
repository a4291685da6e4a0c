//! Durable learned-pattern store.
//!
//! Hybrid persistence: a cloud backend (Supabase's PostgREST API) when
//! configured, with an automatic local JSON fallback for resilience. Writes
//! are strictly best-effort; a failing store must never take down an
//! extraction, so every error here is logged and swallowed.

use std::time::Instant;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use tokio::sync::Mutex;

use crate::config::Settings;
use crate::prelude::*;

/// Most-recent entries kept in the local fallback file.
const LOCAL_CAP: usize = 500;

/// Deadline for cloud reads before falling back to the local file.
const CLOUD_READ_TIMEOUT: Duration = Duration::from_secs(3);

/// How long a health probe result stays valid.
const HEALTH_TTL: Duration = Duration::from_secs(60);

/// One learned extraction-quality record for a document type.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LearnedPattern {
    pub doc_type: String,

    /// Free-form metadata about the source of the signal (model, layout,
    /// font observations).
    pub font_metadata: Value,

    /// Extraction quality in [0, 1].
    pub accuracy_score: f64,

    /// Record schema version, for forward-compatible readers.
    pub schema_version: String,

    pub created_at: DateTime<Utc>,
}

impl LearnedPattern {
    pub fn new(doc_type: &str, font_metadata: Value, accuracy_score: f64) -> Self {
        Self {
            doc_type: doc_type.to_owned(),
            font_metadata,
            accuracy_score,
            schema_version: env!("CARGO_PKG_VERSION").to_owned(),
            created_at: Utc::now(),
        }
    }
}

/// Cloud half of the store: Supabase spoken over PostgREST.
#[derive(Debug, Clone)]
struct SupabaseBackend {
    client: reqwest::Client,
    base_url: String,
    service_role: String,
}

impl SupabaseBackend {
    fn table_url(&self) -> String {
        format!(
            "{}/rest/v1/learning_patterns",
            self.base_url.trim_end_matches('/')
        )
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("apikey", &self.service_role)
            .bearer_auth(&self.service_role)
    }

    async fn upsert(&self, pattern: &LearnedPattern) -> Result<()> {
        let response = self
            .authed(self.client.post(self.table_url()))
            .header("Prefer", "resolution=merge-duplicates")
            .json(pattern)
            .send()
            .await?;
        response.error_for_status()?;
        Ok(())
    }

    async fn best_for(&self, doc_type: &str) -> Result<Option<LearnedPattern>> {
        let doc_type_filter = format!("eq.{doc_type}");
        let response = self
            .authed(self.client.get(self.table_url()))
            .query(&[
                ("select", "*"),
                ("doc_type", doc_type_filter.as_str()),
                ("order", "accuracy_score.desc"),
                ("limit", "1"),
            ])
            .timeout(CLOUD_READ_TIMEOUT)
            .send()
            .await?;
        let rows: Vec<LearnedPattern> = response.error_for_status()?.json().await?;
        Ok(rows.into_iter().next())
    }

    async fn ping(&self) -> Result<()> {
        let response = self
            .authed(self.client.get(self.table_url()))
            .query(&[("select", "doc_type"), ("limit", "1")])
            .timeout(CLOUD_READ_TIMEOUT)
            .send()
            .await?;
        response.error_for_status()?;
        Ok(())
    }
}

/// Durable learned-pattern KV with cloud-primary / local-fallback semantics.
pub struct PatternStore {
    cloud: Option<SupabaseBackend>,
    local_path: Option<PathBuf>,
    file_lock: Mutex<()>,
    cloud_write_deadline: Duration,
    health: std::sync::Mutex<Option<(Instant, bool)>>,
}

impl PatternStore {
    pub fn new(settings: &Settings) -> Self {
        let cloud = match (&settings.supabase_url, &settings.supabase_service_role) {
            (Some(url), Some(role)) => {
                info!("Supabase pattern backend active");
                Some(SupabaseBackend {
                    client: reqwest::Client::new(),
                    base_url: url.clone(),
                    service_role: role.clone(),
                })
            }
            _ => None,
        };

        let local_path = settings.use_local_fallback.then(|| {
            if let Some(parent) = settings.local_data_path.parent() {
                if let Err(err) = std::fs::create_dir_all(parent) {
                    warn!("Failed to create pattern data directory: {err}");
                }
            }
            settings.local_data_path.clone()
        });

        Self {
            cloud,
            local_path,
            file_lock: Mutex::new(()),
            cloud_write_deadline: Duration::from_secs(settings.cloud_write_deadline_secs),
            health: std::sync::Mutex::new(None),
        }
    }

    /// Record a learning signal. Persists locally and (when configured)
    /// upserts to the cloud backend concurrently. Either write may fail
    /// silently; the cloud write is bounded by the configured deadline.
    pub async fn record(&self, doc_type: &str, font_metadata: Value, accuracy_score: f64) {
        let pattern = LearnedPattern::new(doc_type, font_metadata, accuracy_score);

        let local_write = async {
            if self.local_path.is_some() {
                if let Err(err) = self.append_local(&pattern).await {
                    warn!("Local pattern write failed: {err}");
                }
            }
        };

        let cloud_write = async {
            if let Some(cloud) = &self.cloud {
                match tokio::time::timeout(self.cloud_write_deadline, cloud.upsert(&pattern))
                    .await
                {
                    Ok(Ok(())) => debug!("Cloud pattern sync successful"),
                    Ok(Err(err)) => warn!("Cloud pattern sync failed: {err}"),
                    Err(_) => warn!("Cloud pattern sync timed out"),
                }
            }
        };

        futures::join!(local_write, cloud_write);
    }

    /// Fetch the highest-accuracy pattern for a document type. Tries the
    /// cloud backend first, then falls back to a local scan.
    pub async fn get_best(&self, doc_type: &str) -> Option<LearnedPattern> {
        if let Some(cloud) = &self.cloud {
            match cloud.best_for(doc_type).await {
                Ok(Some(pattern)) => return Some(pattern),
                Ok(None) => {}
                Err(err) => info!("Cloud pattern fetch failed, searching local: {err}"),
            }
        }
        self.best_local(doc_type).await
    }

    /// Is at least one backend usable? Cached for 60 seconds.
    pub async fn health(&self) -> bool {
        {
            let cached = self.health.lock().expect("health lock poisoned");
            if let Some((at, ok)) = *cached {
                if at.elapsed() < HEALTH_TTL {
                    return ok;
                }
            }
        }

        let ok = self.probe_health().await;
        let mut cached = self.health.lock().expect("health lock poisoned");
        *cached = Some((Instant::now(), ok));
        ok
    }

    async fn probe_health(&self) -> bool {
        if let Some(cloud) = &self.cloud {
            match cloud.ping().await {
                Ok(()) => return true,
                Err(err) => warn!("Supabase health check failed: {err}"),
            }
        }
        match &self.local_path {
            Some(path) => tokio::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(path)
                .await
                .is_ok(),
            None => false,
        }
    }

    async fn append_local(&self, pattern: &LearnedPattern) -> Result<()> {
        let Some(path) = &self.local_path else {
            return Ok(());
        };
        let _guard = self.file_lock.lock().await;
        let mut patterns = load_patterns(path).await;
        patterns.push(pattern.clone());
        if patterns.len() > LOCAL_CAP {
            patterns.drain(..patterns.len() - LOCAL_CAP);
        }
        let body = serde_json::to_string_pretty(&patterns)
            .context("Failed to serialize patterns")?;
        tokio::fs::write(path, body)
            .await
            .with_context(|| format!("Failed to write {path:?}"))?;
        Ok(())
    }

    async fn best_local(&self, doc_type: &str) -> Option<LearnedPattern> {
        let path = self.local_path.as_ref()?;
        let _guard = self.file_lock.lock().await;
        let patterns = load_patterns(path).await;
        patterns
            .into_iter()
            .filter(|p| p.doc_type == doc_type)
            .max_by(|a, b| {
                a.accuracy_score
                    .partial_cmp(&b.accuracy_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }
}

/// Load the local pattern file, treating any problem as an empty store.
async fn load_patterns(path: &Path) -> Vec<LearnedPattern> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;

    fn local_only_settings(dir: &Path) -> Settings {
        Settings {
            ocr_api_key: Some("secret".to_owned()),
            api_key_header_name: "X-API-KEY".to_owned(),
            s3_bucket_name: None,
            output_prefix: "textract_outputs/".to_owned(),
            aws_max_retries: 3,
            aws_region: "us-east-1".to_owned(),
            enable_reconstruction: false,
            ocr_iterations: 3,
            confidence_threshold: 0.5,
            max_image_size_mb: 10,
            environment: Environment::Development,
            allowed_origins: vec!["*".to_owned()],
            openai_api_key: None,
            gemini_api_key: None,
            hugging_face_api_key: None,
            perplexity_api_key: None,
            supabase_url: None,
            supabase_service_role: None,
            use_local_fallback: true,
            local_data_path: dir.join("learning_patterns.json"),
            cloud_write_deadline_secs: 2,
            redis_url: "redis://localhost:6379/".to_owned(),
            sentry_dsn: None,
            azure_application_insights_connection_string: None,
            al_cycle_samples: 100,
            al_n_clusters: 8,
            reference_baseline_path: None,
            drift_report_path: None,
        }
    }

    #[tokio::test]
    async fn test_record_and_get_best_local() {
        let dir = tempfile::tempdir().unwrap();
        let store = PatternStore::new(&local_only_settings(dir.path()));

        store
            .record("invoice", json!({"model": "gpt-4o"}), 0.4)
            .await;
        store
            .record("invoice", json!({"model": "gemini-1.5-flash"}), 0.9)
            .await;
        store.record("receipt", json!({"model": "gpt-4o"}), 0.7).await;

        let best = store.get_best("invoice").await.unwrap();
        assert_eq!(best.accuracy_score, 0.9);
        assert_eq!(best.doc_type, "invoice");
        assert_eq!(best.schema_version, env!("CARGO_PKG_VERSION"));

        assert!(store.get_best("unknown").await.is_none());
    }

    #[tokio::test]
    async fn test_local_file_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let settings = local_only_settings(dir.path());
        let store = PatternStore::new(&settings);

        // Seed a file already at the cap, then write once more.
        let seeded: Vec<LearnedPattern> = (0..LOCAL_CAP)
            .map(|i| LearnedPattern::new("bulk", json!({"i": i}), 0.1))
            .collect();
        tokio::fs::write(
            &settings.local_data_path,
            serde_json::to_string(&seeded).unwrap(),
        )
        .await
        .unwrap();

        store.record("bulk", json!({"i": "last"}), 0.2).await;

        let raw = tokio::fs::read_to_string(&settings.local_data_path)
            .await
            .unwrap();
        let patterns: Vec<LearnedPattern> = serde_json::from_str(&raw).unwrap();
        assert_eq!(patterns.len(), LOCAL_CAP);
        // Newest entry survives at the tail.
        assert_eq!(patterns.last().unwrap().font_metadata, json!({"i": "last"}));
    }

    #[tokio::test]
    async fn test_corrupt_local_file_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let settings = local_only_settings(dir.path());
        tokio::fs::write(&settings.local_data_path, b"{ not json")
            .await
            .unwrap();
        let store = PatternStore::new(&settings);
        assert!(store.get_best("invoice").await.is_none());
        store.record("invoice", json!({}), 0.5).await;
        assert!(store.get_best("invoice").await.is_some());
    }

    #[tokio::test]
    async fn test_health_local_writable() {
        let dir = tempfile::tempdir().unwrap();
        let store = PatternStore::new(&local_only_settings(dir.path()));
        assert!(store.health().await);
    }

    #[tokio::test]
    async fn test_health_nothing_configured() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = local_only_settings(dir.path());
        settings.use_local_fallback = false;
        let store = PatternStore::new(&settings);
        assert!(!store.health().await);
    }
}
