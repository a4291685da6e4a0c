//! Object-store adapter over S3.
//!
//! Retries are performed locally with a deterministic bounded backoff; the
//! SDK's own retry machinery stays disabled. When no bucket is configured
//! the adapter runs in a degraded no-op mode: uploads return `None` and the
//! pipeline continues without persistence.

use std::collections::BTreeMap;
use std::time::Instant;

use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use schemars::JsonSchema;
use uuid::Uuid;

use crate::aws::is_transient_sdk_error;
use crate::config::Settings;
use crate::prelude::*;

/// Prefix for raw uploaded documents.
pub const PROCESSED_PREFIX: &str = "processed";

/// Prefix for reconstruction metadata documents.
pub const RECON_META_PREFIX: &str = "recon_meta";

/// How long a health probe result stays valid.
const HEALTH_TTL: Duration = Duration::from_secs(60);

/// An object-store failure.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 storage is not configured")]
    NotConfigured,

    #[error("Failed to serialize JSON payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("S3 request failed: {0}")]
    Request(String),
}

/// Time-limited upload credentials for a direct client upload.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct UploadTicket {
    /// The URL to upload to.
    pub url: String,

    /// Headers/fields the client must send with the upload, including the
    /// content-type constraint.
    pub fields: BTreeMap<String, String>,
}

/// S3 wrapper with bounded local retry semantics.
///
/// The underlying SDK client is cheap to clone and safe for concurrent use.
pub struct StorageService {
    client: aws_sdk_s3::Client,
    bucket: Option<String>,
    max_retries: u32,
    health: std::sync::Mutex<Option<(Instant, bool)>>,
}

impl StorageService {
    /// Build the adapter from settings. A missing bucket name puts the
    /// adapter in degraded no-op mode rather than failing startup.
    pub fn new(config: &aws_config::SdkConfig, settings: &Settings) -> Self {
        if settings.s3_bucket_name.is_none() {
            debug!("S3 bucket name not configured; storage runs in degraded mode");
        }
        Self {
            client: aws_sdk_s3::Client::new(config),
            bucket: settings.s3_bucket_name.clone(),
            max_retries: settings.aws_max_retries,
            health: std::sync::Mutex::new(None),
        }
    }

    /// A sibling adapter bound to a different bucket (used by the
    /// event-trigger handler, which writes beside the event's own bucket).
    pub fn for_bucket(&self, bucket: &str) -> Self {
        Self {
            client: self.client.clone(),
            bucket: Some(bucket.to_owned()),
            max_retries: self.max_retries,
            health: std::sync::Mutex::new(None),
        }
    }

    fn configured(&self) -> Result<(&aws_sdk_s3::Client, &str), StorageError> {
        match &self.bucket {
            Some(bucket) => Ok((&self.client, bucket)),
            None => Err(StorageError::NotConfigured),
        }
    }

    /// Put an object, retrying transient failures up to the configured cap.
    pub async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let (client, bucket) = self.configured()?;
        let mut attempt = 1u32;
        loop {
            debug!("Putting object to S3: bucket={bucket}, key={key}, attempt={attempt}");
            let result = client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(ByteStream::from(body.clone()))
                .content_type(content_type)
                .send()
                .await;
            match result {
                Ok(_) => {
                    info!("Put object to S3: key={key}");
                    return Ok(());
                }
                Err(err) if attempt < self.max_retries && is_transient_sdk_error(&err) => {
                    warn!("Transient S3 put failure (attempt {attempt}): {err}");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    attempt += 1;
                }
                Err(err) => {
                    error!("S3 put_object failed: {err:?}");
                    return Err(StorageError::Request(err.to_string()));
                }
            }
        }
    }

    /// Serialize a value to JSON and put it. Serialization problems surface
    /// as [`StorageError::Serialization`], distinct from transport failures.
    pub async fn put_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        let body = serde_json::to_vec(value)?;
        self.put(key, body, "application/json").await
    }

    /// Upload raw bytes under `<prefix>/<uuid>-<filename>`, returning the
    /// key, or `None` when unconfigured or when the upload ultimately fails.
    pub async fn upload_blob(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        content_type: &str,
        prefix: &str,
    ) -> Option<String> {
        if self.bucket.is_none() {
            warn!("S3 bucket not configured, skipping upload");
            return None;
        }
        let key = format!("{prefix}/{}-{filename}", Uuid::new_v4());
        match self.put(&key, bytes, content_type).await {
            Ok(()) => Some(key),
            Err(err) => {
                error!("upload_blob failed after retries: {err}");
                None
            }
        }
    }

    /// Upload a JSON document under `<prefix>/<uuid>-<filename>.json`.
    pub async fn upload_metadata<T: Serialize>(
        &self,
        value: &T,
        filename: &str,
        prefix: &str,
    ) -> Option<String> {
        if self.bucket.is_none() {
            warn!("S3 bucket not configured, skipping metadata upload");
            return None;
        }
        let key = format!("{prefix}/{}-{filename}.json", Uuid::new_v4());
        match self.put_json(&key, value).await {
            Ok(()) => Some(key),
            Err(err) => {
                error!("upload_metadata failed: {err}");
                None
            }
        }
    }

    /// Issue time-limited upload credentials for a direct client upload,
    /// constrained to the given content type.
    pub async fn issue_upload_ticket(
        &self,
        key: &str,
        content_type: &str,
        expires_s: u64,
    ) -> Result<UploadTicket, StorageError> {
        let (client, bucket) = self.configured()?;
        let presigning = PresigningConfig::expires_in(Duration::from_secs(expires_s))
            .map_err(|e| StorageError::Request(e.to_string()))?;
        let request = client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .presigned(presigning)
            .await
            .map_err(|e| StorageError::Request(e.to_string()))?;

        let mut fields = BTreeMap::new();
        fields.insert("Content-Type".to_owned(), content_type.to_owned());
        for (name, value) in request.headers() {
            fields.insert(name.to_owned(), value.to_owned());
        }
        Ok(UploadTicket {
            url: request.uri().to_string(),
            fields,
        })
    }

    /// Validate connectivity by checking that the bucket exists. Results are
    /// cached for 60 seconds to avoid redundant API calls.
    pub async fn health(&self) -> bool {
        let Ok((client, bucket)) = self.configured() else {
            return false;
        };
        {
            let cached = self.health.lock().expect("health lock poisoned");
            if let Some((at, ok)) = *cached {
                if at.elapsed() < HEALTH_TTL {
                    return ok;
                }
            }
        }

        let ok = match client.head_bucket().bucket(bucket).send().await {
            Ok(_) => true,
            Err(err) => {
                debug!("S3 connectivity check failed for bucket {bucket}: {err}");
                false
            }
        };
        let mut cached = self.health.lock().expect("health lock poisoned");
        *cached = Some((Instant::now(), ok));
        ok
    }
}

/// Delay before retry number `attempt` (1-based): `0.1 * 2^(attempt-1)`
/// seconds, capped at 2 seconds.
fn backoff_delay(attempt: u32) -> Duration {
    let secs = 0.1 * 2f64.powi(attempt.saturating_sub(1).min(16) as i32);
    Duration::from_secs_f64(secs.min(2.0))
}
