//! Durable jobs and the queue worker.
//!
//! Submitters write the full job payload to the KV under `job:<id>` and push
//! the id alone onto the `ocr_tasks` list. The worker loop pops ids, mutates
//! the durable record through `QUEUED → PROCESSING → COMPLETED | FAILED`,
//! and never panics: delivery is at-least-once, so a crashed run simply
//! reprocesses the id.

use base64::{Engine as _, prelude::BASE64_STANDARD};
use chrono::{DateTime, Utc};
use redis::AsyncCommands as _;
use redis::aio::ConnectionManager;
use schemars::JsonSchema;
use uuid::Uuid;

use crate::engine::IterativeOcrEngine;
use crate::prelude::*;

/// The queue list key.
pub const QUEUE_KEY: &str = "ocr_tasks";

/// Blocking-pop timeout, in seconds.
const POP_TIMEOUT_SECS: f64 = 5.0;

/// Sleep after a lost queue connection before retrying.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

/// The durable job record stored under `job:<id>`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobRecord {
    pub id: Uuid,
    pub status: JobStatus,

    /// Inline image payload, base64-encoded. Preferred over `image_path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_bytes: Option<String>,

    /// Path to the image on worker-local storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<PathBuf>,

    /// Source URL recorded by the submitter, for traceability only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// A fresh queued job with a generated id.
    pub fn new_queued() -> Self {
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Queued,
            image_bytes: None,
            image_path: None,
            image_url: None,
            doc_type: None,
            result: None,
            error: None,
            created_at: Utc::now(),
            updated_at: None,
            completed_at: None,
            failed_at: None,
        }
    }

    /// The KV key for a job id.
    pub fn key_for(id: &str) -> String {
        format!("job:{id}")
    }

    pub fn key(&self) -> String {
        Self::key_for(&self.id.to_string())
    }
}

/// Durably submit a job: write the record, then push the id.
pub async fn submit_job(conn: &mut ConnectionManager, record: &JobRecord) -> Result<()> {
    let payload = serde_json::to_string(record).context("Failed to serialize job")?;
    conn.set::<_, _, ()>(record.key(), payload)
        .await
        .context("Failed to store job record")?;
    conn.rpush::<_, _, ()>(QUEUE_KEY, record.id.to_string())
        .await
        .context("Failed to enqueue job id")?;
    info!("Job {} queued", record.id);
    Ok(())
}

/// How the worker resolved (or failed to resolve) a job's input bytes.
///
/// Resolution failures are terminal *results*, not worker errors: the
/// submitter still gets a completed record describing what was wrong.
pub async fn resolve_input(record: &JobRecord) -> Result<Vec<u8>, &'static str> {
    if let Some(encoded) = &record.image_bytes {
        return BASE64_STANDARD
            .decode(encoded)
            .map_err(|_| "invalid_image_encoding");
    }
    if let Some(path) = &record.image_path {
        return tokio::fs::read(path).await.map_err(|_| "missing_input");
    }
    Err("missing_input")
}

/// The queue worker. One instance runs one sequential loop; scale out by
/// running more instances against the same queue.
pub struct QueueWorker {
    redis_url: String,
    engine: Arc<IterativeOcrEngine>,
    enable_reconstruction: bool,
}

impl QueueWorker {
    pub fn new(
        redis_url: String,
        engine: Arc<IterativeOcrEngine>,
        enable_reconstruction: bool,
    ) -> Self {
        Self {
            redis_url,
            engine,
            enable_reconstruction,
        }
    }

    /// Run the worker loop until the process is stopped. Fails only when
    /// the initial connection cannot be established.
    pub async fn run(&self) -> Result<()> {
        let client = redis::Client::open(self.redis_url.as_str())
            .context("Invalid Redis URL")?;
        let mut conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        info!("Worker started, waiting for tasks on {QUEUE_KEY:?}");

        loop {
            match self.poll_once(&mut conn).await {
                Ok(()) => {}
                Err(err) => {
                    error!("Queue connection error: {err}; reconnecting");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    /// One blocking pop plus, when an id arrives, one job execution.
    async fn poll_once(&self, conn: &mut ConnectionManager) -> Result<()> {
        let popped: Option<(String, String)> = conn
            .blpop(QUEUE_KEY, POP_TIMEOUT_SECS)
            .await
            .context("blpop failed")?;
        let Some((_, job_id)) = popped else {
            return Ok(());
        };
        self.process_job(conn, &job_id).await;
        Ok(())
    }

    /// Drive one job to a terminal state. Every failure mode ends in a
    /// durable COMPLETED or FAILED record; nothing here panics the worker.
    #[instrument(level = "info", skip(self, conn))]
    pub async fn process_job(&self, conn: &mut ConnectionManager, job_id: &str) {
        let key = JobRecord::key_for(job_id);
        let raw: Option<String> = match conn.get(&key).await {
            Ok(raw) => raw,
            Err(err) => {
                error!("Failed to load job record {key}: {err}");
                return;
            }
        };
        let Some(raw) = raw else {
            warn!("Job data not found for ID: {job_id}");
            return;
        };
        let mut record: JobRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(err) => {
                error!("Job record {key} is unreadable: {err}");
                return;
            }
        };

        record.status = JobStatus::Processing;
        record.updated_at = Some(Utc::now());
        save_record(conn, &record).await;
        info!("Processing job: {job_id}");

        let bytes = match resolve_input(&record).await {
            Ok(bytes) => bytes,
            Err(reason) => {
                // Terminal from the submitter's point of view: the job ran,
                // the input was unusable.
                record.status = JobStatus::Completed;
                record.result = Some(json!({"error": reason}));
                record.completed_at = Some(Utc::now());
                save_record(conn, &record).await;
                return;
            }
        };

        match self.engine.process(&bytes, self.enable_reconstruction).await {
            Ok(response) => {
                record.status = JobStatus::Completed;
                record.result = serde_json::to_value(&response).ok();
                record.completed_at = Some(Utc::now());
                info!("Job {job_id} completed");
            }
            Err(err) => {
                record.status = JobStatus::Failed;
                record.error = Some(err.to_string());
                record.failed_at = Some(Utc::now());
                error!("Job {job_id} failed: {err}");
            }
        }
        save_record(conn, &record).await;
    }
}

/// Persist a job record, logging (not propagating) failures.
async fn save_record(conn: &mut ConnectionManager, record: &JobRecord) {
    let payload = match serde_json::to_string(record) {
        Ok(payload) => payload,
        Err(err) => {
            error!("Failed to serialize job {}: {err}", record.id);
            return;
        }
    };
    if let Err(err) = conn.set::<_, _, ()>(record.key(), payload).await {
        error!("Failed to persist job {}: {err}", record.id);
    }
}
