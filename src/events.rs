//! Event-driven processing of object-store upload notifications.
//!
//! For each uploaded object we route by content type: PDFs start an async
//! Textract job, everything else is analyzed synchronously. The result (or
//! an error document) is persisted beside the input under the configured
//! output prefix.

use schemars::JsonSchema;

use crate::prelude::*;
use crate::storage::StorageService;
use crate::textract::{TextractError, TextractService};

/// A batch of object-store upload records.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct S3Event {
    #[serde(rename = "Records", default)]
    pub records: Vec<S3EventRecord>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct S3EventRecord {
    #[serde(default)]
    pub s3: S3Entity,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct S3Entity {
    #[serde(default)]
    pub bucket: S3BucketRef,

    #[serde(default)]
    pub object: S3ObjectRef,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct S3BucketRef {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct S3ObjectRef {
    /// Percent-encoded object key, as delivered by S3 notifications.
    pub key: Option<String>,
}

/// Outcome of one event batch.
#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
pub struct BatchOutcome {
    /// `"ok"` or `"partial_failure"`.
    pub status: String,

    /// Number of failed records, present only on partial failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<usize>,
}

impl BatchOutcome {
    fn ok() -> Self {
        Self {
            status: "ok".to_owned(),
            failed: None,
        }
    }

    fn partial_failure(failed: usize) -> Self {
        Self {
            status: "partial_failure".to_owned(),
            failed: Some(failed),
        }
    }
}

/// Undo S3 notification key encoding: `+` means space, the rest is
/// percent-encoded.
pub fn unescape_key(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

/// Derive the output key for an input key:
/// `<output_prefix>/<basename(key)>.json`.
pub fn derive_output_key(output_prefix: &str, key: &str) -> String {
    let base = Path::new(key)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{}/{base}.json", output_prefix.trim_end_matches('/'))
}

/// Handles object-upload event batches.
pub struct EventTriggerHandler {
    textract: Arc<TextractService>,
    storage: Arc<StorageService>,
    output_prefix: String,
}

impl EventTriggerHandler {
    pub fn new(
        textract: Arc<TextractService>,
        storage: Arc<StorageService>,
        output_prefix: String,
    ) -> Self {
        Self {
            textract,
            storage,
            output_prefix,
        }
    }

    /// Process every record in the batch. Per-record failures are captured
    /// (and persisted as error documents) rather than aborting the batch.
    #[instrument(level = "info", skip_all, fields(records = event.records.len(), request_id))]
    pub async fn handle(&self, event: &S3Event, request_id: &str) -> BatchOutcome {
        let mut failures = 0;
        for record in &event.records {
            if let Err(err) = self.process_record(record, request_id).await {
                error!("Record processing failed: {err:?}");
                failures += 1;
            }
        }
        if failures > 0 {
            warn!("Batch completed with partial failures | Failed: {failures}");
            BatchOutcome::partial_failure(failures)
        } else {
            BatchOutcome::ok()
        }
    }

    async fn process_record(&self, record: &S3EventRecord, request_id: &str) -> Result<()> {
        let bucket = record.s3.bucket.name.as_deref();
        let raw_key = record.s3.object.key.as_deref();
        let (Some(bucket), Some(raw_key)) = (bucket, raw_key) else {
            warn!("Payload error: missing S3 bucket or key reference");
            return Ok(());
        };
        let key = unescape_key(raw_key);
        let out_key = derive_output_key(&self.output_prefix, &key);
        let storage = self.storage.for_bucket(bucket);

        let output = if key.to_lowercase().ends_with(".pdf") {
            self.start_async_pdf(bucket, &key, request_id).await
        } else {
            self.analyze_sync_image(bucket, &key, request_id).await
        };

        match output {
            Ok(output) => {
                if let Err(err) = storage.put_json(&out_key, &output).await {
                    error!("Storage failure: could not persist extraction for {key}: {err}");
                } else {
                    info!("Result persisted | Path: s3://{bucket}/{out_key}");
                }
                Ok(())
            }
            Err(err) => {
                let error_kind = if err.downcast_ref::<TextractError>().is_some() {
                    "aws_service_failure"
                } else {
                    "internal_pipeline_failure"
                };
                let error_doc = json!({
                    "error": error_kind,
                    "message": err.to_string(),
                    "requestId": request_id,
                    "input": {"bucket": bucket, "key": key},
                });
                if let Err(save_err) = storage.put_json(&out_key, &error_doc).await {
                    error!("Critical storage failure during error logging: {save_err}");
                }
                Err(err)
            }
        }
    }

    async fn start_async_pdf(
        &self,
        bucket: &str,
        key: &str,
        request_id: &str,
    ) -> Result<Value> {
        let job_id = self
            .textract
            .start_async(bucket, key)
            .await
            .ok_or_else(|| anyhow!("Textract job initiation failure for {key}"))?;
        info!("Async processing initiated | JobId: {job_id} | Key: {key}");
        Ok(json!({
            "jobId": job_id,
            "status": "STARTED",
            "requestId": request_id,
            "input": {"bucket": bucket, "key": key},
        }))
    }

    async fn analyze_sync_image(
        &self,
        bucket: &str,
        key: &str,
        request_id: &str,
    ) -> Result<Value> {
        let analysis = self.textract.analyze_sync(bucket, key, None).await?;
        info!(
            "Sync analysis completed | Key: {key} | Extracted {} chars",
            analysis.text().len()
        );
        let mut output = serde_json::to_value(&analysis)?;
        output["requestId"] = json!(request_id);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unescape_key() {
        assert_eq!(unescape_key("plain.pdf"), "plain.pdf");
        assert_eq!(unescape_key("my+scanned+doc.pdf"), "my scanned doc.pdf");
        assert_eq!(unescape_key("a%282%29.png"), "a(2).png");
        assert_eq!(unescape_key("dir%2Fnested+file.pdf"), "dir/nested file.pdf");
    }

    #[test]
    fn test_derive_output_key() {
        assert_eq!(
            derive_output_key("textract_outputs/", "uploads/invoice.pdf"),
            "textract_outputs/invoice.pdf.json"
        );
        assert_eq!(
            derive_output_key("textract_outputs", "invoice.pdf"),
            "textract_outputs/invoice.pdf.json"
        );
        assert_eq!(
            derive_output_key("out/", "a/b/c/scan 1.png"),
            "out/scan 1.png.json"
        );
    }

    #[test]
    fn test_event_payload_parses() {
        let payload = json!({
            "Records": [{
                "eventName": "ObjectCreated:Put",
                "s3": {
                    "bucket": {"name": "inbox"},
                    "object": {"key": "uploads/my+doc.pdf", "size": 1024}
                }
            }]
        });
        let event: S3Event = serde_json::from_value(payload).unwrap();
        assert_eq!(event.records.len(), 1);
        assert_eq!(event.records[0].s3.bucket.name.as_deref(), Some("inbox"));
        assert_eq!(
            unescape_key(event.records[0].s3.object.key.as_deref().unwrap()),
            "uploads/my doc.pdf"
        );
    }

    #[test]
    fn test_event_payload_tolerates_missing_fields() {
        let event: S3Event = serde_json::from_value(json!({"Records": [{}]})).unwrap();
        assert_eq!(event.records.len(), 1);
        assert!(event.records[0].s3.bucket.name.is_none());

        let event: S3Event = serde_json::from_value(json!({})).unwrap();
        assert!(event.records.is_empty());
    }

    #[test]
    fn test_batch_outcome_shapes() {
        assert_eq!(
            serde_json::to_value(BatchOutcome::ok()).unwrap(),
            json!({"status": "ok"})
        );
        assert_eq!(
            serde_json::to_value(BatchOutcome::partial_failure(2)).unwrap(),
            json!({"status": "partial_failure", "failed": 2})
        );
    }
}
