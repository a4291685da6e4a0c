//! Async OCR adapter over AWS Textract.
//!
//! Wraps the text-detection and document-analysis APIs with bounded local
//! retries, polling, and pagination. SDK block types are mapped into our own
//! serializable records, which are what the event-trigger handler persists.

use aws_sdk_textract::operation::RequestId as _;
use aws_sdk_textract::types::{Document, DocumentLocation, FeatureType, JobStatus, S3Object};
use schemars::JsonSchema;

use crate::aws::is_transient_sdk_error;
use crate::prelude::*;

/// How many times we poll an async job before giving up.
const MAX_POLL_ATTEMPTS: u32 = 30;

/// Delay between polls.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// A Textract failure.
#[derive(Debug, thiserror::Error)]
pub enum TextractError {
    #[error("Textract request failed after retries")]
    RetriesExhausted { request_id: Option<String> },

    #[error("Textract job {job_id} failed")]
    JobFailed {
        job_id: String,
        request_id: Option<String>,
    },

    #[error("Timed out collecting results for job {job_id}")]
    PollTimeout { job_id: String },
}

/// One extracted block, reduced to the fields we persist.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TextBlock {
    pub block_type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<i32>,
}

/// The aggregated analysis of one document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct DocumentAnalysis {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_status: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pages: Option<i32>,

    pub blocks: Vec<TextBlock>,
}

impl DocumentAnalysis {
    /// The plain text of the document: all LINE blocks, in block order.
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter(|b| b.block_type == "LINE")
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn map_block(block: &aws_sdk_textract::types::Block) -> TextBlock {
    TextBlock {
        block_type: block
            .block_type()
            .map(|t| t.as_str().to_owned())
            .unwrap_or_else(|| "UNKNOWN".to_owned()),
        text: block.text().map(str::to_owned),
        confidence: block.confidence(),
        page: block.page(),
    }
}

/// Orchestrates Textract interactions with error handling and backoff.
pub struct TextractService {
    client: aws_sdk_textract::Client,
    max_retries: u32,
}

impl TextractService {
    pub fn new(config: &aws_config::SdkConfig, max_retries: u32) -> Self {
        Self {
            client: aws_sdk_textract::Client::new(config),
            max_retries,
        }
    }

    /// Initiate async text detection for an object. Returns the job id, or
    /// `None` when the request keeps failing; the caller decides whether a
    /// missing job id is fatal.
    #[instrument(level = "debug", skip(self))]
    pub async fn start_async(&self, bucket: &str, key: &str) -> Option<String> {
        let location = DocumentLocation::builder()
            .s3_object(S3Object::builder().bucket(bucket).name(key).build())
            .build();

        let mut attempt = 1u32;
        loop {
            let result = self
                .client
                .start_document_text_detection()
                .document_location(location.clone())
                .send()
                .await;
            match result {
                Ok(output) => return output.job_id().map(str::to_owned),
                Err(err) if attempt < self.max_retries && is_transient_sdk_error(&err) => {
                    warn!("Transient start_async failure (attempt {attempt}): {err}");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    attempt += 1;
                }
                Err(err) => {
                    let request_id = err.request_id().map(str::to_owned);
                    error!(
                        "Start detection failed after retries | RID: {}",
                        request_id.as_deref().unwrap_or("N/A")
                    );
                    return None;
                }
            }
        }
    }

    /// Synchronous document analysis for real-time pipelines. Defaults to
    /// TABLES and FORMS features.
    #[instrument(level = "debug", skip(self))]
    pub async fn analyze_sync(
        &self,
        bucket: &str,
        key: &str,
        features: Option<Vec<FeatureType>>,
    ) -> Result<DocumentAnalysis, TextractError> {
        let features =
            features.unwrap_or_else(|| vec![FeatureType::Tables, FeatureType::Forms]);
        let document = Document::builder()
            .s3_object(S3Object::builder().bucket(bucket).name(key).build())
            .build();

        let mut attempt = 1u32;
        loop {
            let result = self
                .client
                .analyze_document()
                .document(document.clone())
                .set_feature_types(Some(features.clone()))
                .send()
                .await;
            match result {
                Ok(output) => {
                    return Ok(DocumentAnalysis {
                        job_status: None,
                        pages: output.document_metadata().and_then(|m| m.pages()),
                        blocks: output.blocks().iter().map(map_block).collect(),
                    });
                }
                Err(err) if attempt < self.max_retries && is_transient_sdk_error(&err) => {
                    warn!("Transient analyze_sync failure (attempt {attempt}): {err}");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    attempt += 1;
                }
                Err(err) => {
                    let request_id = err.request_id().map(str::to_owned);
                    error!(
                        "Analyze document failed after retries | RID: {} | Error: {err}",
                        request_id.as_deref().unwrap_or("N/A")
                    );
                    return Err(TextractError::RetriesExhausted { request_id });
                }
            }
        }
    }

    /// Poll for async job completion, then aggregate all paginated results.
    #[instrument(level = "debug", skip(self))]
    pub async fn collect_results(
        &self,
        job_id: &str,
    ) -> Result<DocumentAnalysis, TextractError> {
        for _ in 0..MAX_POLL_ATTEMPTS {
            let response = self
                .client
                .get_document_text_detection()
                .job_id(job_id)
                .send()
                .await
                .map_err(|err| {
                    let request_id = err.request_id().map(str::to_owned);
                    error!(
                        "Failed | JobId: {job_id} | RID: {} | Error: {err}",
                        request_id.as_deref().unwrap_or("N/A")
                    );
                    TextractError::RetriesExhausted { request_id }
                })?;

            match response.job_status() {
                Some(JobStatus::Succeeded) => {
                    let mut analysis = DocumentAnalysis {
                        job_status: Some("SUCCEEDED".to_owned()),
                        pages: response.document_metadata().and_then(|m| m.pages()),
                        blocks: response.blocks().iter().map(map_block).collect(),
                    };
                    let mut next_token = response.next_token().map(str::to_owned);
                    while let Some(token) = next_token {
                        let page = self
                            .client
                            .get_document_text_detection()
                            .job_id(job_id)
                            .next_token(token)
                            .send()
                            .await
                            .map_err(|err| TextractError::RetriesExhausted {
                                request_id: err.request_id().map(str::to_owned),
                            })?;
                        analysis.blocks.extend(page.blocks().iter().map(map_block));
                        next_token = page.next_token().map(str::to_owned);
                    }
                    return Ok(analysis);
                }
                Some(JobStatus::Failed) => {
                    let request_id = response.request_id().map(str::to_owned);
                    return Err(TextractError::JobFailed {
                        job_id: job_id.to_owned(),
                        request_id,
                    });
                }
                status => {
                    info!("Polling | JobId: {job_id} | Status: {status:?}");
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
        Err(TextractError::PollTimeout {
            job_id: job_id.to_owned(),
        })
    }
}

/// Delay before retry number `attempt` (1-based), matching the object-store
/// adapter's schedule.
fn backoff_delay(attempt: u32) -> Duration {
    let secs = 0.1 * 2f64.powi(attempt.saturating_sub(1).min(16) as i32);
    Duration::from_secs_f64(secs.min(2.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(text: &str) -> TextBlock {
        TextBlock {
            block_type: "LINE".to_owned(),
            text: Some(text.to_owned()),
            confidence: Some(99.0),
            page: Some(1),
        }
    }

    #[test]
    fn test_analysis_text_concatenates_lines() {
        let analysis = DocumentAnalysis {
            job_status: Some("SUCCEEDED".to_owned()),
            pages: Some(1),
            blocks: vec![
                line("INVOICE"),
                TextBlock {
                    block_type: "WORD".to_owned(),
                    text: Some("ignored".to_owned()),
                    confidence: None,
                    page: Some(1),
                },
                line("Total: 120.00"),
            ],
        };
        assert_eq!(analysis.text(), "INVOICE\nTotal: 120.00");
    }

    #[test]
    fn test_analysis_serializes_without_nulls() {
        let analysis = DocumentAnalysis {
            job_status: None,
            pages: None,
            blocks: vec![line("x")],
        };
        let value = serde_json::to_value(&analysis).unwrap();
        assert!(value.get("job_status").is_none());
        assert_eq!(value["blocks"][0]["text"], "x");
    }
}
