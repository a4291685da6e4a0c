//! Orchestration layer for document-intelligence requests.
//!
//! Coordinates the OCR engine with object-store persistence and annotates
//! every response with traceability metadata. This is the surface the HTTP
//! layer calls into.

use std::time::Instant;

use schemars::JsonSchema;

use crate::engine::{EngineError, EngineResponse, IterativeOcrEngine};
use crate::prelude::*;
use crate::storage::{PROCESSED_PREFIX, RECON_META_PREFIX, StorageService};

/// An uploaded file, as handed over by the serving layer.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Request flags controlling the extraction strategy.
#[derive(Debug, Clone, Default)]
pub struct ProcessingFlags {
    /// Run the reconstruction preprocessor.
    pub reconstruct: bool,

    /// Use the AI-reconstruction path.
    pub advanced: bool,

    /// Document type for learned-context retrieval.
    pub doc_type: Option<String>,
}

/// A request-level failure.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    /// Rejected before extraction (400-class).
    #[error("File must be a valid image format")]
    InvalidFileType,

    /// The engine refused the document (400-class).
    #[error("Extraction failure: {0}")]
    Extraction(String),

    /// Anything unexpected (500-class). Detail goes to the logs, not to
    /// the caller.
    #[error("Internal processing failure in OCR orchestrator")]
    Internal,
}

impl From<EngineError> for ProcessingError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Input(_) | EngineError::Corrupted => {
                ProcessingError::Extraction(err.to_string())
            }
            EngineError::Internal(detail) => {
                error!("Engine internal failure: {detail}");
                ProcessingError::Internal
            }
        }
    }
}

/// The engine result enriched with traceability metadata.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProcessedDocument {
    #[serde(flatten)]
    pub result: EngineResponse,

    pub filename: String,

    /// Wall-clock processing time, in seconds, rounded to milliseconds.
    pub processing_time: f64,

    /// Key of the persisted raw upload; `null` when persistence was
    /// unavailable or failed.
    pub s3_key: Option<String>,

    pub request_id: String,
}

/// Orchestrates the OCR lifecycle, managing extraction and storage.
pub struct OcrProcessor {
    engine: Arc<IterativeOcrEngine>,
    storage: Arc<StorageService>,

    /// Default reconstruction flag from configuration, applied when the
    /// request does not override it.
    enable_reconstruction: bool,
}

impl OcrProcessor {
    pub fn new(
        engine: Arc<IterativeOcrEngine>,
        storage: Arc<StorageService>,
        enable_reconstruction: bool,
    ) -> Self {
        Self {
            engine,
            storage,
            enable_reconstruction,
        }
    }

    /// Validate and process an uploaded file.
    pub async fn process_file(
        &self,
        upload: FileUpload,
        flags: ProcessingFlags,
        request_id: &str,
    ) -> Result<ProcessedDocument, ProcessingError> {
        if !upload.content_type.starts_with("image/") {
            return Err(ProcessingError::InvalidFileType);
        }
        self.process_bytes(
            &upload.bytes,
            &upload.filename,
            &upload.content_type,
            flags,
            request_id,
        )
        .await
    }

    /// Execute the full pipeline on raw bytes: extraction, then parallel
    /// persistence of the raw document and any reconstruction metadata.
    #[instrument(level = "debug", skip_all, fields(filename, request_id))]
    pub async fn process_bytes(
        &self,
        bytes: &[u8],
        filename: &str,
        content_type: &str,
        flags: ProcessingFlags,
        request_id: &str,
    ) -> Result<ProcessedDocument, ProcessingError> {
        let start = Instant::now();

        let use_recon = flags.reconstruct || self.enable_reconstruction;
        let result = if flags.advanced {
            self.engine
                .process_advanced(bytes, flags.doc_type.as_deref())
                .await?
        } else {
            EngineResponse::Standard(self.engine.process(bytes, use_recon).await?)
        };

        // Persist the raw document and the reconstruction metadata
        // concurrently. Neither failure aborts the request; a failed raw
        // upload just leaves a null key on the response.
        let raw_upload = self.storage.upload_blob(
            bytes.to_vec(),
            filename,
            content_type,
            PROCESSED_PREFIX,
        );
        let meta_upload = async {
            match result.reconstruction() {
                Some(info) => {
                    self.storage
                        .upload_metadata(info, filename, RECON_META_PREFIX)
                        .await
                }
                None => None,
            }
        };
        let (s3_key, meta_key) = futures::join!(raw_upload, meta_upload);
        if let Some(meta_key) = meta_key {
            debug!("Reconstruction metadata persisted at {meta_key}");
        }

        Ok(ProcessedDocument {
            result,
            filename: filename.to_owned(),
            processing_time: (start.elapsed().as_secs_f64() * 1000.0).round() / 1000.0,
            s3_key,
            request_id: request_id.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use image::{DynamicImage, Rgb, RgbImage};

    use super::*;
    use crate::config::{Environment, Settings};
    use crate::engine::EngineConfig;
    use crate::engine::recognize::TextRecognizer;
    use crate::patterns::PatternStore;
    use crate::providers::VisionProviderSet;

    struct FixedRecognizer(String);

    #[async_trait]
    impl TextRecognizer for FixedRecognizer {
        async fn recognize(&self, _image: &image::GrayImage) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    fn test_settings(dir: &Path) -> Settings {
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

    async fn test_processor(dir: &Path, text: &str) -> OcrProcessor {
        let settings = test_settings(dir);
        let engine = Arc::new(IterativeOcrEngine::new(
            EngineConfig::from(&settings),
            Arc::new(FixedRecognizer(text.to_owned())),
            Arc::new(VisionProviderSet::with_providers(vec![])),
            Arc::new(PatternStore::new(&settings)),
        ));
        let config = crate::aws::load_aws_config(&settings.aws_region).await;
        let storage = Arc::new(StorageService::new(&config, &settings));
        OcrProcessor::new(engine, storage, settings.enable_reconstruction)
    }

    fn small_png() -> Vec<u8> {
        let img = RgbImage::from_pixel(60, 60, Rgb([255, 255, 255]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[tokio::test]
    async fn test_rejects_non_image_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let processor = test_processor(dir.path(), "text").await;
        let upload = FileUpload {
            filename: "report.pdf".to_owned(),
            content_type: "application/pdf".to_owned(),
            bytes: b"%PDF-1.7".to_vec(),
        };
        let err = processor
            .process_file(upload, ProcessingFlags::default(), "req-1")
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessingError::InvalidFileType));
    }

    #[tokio::test]
    async fn test_empty_body_surfaces_extraction_failure() {
        let dir = tempfile::tempdir().unwrap();
        let processor = test_processor(dir.path(), "text").await;
        let err = processor
            .process_bytes(b"", "a.png", "image/png", ProcessingFlags::default(), "req-2")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Extraction failure: Empty image content");
    }

    #[tokio::test]
    async fn test_successful_flow_annotates_response() {
        let dir = tempfile::tempdir().unwrap();
        let text = "Invoice Date Total all good readable content with many words here";
        let processor = test_processor(dir.path(), text).await;
        let doc = processor
            .process_bytes(
                &small_png(),
                "scan.png",
                "image/png",
                ProcessingFlags::default(),
                "req-3",
            )
            .await
            .unwrap();

        assert_eq!(doc.filename, "scan.png");
        assert_eq!(doc.request_id, "req-3");
        // Storage is unconfigured in tests, so the key degrades to null
        // without failing the request.
        assert_eq!(doc.s3_key, None);
        assert!(doc.processing_time >= 0.0);
        let EngineResponse::Standard(standard) = &doc.result else {
            panic!("expected standard response");
        };
        assert_eq!(standard.text, text);
        assert_eq!(standard.iterations.len(), 3);

        // Flattened serialization keeps the engine fields at the top level.
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["text"], text);
        assert_eq!(value["request_id"], "req-3");
        assert!(value["s3_key"].is_null());
    }
}
