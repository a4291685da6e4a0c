//! The iterative OCR engine.
//!
//! Drives a per-document state machine: repeatedly enhance, threshold and
//! re-read the document, scoring every pass and keeping the best text seen
//! so far. On a weak first pass it falls back to region-based extraction,
//! and the advanced path hands the whole document to an AI vision provider
//! with learned context injected into the prompt.

pub mod recognize;

use image::{DynamicImage, GrayImage, imageops};
use schemars::JsonSchema;

use crate::capabilities;
use crate::confidence::ConfidenceScorer;
use crate::config::Settings;
use crate::imaging::{self, ValidationError};
use crate::layout::{self, LayoutKind, Region};
use crate::patterns::PatternStore;
use crate::prelude::*;
use crate::providers::{ReconstructionContext, VisionProviderSet};
use crate::recon::{self, ReconstructionSummary};

use self::recognize::TextRecognizer;

/// Padding applied around each ROI before extraction.
const ROI_PADDING: u32 = 10;

/// Characters kept in an iteration's text preview.
const PREVIEW_CHARS: usize = 50;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_iterations: usize,
    pub confidence_threshold: f64,
    pub max_image_size_mb: usize,
    pub default_doc_type: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            confidence_threshold: 0.5,
            max_image_size_mb: 10,
            default_doc_type: "generic".to_owned(),
        }
    }
}

impl From<&Settings> for EngineConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            max_iterations: settings.ocr_iterations,
            confidence_threshold: settings.confidence_threshold,
            max_image_size_mb: settings.max_image_size_mb,
            ..Self::default()
        }
    }
}

/// A terminal engine failure. Anything recoverable stays inside the
/// iteration history instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Input(#[from] ValidationError),

    #[error("Corrupted or unsupported image format")]
    Corrupted,

    #[error("{0}")]
    Internal(String),
}

/// How a pass extracted its text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractionMethod {
    FullPage,
    RegionBased,
}

/// One entry in the iteration history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum IterationRecord {
    Completed {
        /// 1-based pass index.
        iteration: usize,
        text_length: usize,
        confidence: f64,
        method: ExtractionMethod,
        preview_text: String,
    },
    Failed {
        /// 1-based pass index.
        iteration: usize,
        /// Always `"failed"`.
        error: String,
    },
}

impl IterationRecord {
    pub fn confidence(&self) -> Option<f64> {
        match self {
            IterationRecord::Completed { confidence, .. } => Some(*confidence),
            IterationRecord::Failed { .. } => None,
        }
    }
}

/// Reconstruction output retained alongside the OCR result.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReconstructionInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_text: Option<String>,

    pub meta: ReconstructionSummary,
}

/// Response of the standard iterative path.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StandardResponse {
    /// Text of the highest-confidence iteration.
    pub text: String,

    /// Confidence of that iteration, in [0, 1].
    pub confidence: f64,

    /// One record per pass, failed passes included.
    pub iterations: Vec<IterationRecord>,

    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconstruction: Option<ReconstructionInfo>,
}

/// Layout summary attached to advanced responses.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LayoutAnalysis {
    #[serde(rename = "type")]
    pub kind: LayoutKind,

    /// Number of detected regions.
    pub regions: usize,
}

/// Response of the AI-reconstruction path.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AdvancedResponse {
    pub text: String,

    /// Always `"advanced_ai_reconstruction"`.
    pub method: String,

    pub confidence: f64,
    pub layout_analysis: LayoutAnalysis,
    pub success: bool,
}

/// Either engine outcome.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum EngineResponse {
    Advanced(AdvancedResponse),
    Standard(StandardResponse),
}

impl EngineResponse {
    pub fn reconstruction(&self) -> Option<&ReconstructionInfo> {
        match self {
            EngineResponse::Advanced(_) => None,
            EngineResponse::Standard(r) => r.reconstruction.as_ref(),
        }
    }
}

/// State and intermediate results for a single document lifecycle. Owned
/// exclusively by one request.
struct DocumentContext {
    use_reconstruction: bool,
    current_img: DynamicImage,
    regions: Vec<Region>,
    reconstruction: Option<ReconstructionInfo>,
    best_text: String,
    best_confidence: f64,
    history: Vec<IterationRecord>,
}

/// The iterative OCR engine.
pub struct IterativeOcrEngine {
    config: EngineConfig,
    recognizer: Arc<dyn TextRecognizer>,
    scorer: ConfidenceScorer,
    providers: Arc<VisionProviderSet>,
    patterns: Arc<PatternStore>,
}

impl IterativeOcrEngine {
    pub fn new(
        config: EngineConfig,
        recognizer: Arc<dyn TextRecognizer>,
        providers: Arc<VisionProviderSet>,
        patterns: Arc<PatternStore>,
    ) -> Self {
        Self {
            config,
            recognizer,
            scorer: ConfidenceScorer::default(),
            providers,
            patterns,
        }
    }

    /// Standard iterative pipeline.
    #[instrument(level = "debug", skip_all, fields(len = image_bytes.len(), recon = use_reconstruction))]
    pub async fn process(
        &self,
        image_bytes: &[u8],
        use_reconstruction: bool,
    ) -> Result<StandardResponse, EngineError> {
        imaging::validate(image_bytes, self.config.max_image_size_mb)?;

        let bytes = image_bytes.to_vec();
        let original =
            match tokio::task::spawn_blocking(move || imaging::decode(&bytes)).await {
                Ok(Ok(img)) => img,
                Ok(Err(_)) => return Err(EngineError::Corrupted),
                Err(join_err) => return Err(EngineError::Internal(join_err.to_string())),
            };

        let mut ctx = DocumentContext {
            use_reconstruction,
            current_img: original,
            regions: Vec::new(),
            reconstruction: None,
            best_text: String::new(),
            best_confidence: 0.0,
            history: Vec::new(),
        };

        // Reconstruction and layout analysis are independent; run them
        // concurrently before entering the loop.
        let (recon_result, layout_result) = futures::join!(
            self.run_reconstruction(image_bytes, use_reconstruction),
            analyze_layout(image_bytes.to_vec()),
        );
        if let Some((img, info)) = recon_result {
            info!("Using high-fidelity reconstructed source");
            ctx.current_img = img;
            ctx.reconstruction = Some(info);
        }
        (ctx.regions, _) = layout_result;

        for i in 0..self.config.max_iterations {
            self.run_iteration(&mut ctx, i).await;
        }

        Ok(StandardResponse {
            success: !ctx.best_text.is_empty(),
            text: ctx.best_text,
            confidence: ctx.best_confidence,
            iterations: ctx.history,
            reconstruction: ctx.reconstruction,
        })
    }

    /// AI-driven pipeline with contextual learning. Falls back to the
    /// standard path when every provider fails.
    #[instrument(level = "debug", skip_all, fields(doc_type = doc_type.unwrap_or("-")))]
    pub async fn process_advanced(
        &self,
        image_bytes: &[u8],
        doc_type: Option<&str>,
    ) -> Result<EngineResponse, EngineError> {
        imaging::validate(image_bytes, self.config.max_image_size_mb)?;

        let doc_type = doc_type
            .unwrap_or(&self.config.default_doc_type)
            .to_owned();

        // Parallel initialization: layout analysis and learned-pattern
        // retrieval.
        let (layout_result, pattern) = futures::join!(
            analyze_layout(image_bytes.to_vec()),
            self.patterns.get_best(&doc_type),
        );
        let (regions, layout) = layout_result;

        let context = ReconstructionContext {
            font_metadata: pattern.as_ref().map(|p| p.font_metadata.to_string()),
            accuracy_score: pattern.as_ref().map(|p| p.accuracy_score),
            layout_type: layout,
            region_count: regions.len(),
        };

        let ai_result = self
            .providers
            .reconstruct_with_ai(image_bytes, Some("openai"), Some(&context), true)
            .await;

        let reconstruction = match ai_result {
            Ok(reconstruction) => reconstruction,
            Err(err) => {
                warn!("AI reconstruction failed ({err}) | Triggering iterative fallback");
                return self
                    .process(image_bytes, true)
                    .await
                    .map(EngineResponse::Standard);
            }
        };

        let confidence = self.scorer.calculate(&reconstruction.text);

        // Learning write: scheduled, never awaited. The store swallows its
        // own failures, so this task cannot disturb the response.
        let patterns = self.patterns.clone();
        let model = reconstruction.model.clone();
        let layout_name = layout.as_str();
        let learn_doc_type = doc_type.clone();
        tokio::spawn(async move {
            patterns
                .record(
                    &learn_doc_type,
                    json!({
                        "source": "ai_reconstruction",
                        "model": model,
                        "layout": layout_name,
                    }),
                    confidence,
                )
                .await;
        });

        Ok(EngineResponse::Advanced(AdvancedResponse {
            text: reconstruction.text,
            method: "advanced_ai_reconstruction".to_owned(),
            confidence,
            layout_analysis: LayoutAnalysis {
                kind: layout,
                regions: regions.len(),
            },
            success: true,
        }))
    }

    /// Run the reconstruction preprocessor, when enabled and available.
    /// Failure leaves the original image in play.
    async fn run_reconstruction(
        &self,
        image_bytes: &[u8],
        use_reconstruction: bool,
    ) -> Option<(DynamicImage, ReconstructionInfo)> {
        if !use_reconstruction || !capabilities::reconstruction_available() {
            return None;
        }
        info!("Executing reconstruction preprocessor pipeline");
        let bytes = image_bytes.to_vec();
        let iterations = self.config.max_iterations;
        let result = tokio::task::spawn_blocking(move || {
            let (out_bytes, summary) = recon::reconstruct_bytes(&bytes, iterations)?;
            let img = imaging::decode(&out_bytes)?;
            Ok::<_, anyhow::Error>((img, summary))
        })
        .await;
        match result {
            Ok(Ok((img, meta))) => Some((
                img,
                ReconstructionInfo {
                    preview_text: None,
                    meta,
                },
            )),
            Ok(Err(err)) => {
                warn!("Reconstruction pipeline failed: {err}");
                None
            }
            Err(err) => {
                warn!("Reconstruction task panicked: {err}");
                None
            }
        }
    }

    /// Execute a single pass. Failures become history entries; they never
    /// abort the document.
    async fn run_iteration(&self, ctx: &mut DocumentContext, i: usize) {
        match self.try_iteration(ctx, i).await {
            Ok(()) => {}
            Err(err) => {
                error!("Iteration {} failed: {err}", i + 1);
                ctx.history.push(IterationRecord::Failed {
                    iteration: i + 1,
                    error: "failed".to_owned(),
                });
            }
        }
    }

    async fn try_iteration(&self, ctx: &mut DocumentContext, i: usize) -> Result<()> {
        let recon_active = ctx.use_reconstruction && capabilities::reconstruction_available();
        let img = ctx.current_img.clone();
        let thresh =
            tokio::task::spawn_blocking(move || preprocess_frame(&img, i, recon_active))
                .await
                .context("Preprocess task panicked")?;

        // Adaptive strategy: exactly on the second pass, under the
        // confidence threshold, with more than one region to aim at.
        let use_regions = i == 1
            && ctx.best_confidence < self.config.confidence_threshold
            && ctx.regions.len() > 1;

        let (text, method) = if use_regions {
            (
                self.extract_from_regions(&thresh, &ctx.regions).await,
                ExtractionMethod::RegionBased,
            )
        } else {
            (
                self.recognizer.recognize(&thresh).await?,
                ExtractionMethod::FullPage,
            )
        };

        let confidence = self.scorer.calculate(&text);
        ctx.history.push(IterationRecord::Completed {
            iteration: i + 1,
            text_length: text.chars().count(),
            confidence,
            method,
            preview_text: preview(&text),
        });

        if confidence > ctx.best_confidence {
            ctx.best_text = text;
            ctx.best_confidence = confidence;
        }

        // The next pass always starts from the enhanced working image, not
        // from this pass's thresholded frame or region mosaic.
        let img = ctx.current_img.clone();
        ctx.current_img =
            tokio::task::spawn_blocking(move || imaging::enhance_between_iterations(&img))
                .await
                .context("Enhance task panicked")?;
        Ok(())
    }

    /// Targeted extraction over padded ROIs, concatenated top-to-bottom.
    /// A single failing region is skipped, not fatal.
    async fn extract_from_regions(&self, thresh: &GrayImage, regions: &[Region]) -> String {
        let (img_w, img_h) = thresh.dimensions();
        let mut combined = Vec::new();
        for region in regions {
            let [x, y, w, h] = region.bbox;
            if x >= img_w || y >= img_h {
                continue;
            }
            let roi = imageops::crop_imm(thresh, x, y, w.min(img_w - x), h.min(img_h - y))
                .to_image();
            if roi.is_empty() {
                continue;
            }
            let padded = imaging::prepare_roi(&roi, ROI_PADDING);
            match self.recognizer.recognize(&padded).await {
                Ok(text) if !text.trim().is_empty() => {
                    combined.push(text.trim().to_owned());
                }
                Ok(_) => {}
                Err(err) => warn!("Region extraction failed: {err}"),
            }
        }
        combined.join("\n\n")
    }
}

/// Detect regions and classify the layout, off the I/O scheduler.
async fn analyze_layout(bytes: Vec<u8>) -> (Vec<Region>, LayoutKind) {
    let result = tokio::task::spawn_blocking(move || {
        let regions = layout::detect_regions(&bytes);
        let kind = layout::classify_layout(&regions);
        (regions, kind)
    })
    .await;
    match result {
        Ok(out) => out,
        Err(err) => {
            error!("Layout analysis task panicked: {err}");
            (Vec::new(), LayoutKind::Empty)
        }
    }
}

/// Sharpen, optionally strip redactions and overlays on the first pass,
/// then grayscale and Otsu-threshold.
fn preprocess_frame(img: &DynamicImage, iteration: usize, recon_active: bool) -> GrayImage {
    let enhanced = imaging::sharpen(img);
    let enhanced = if recon_active && iteration == 0 {
        let rgb = enhanced.to_rgb8();
        let (cleared, _) = recon::remove_redactions(&rgb);
        let (neutral, _) = recon::remove_color_overlay(&cleared);
        DynamicImage::ImageRgb8(neutral)
    } else {
        enhanced
    };
    imaging::otsu_binarize(&enhanced.to_luma8())
}

/// Truncate text to a short preview.
fn preview(text: &str) -> String {
    if text.chars().count() > PREVIEW_CHARS {
        let head: String = text.chars().take(PREVIEW_CHARS).collect();
        format!("{head}...")
    } else {
        text.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use image::{Rgb, RgbImage};

    use super::*;
    use crate::config::Environment;
    use crate::providers::{ProviderError, Reconstruction, VisionProvider};

    /// A recognizer that replays a scripted sequence of outcomes.
    struct ScriptedRecognizer {
        outcomes: Mutex<VecDeque<Result<String, String>>>,
    }

    impl ScriptedRecognizer {
        fn new(outcomes: Vec<Result<String, String>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
            })
        }
    }

    #[async_trait]
    impl TextRecognizer for ScriptedRecognizer {
        async fn recognize(&self, _image: &GrayImage) -> Result<String> {
            match self.outcomes.lock().unwrap().pop_front() {
                Some(Ok(text)) => Ok(text),
                Some(Err(msg)) => Err(anyhow!(msg)),
                None => Ok(String::new()),
            }
        }
    }

    struct OkProvider;

    #[async_trait]
    impl VisionProvider for OkProvider {
        fn name(&self) -> &'static str {
            "openai"
        }

        async fn reconstruct(
            &self,
            _image: &[u8],
            _prompt: &str,
        ) -> Result<Reconstruction, ProviderError> {
            Ok(Reconstruction {
                text: "hello".to_owned(),
                model: "gpt-4o".to_owned(),
            })
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl VisionProvider for FailingProvider {
        fn name(&self) -> &'static str {
            "openai"
        }

        async fn reconstruct(
            &self,
            _image: &[u8],
            _prompt: &str,
        ) -> Result<Reconstruction, ProviderError> {
            Err(ProviderError::Unknown("down".to_owned()))
        }
    }

    fn test_settings(dir: &Path) -> crate::config::Settings {
        crate::config::Settings {
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

    fn engine_with(
        recognizer: Arc<dyn TextRecognizer>,
        providers: VisionProviderSet,
        patterns: Arc<PatternStore>,
    ) -> IterativeOcrEngine {
        IterativeOcrEngine::new(
            EngineConfig::default(),
            recognizer,
            Arc::new(providers),
            patterns,
        )
    }

    fn local_patterns(dir: &Path) -> Arc<PatternStore> {
        Arc::new(PatternStore::new(&test_settings(dir)))
    }

    /// A white page with two well-separated text-like blocks, so layout
    /// analysis finds more than one region.
    fn two_block_page() -> Vec<u8> {
        let mut img = RgbImage::from_pixel(300, 300, Rgb([255, 255, 255]));
        for (bx, by, bw, bh) in [(30u32, 40u32, 120u32, 30u32), (30, 180, 150, 40)] {
            for x in bx..bx + bw {
                for y in by..by + bh {
                    img.put_pixel(x, y, Rgb([0, 0, 0]));
                }
            }
        }
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[tokio::test]
    async fn test_empty_input_is_rejected_before_decoding() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(
            ScriptedRecognizer::new(vec![]),
            VisionProviderSet::with_providers(vec![]),
            local_patterns(dir.path()),
        );
        let err = engine.process(b"", false).await.unwrap_err();
        assert_eq!(err.to_string(), "Empty image content");
    }

    #[tokio::test]
    async fn test_oversized_input_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(
            ScriptedRecognizer::new(vec![]),
            VisionProviderSet::with_providers(vec![]),
            local_patterns(dir.path()),
        );
        let body = vec![0u8; 12 * 1024 * 1024];
        let err = engine.process(&body, false).await.unwrap_err();
        assert_eq!(err.to_string(), "Image size exceeds 10MB limit");
    }

    #[tokio::test]
    async fn test_corrupted_input() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(
            ScriptedRecognizer::new(vec![]),
            VisionProviderSet::with_providers(vec![]),
            local_patterns(dir.path()),
        );
        let err = engine.process(b"not an image at all", false).await.unwrap_err();
        assert_eq!(err.to_string(), "Corrupted or unsupported image format");
    }

    #[tokio::test]
    async fn test_region_fallback_pass_wins() {
        // Pass 0 reads poorly; pass 1 goes region-based (two regions, two
        // recognizer calls); pass 2 reads a mid-quality full page. The
        // region pass should win and define the response text.
        let roi_a = "Invoice Number 12345 Date 2024-01-15 Acme Corporation Limited";
        let roi_b = "Total Amount Due 1,234.56 EUR Payment Terms Net Thirty Days";
        let recognizer = ScriptedRecognizer::new(vec![
            Ok("xx".to_owned()),
            Ok(roi_a.to_owned()),
            Ok(roi_b.to_owned()),
            Ok("Partial low quality scan output".to_owned()),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(
            recognizer,
            VisionProviderSet::with_providers(vec![]),
            local_patterns(dir.path()),
        );

        let response = engine.process(&two_block_page(), false).await.unwrap();

        assert_eq!(response.iterations.len(), 3);
        assert_eq!(response.text, format!("{roi_a}\n\n{roi_b}"));
        assert!(response.success);

        let methods: Vec<_> = response
            .iterations
            .iter()
            .map(|r| match r {
                IterationRecord::Completed { method, .. } => Some(*method),
                IterationRecord::Failed { .. } => None,
            })
            .collect();
        assert_eq!(
            methods,
            vec![
                Some(ExtractionMethod::FullPage),
                Some(ExtractionMethod::RegionBased),
                Some(ExtractionMethod::FullPage),
            ]
        );

        // Best confidence equals the max over iterations.
        let max = response
            .iterations
            .iter()
            .filter_map(IterationRecord::confidence)
            .fold(0.0f64, f64::max);
        assert_eq!(response.confidence, max);
        let IterationRecord::Completed { confidence, .. } = &response.iterations[1]
        else {
            panic!("iteration 1 should have completed");
        };
        assert_eq!(response.confidence, *confidence);
    }

    #[tokio::test]
    async fn test_no_region_pass_above_threshold() {
        // A strong first pass keeps every later pass in full-page mode.
        let strong = "Invoice Total Date Name Tax amounts and descriptive line items \
                      covering the whole receipt with many proper words included here";
        let recognizer = ScriptedRecognizer::new(vec![
            Ok(strong.to_owned()),
            Ok("noise".to_owned()),
            Ok("noise".to_owned()),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(
            recognizer,
            VisionProviderSet::with_providers(vec![]),
            local_patterns(dir.path()),
        );

        let response = engine.process(&two_block_page(), false).await.unwrap();
        assert_eq!(response.iterations.len(), 3);
        for record in &response.iterations {
            let IterationRecord::Completed { method, .. } = record else {
                panic!("no pass should fail");
            };
            assert_eq!(*method, ExtractionMethod::FullPage);
        }
        assert_eq!(response.text, strong);
    }

    #[tokio::test]
    async fn test_all_iterations_fail() {
        let recognizer = ScriptedRecognizer::new(vec![
            Err("ocr crashed".to_owned()),
            Err("ocr crashed".to_owned()),
            Err("ocr crashed".to_owned()),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(
            recognizer,
            VisionProviderSet::with_providers(vec![]),
            local_patterns(dir.path()),
        );

        let response = engine.process(&two_block_page(), false).await.unwrap();
        assert_eq!(response.iterations.len(), 3);
        assert_eq!(response.confidence, 0.0);
        assert_eq!(response.text, "");
        assert!(!response.success);
        for (idx, record) in response.iterations.iter().enumerate() {
            match record {
                IterationRecord::Failed { iteration, error } => {
                    assert_eq!(*iteration, idx + 1);
                    assert_eq!(error, "failed");
                }
                IterationRecord::Completed { .. } => panic!("expected failure records"),
            }
        }
    }

    #[tokio::test]
    async fn test_failed_iteration_does_not_abort_document() {
        let good = "Invoice Date Total with plenty of readable words in this line \
                    and some more content for a reasonable score overall";
        let recognizer = ScriptedRecognizer::new(vec![
            Err("ocr crashed".to_owned()),
            // Pass 1 goes region-based (best is still 0.0): two ROI calls.
            Ok(good.to_owned()),
            Ok(String::new()),
            Ok("short tail".to_owned()),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(
            recognizer,
            VisionProviderSet::with_providers(vec![]),
            local_patterns(dir.path()),
        );

        let response = engine.process(&two_block_page(), false).await.unwrap();
        assert_eq!(response.iterations.len(), 3);
        assert!(matches!(
            response.iterations[0],
            IterationRecord::Failed { iteration: 1, .. }
        ));
        // Empty ROI output is dropped from the join.
        assert_eq!(response.text, good);
        assert!(response.success);
    }

    #[tokio::test]
    async fn test_preview_truncation() {
        let long = "m".repeat(80);
        let recognizer = ScriptedRecognizer::new(vec![
            Ok(long.clone()),
            Ok(long.clone()),
            Ok(long.clone()),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(
            recognizer,
            VisionProviderSet::with_providers(vec![]),
            local_patterns(dir.path()),
        );

        let response = engine.process(&two_block_page(), false).await.unwrap();
        let IterationRecord::Completed {
            preview_text,
            text_length,
            ..
        } = &response.iterations[0]
        else {
            panic!("expected a completed record");
        };
        assert_eq!(*text_length, 80);
        assert_eq!(preview_text.chars().count(), 53);
        assert!(preview_text.ends_with("..."));
    }

    #[tokio::test]
    async fn test_advanced_path_success() {
        let dir = tempfile::tempdir().unwrap();
        let patterns = local_patterns(dir.path());
        let engine = engine_with(
            ScriptedRecognizer::new(vec![]),
            VisionProviderSet::with_providers(vec![Box::new(OkProvider)]),
            patterns.clone(),
        );

        let response = engine
            .process_advanced(&two_block_page(), Some("invoice"))
            .await
            .unwrap();
        let EngineResponse::Advanced(advanced) = response else {
            panic!("expected the advanced response");
        };
        assert_eq!(advanced.text, "hello");
        assert_eq!(advanced.method, "advanced_ai_reconstruction");
        // score("hello"): density 1.0, one word, five chars.
        assert_eq!(advanced.confidence, 0.02);
        assert_eq!(advanced.layout_analysis.regions, 2);
        assert!(advanced.success);

        // The learning write is fire-and-forget; give it a moment to land.
        let mut recorded = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            recorded = patterns.get_best("invoice").await;
            if recorded.is_some() {
                break;
            }
        }
        let pattern = recorded.expect("learning write should land");
        assert_eq!(pattern.accuracy_score, 0.02);
        assert_eq!(pattern.font_metadata["model"], "gpt-4o");
        assert_eq!(pattern.font_metadata["source"], "ai_reconstruction");
    }

    #[tokio::test]
    async fn test_advanced_path_falls_back_to_iterative() {
        let recognizer = ScriptedRecognizer::new(vec![
            Ok("fallback text from the iterative engine".to_owned()),
            Ok("more".to_owned()),
            Ok("more".to_owned()),
            Ok("more".to_owned()),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(
            recognizer,
            VisionProviderSet::with_providers(vec![Box::new(FailingProvider)]),
            local_patterns(dir.path()),
        );

        let response = engine
            .process_advanced(&two_block_page(), None)
            .await
            .unwrap();
        let EngineResponse::Standard(standard) = response else {
            panic!("expected fallback to the standard response");
        };
        assert_eq!(standard.iterations.len(), 3);
        assert!(standard.success);
    }

    #[tokio::test]
    async fn test_advanced_path_validates_input() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(
            ScriptedRecognizer::new(vec![]),
            VisionProviderSet::with_providers(vec![Box::new(OkProvider)]),
            local_patterns(dir.path()),
        );
        let err = engine.process_advanced(b"", None).await.unwrap_err();
        assert_eq!(err.to_string(), "Empty image content");
    }

    #[test]
    fn test_iteration_record_serialization() {
        let completed = IterationRecord::Completed {
            iteration: 2,
            text_length: 10,
            confidence: 0.7,
            method: ExtractionMethod::RegionBased,
            preview_text: "hello".to_owned(),
        };
        let value = serde_json::to_value(&completed).unwrap();
        assert_eq!(value["iteration"], 2);
        assert_eq!(value["method"], "region-based");

        let failed = IterationRecord::Failed {
            iteration: 1,
            error: "failed".to_owned(),
        };
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value, json!({"iteration": 1, "error": "failed"}));
    }
}
