//! CLI subcommands.

pub mod event;
pub mod health;
pub mod presign;
pub mod process;
pub mod schema;
pub mod submit;
pub mod worker;

use crate::aws::load_aws_config;
use crate::config::Settings;
use crate::engine::recognize::TesseractRecognizer;
use crate::engine::{EngineConfig, IterativeOcrEngine};
use crate::patterns::PatternStore;
use crate::prelude::*;
use crate::providers::VisionProviderSet;
use crate::storage::StorageService;

/// The wired-up processing stack shared by subcommands.
pub(crate) struct Pipeline {
    pub engine: Arc<IterativeOcrEngine>,
    pub storage: Arc<StorageService>,
    #[allow(dead_code)]
    pub patterns: Arc<PatternStore>,
}

/// Build the full pipeline from settings. Fails when the OCR binary is
/// missing, which is fatal for anything that extracts text.
pub(crate) async fn build_pipeline(settings: &Arc<Settings>) -> Result<Pipeline> {
    let aws = load_aws_config(&settings.aws_region).await;
    let recognizer = Arc::new(TesseractRecognizer::new()?);
    let patterns = Arc::new(PatternStore::new(settings));
    let providers = Arc::new(VisionProviderSet::from_settings(settings));
    let engine = Arc::new(IterativeOcrEngine::new(
        EngineConfig::from(settings.as_ref()),
        recognizer,
        providers,
        patterns.clone(),
    ));
    let storage = Arc::new(StorageService::new(&aws, settings));
    Ok(Pipeline {
        engine,
        storage,
        patterns,
    })
}

/// Print a serializable value as pretty JSON on stdout.
pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}
