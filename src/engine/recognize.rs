//! Text recognition backends.
//!
//! The engine talks to OCR through [`TextRecognizer`], so tests can script
//! extraction results and deployments can swap the binary. The default
//! backend shells out to the Tesseract CLI, which is the one OCR engine we
//! can assume on every host.

use image::{DynamicImage, GrayImage};
use tokio::process::Command;

use crate::prelude::*;

/// Interface to an OCR backend.
#[async_trait]
pub trait TextRecognizer: Send + Sync + 'static {
    /// Extract text from a preprocessed (binarized) image.
    async fn recognize(&self, image: &GrayImage) -> Result<String>;
}

/// Tesseract invocation flags.
#[derive(Debug, Clone)]
pub struct TesseractConfig {
    /// Language pack, e.g. `"eng"` or `"spa+eng"`.
    pub language: String,

    /// Page segmentation mode, when overridden.
    pub psm: Option<u8>,
}

impl Default for TesseractConfig {
    fn default() -> Self {
        Self {
            language: "eng".to_owned(),
            psm: None,
        }
    }
}

/// OCR backend shelling out to the `tesseract` binary.
pub struct TesseractRecognizer {
    binary: PathBuf,
    config: TesseractConfig,
}

impl TesseractRecognizer {
    /// Locate the `tesseract` binary on `PATH`.
    pub fn new() -> Result<Self> {
        Self::with_config(TesseractConfig::default())
    }

    pub fn with_config(config: TesseractConfig) -> Result<Self> {
        let binary = which::which("tesseract")
            .context("tesseract not found (install tesseract-ocr)")?;
        Ok(Self { binary, config })
    }
}

#[async_trait]
impl TextRecognizer for TesseractRecognizer {
    #[instrument(level = "trace", skip_all)]
    async fn recognize(&self, image: &GrayImage) -> Result<String> {
        // Tesseract reads from disk, so encode to a temp file off the I/O
        // scheduler first.
        let image = image.clone();
        let file = tokio::task::spawn_blocking(move || -> Result<tempfile::NamedTempFile> {
            let file = tempfile::Builder::new()
                .suffix(".png")
                .tempfile()
                .context("Failed to create temp image file")?;
            DynamicImage::ImageLuma8(image)
                .save_with_format(file.path(), image::ImageFormat::Png)
                .context("Failed to encode page image")?;
            Ok(file)
        })
        .await
        .context("Image encode task panicked")??;

        let mut command = Command::new(&self.binary);
        command
            .arg(file.path())
            .arg("stdout")
            .args(["-l", &self.config.language]);
        if let Some(psm) = self.config.psm {
            command.args(["--psm", &psm.to_string()]);
        }

        let output = command
            .output()
            .await
            .context("Failed to launch tesseract")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("tesseract failed: {}", stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
