//! Runtime detection of optional capabilities.
//!
//! The reconstruction pipeline is optional at deploy time (its imaging
//! dependencies may be absent or broken on minimal hosts), so we probe it
//! once at startup and memoize the answer. Nothing on the hot path ever
//! re-probes.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::OnceLock;

use image::{DynamicImage, Rgb, RgbImage};
use schemars::JsonSchema;

use crate::prelude::*;
use crate::recon;

/// Result of the one-time reconstruction probe.
#[derive(Debug, Clone)]
struct ReconProbe {
    available: bool,
    version: String,
}

static RECON_PROBE: OnceLock<ReconProbe> = OnceLock::new();

fn probe_reconstruction() -> ReconProbe {
    let result = catch_unwind(AssertUnwindSafe(|| {
        // Push a tiny synthetic page through the full pipeline. If the
        // imaging stack is unusable here, it will be unusable on real input.
        let page = RgbImage::from_pixel(32, 32, Rgb([255, 255, 255]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(page)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)?;
        recon::reconstruct_bytes(&bytes, 1)?;
        Ok::<_, anyhow::Error>(())
    }));

    match result {
        Ok(Ok(())) => {
            let version = env!("CARGO_PKG_VERSION").to_owned();
            info!("Reconstruction capability detected (version: {version})");
            ReconProbe {
                available: true,
                version,
            }
        }
        Ok(Err(err)) => {
            warn!("Reconstruction capability probe failed: {err}");
            ReconProbe {
                available: false,
                version: "not-installed".to_owned(),
            }
        }
        Err(_) => {
            warn!("Reconstruction capability probe panicked");
            ReconProbe {
                available: false,
                version: "not-installed".to_owned(),
            }
        }
    }
}

/// Is the reconstruction pipeline usable in this process?
pub fn reconstruction_available() -> bool {
    RECON_PROBE.get_or_init(probe_reconstruction).available
}

/// Version of the reconstruction pipeline, or `"not-installed"`.
pub fn reconstruction_version() -> &'static str {
    &RECON_PROBE.get_or_init(probe_reconstruction).version
}

/// Snapshot reported by the `/recon/status` surface.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct ReconStatus {
    /// Whether reconstruction is enabled by configuration.
    pub reconstruction_enabled: bool,

    /// Whether the reconstruction pipeline passed its startup probe.
    pub package_installed: bool,

    /// Probed pipeline version.
    pub package_version: String,
}

impl ReconStatus {
    pub fn current(reconstruction_enabled: bool) -> Self {
        Self {
            reconstruction_enabled,
            package_installed: reconstruction_available(),
            package_version: reconstruction_version().to_owned(),
        }
    }
}
