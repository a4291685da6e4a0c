//! The `worker` subcommand: the queue-worker loop.

use crate::config::Settings;
use crate::jobs::QueueWorker;
use crate::prelude::*;

use super::build_pipeline;

/// The `worker` subcommand. Runs until interrupted; a clean interrupt is a
/// normal shutdown (exit 0), a failed startup is fatal (exit 1).
#[instrument(level = "debug", skip_all)]
pub async fn cmd_worker(settings: Arc<Settings>) -> Result<()> {
    let pipeline = build_pipeline(&settings).await?;
    let worker = QueueWorker::new(
        settings.redis_url.clone(),
        pipeline.engine,
        settings.enable_reconstruction,
    );

    tokio::select! {
        result = worker.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Worker interrupted, shutting down");
            Ok(())
        }
    }
}
