use std::time::Instant;

use tokio::sync::{oneshot, OwnedMutexGuard};
use tracing::{error, info};

use crate::engine::orchestrator::PredictionEngine;
use crate::engine::types::TrainingReport;
use crate::workers::WorkerError;

/// Completion of a background training run.
#[derive(Debug)]
pub struct TrainingHandle {
    rx: oneshot::Receiver<Result<TrainingReport, WorkerError>>,
}

impl TrainingHandle {
    pub async fn wait(self) -> Result<TrainingReport, WorkerError> {
        self.rx.await.map_err(|_| WorkerError::Cancelled)?
    }
}

/// Runs a training pass on its own task. The guard is released when the run finishes,
/// after parameters and counter are committed.
pub fn spawn_training(engine: PredictionEngine, guard: OwnedMutexGuard<()>) -> TrainingHandle {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let start = Instant::now();
        info!("background training started");
        let result = engine.train_with_guard(guard).await;
        match &result {
            Ok(report) => info!(
                completed = report.is_completed(),
                duration_ms = start.elapsed().as_millis() as u64,
                "background training finished"
            ),
            Err(e) => error!(
                error = %e,
                duration_ms = start.elapsed().as_millis() as u64,
                "background training failed, counter left untouched"
            ),
        }
        let _ = tx.send(result.map_err(WorkerError::from));
    });
    TrainingHandle { rx }
}

/// Catch-up run for outcomes that never reached the trigger threshold.
pub async fn run_catch_up_training(engine: PredictionEngine) -> Result<(), WorkerError> {
    let tracker = engine.tracker_state().await?;
    if tracker.n_samples_since_training <= 0 {
        info!("no new outcomes since last training, skipping catch-up");
        return Ok(());
    }

    info!(pending = tracker.n_samples_since_training, "catch-up training started");
    match engine.force_train().await? {
        TrainingReport::Completed {
            run_id,
            topics_trained,
            duration_ms,
            ..
        } => info!(
            run_id = %run_id,
            topics = topics_trained.len(),
            duration_ms,
            "catch-up training completed"
        ),
        TrainingReport::InsufficientData { available, required } => {
            info!(available, required, "catch-up training skipped: insufficient data")
        }
        TrainingReport::AlreadyRunning => info!("catch-up training skipped: run in progress"),
    }
    Ok(())
}
