//! Usage recording
//!
//! Handlers enqueue [`UsageRecord`]s without waiting; a single worker drains
//! the queue into the [`UsageSink`]. A full queue or a failed write is logged
//! and never reaches the caller.

use genapi_common::{UsageRecord, UsageSink};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct UsageRecorder {
    tx: mpsc::Sender<UsageRecord>,
}

impl UsageRecorder {
    /// Start the worker and return the handle used to enqueue records.
    ///
    /// The worker exits once every recorder clone has been dropped and the
    /// queue is drained.
    pub fn spawn(sink: Arc<dyn UsageSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run_worker(sink, rx));
        (Self { tx }, worker)
    }

    /// Enqueue a record without blocking
    pub fn record(&self, record: UsageRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                warn!(
                    api_id = %record.api_id,
                    request_id = %record.request_id,
                    "Usage queue full, dropping record"
                );
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                warn!(
                    api_id = %record.api_id,
                    "Usage worker stopped, dropping record"
                );
            }
        }
    }
}

/// Wait for the worker to flush the queue after every recorder is dropped.
///
/// Returns `false` and abandons the remaining records if `timeout` elapses
/// first.
pub async fn drain(worker: JoinHandle<()>, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, worker).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!("Usage worker failed: {}", e);
            false
        }
        Err(_) => {
            warn!(
                "Usage queue not drained within {}s, dropping the rest",
                timeout.as_secs_f64()
            );
            false
        }
    }
}

async fn run_worker(sink: Arc<dyn UsageSink>, mut rx: mpsc::Receiver<UsageRecord>) {
    info!("Usage worker started");

    while let Some(record) = rx.recv().await {
        match sink.append_usage(&record).await {
            Ok(()) => debug!(api_id = %record.api_id, "Usage recorded"),
            Err(e) => warn!(
                api_id = %record.api_id,
                request_id = %record.request_id,
                "Failed to record usage: {}",
                e
            ),
        }
    }

    info!("Usage worker stopped");
}
