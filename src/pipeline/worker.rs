//! Bounded job queue and worker pool. The queue is the only admission
//! point; jobs beyond its capacity are refused instead of buffered.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use super::JobCoordinator;

#[derive(Debug, Clone)]
pub struct JobRequest {
    pub job_id: Uuid,
    pub user_id: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("job queue is full")]
pub struct QueueFull;

pub struct JobQueue {
    tx: mpsc::Sender<JobRequest>,
}

impl JobQueue {
    /// Spawn `worker_concurrency` workers draining a queue of at most
    /// `queue_max` pending jobs.
    pub fn start(
        coordinator: Arc<JobCoordinator>,
        worker_concurrency: usize,
        queue_max: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<JobRequest>(queue_max.max(1));
        let rx = Arc::new(Mutex::new(rx));
        for worker in 0..worker_concurrency.max(1) {
            let rx = rx.clone();
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                info!(worker, "job worker started");
                loop {
                    let request = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    let Some(request) = request else {
                        debug!(worker, "job queue closed, worker exiting");
                        break;
                    };
                    coordinator
                        .run(request.job_id, &request.user_id, &request.prompt)
                        .await;
                }
            });
        }
        Self { tx }
    }

    /// Admit a job or refuse with back-pressure.
    pub fn submit(&self, request: JobRequest) -> Result<(), QueueFull> {
        self.tx.try_send(request).map_err(|_| QueueFull)
    }
}
