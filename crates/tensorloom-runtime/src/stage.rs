use std::sync::Arc;

use anyhow::{ensure, Result};
use tensorloom_core::{InferError, StageAdapter, StageCapabilities, StageSpec};
use tokio::sync::mpsc;
use tracing::error;

use crate::{BatchPolicy, Batcher, Scheduler, StageRequest, StageStats, Worker};

/// Requests waiting to enter a stage's batching window.
const REQUEST_QUEUE: usize = 1024;
/// Formed batches between the batcher and the scheduler.
const BATCH_QUEUE: usize = 8;

/// Submission side of one running stage.
#[derive(Clone)]
pub struct StageHandle {
    spec: Arc<StageSpec>,
    capabilities: StageCapabilities,
    tx: mpsc::Sender<StageRequest>,
    stats: Arc<StageStats>,
}

impl StageHandle {
    pub fn spec(&self) -> &StageSpec {
        &self.spec
    }

    pub fn capabilities(&self) -> StageCapabilities {
        self.capabilities
    }

    pub fn stats(&self) -> Arc<StageStats> {
        self.stats.clone()
    }

    /// Queue one slot. Failing to enqueue means the stage runtime is gone,
    /// which no caller input can cause.
    pub async fn submit(&self, request: StageRequest) -> Result<(), InferError> {
        self.tx.send(request).await.map_err(|_| {
            InferError::infrastructure(&self.spec.id, "stage request queue is closed")
        })
    }
}

/// Spawn the batcher, scheduler, and one worker per executor instance for a
/// stage, wired requests -> batcher -> scheduler -> workers.
///
/// Every adapter must describe the same stage; instance count is the stage's
/// concurrency cap because each worker inbox holds a single job.
pub fn launch_stage(
    adapters: Vec<Box<dyn StageAdapter>>,
    policy: BatchPolicy,
) -> Result<StageHandle> {
    ensure!(
        !adapters.is_empty(),
        "a stage needs at least one executor instance"
    );

    let spec = Arc::new(adapters[0].spec().clone());
    let capabilities = adapters[0].capabilities();
    let stats = Arc::new(StageStats::new());

    let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE);
    let (batch_tx, batch_rx) = mpsc::channel(BATCH_QUEUE);

    let mut worker_txs = Vec::with_capacity(adapters.len());
    for (id, adapter) in adapters.into_iter().enumerate() {
        let (tx, rx) = mpsc::channel(1);
        worker_txs.push(tx);
        let worker = Worker {
            id: id as u32,
            inbox: rx,
            adapter,
            stats: stats.clone(),
        };
        let stage_id = spec.id.clone();
        tokio::spawn(async move {
            if let Err(e) = worker.run().await {
                error!(stage = %stage_id, error = ?e, "worker exited");
            }
        });
    }

    let scheduler = Scheduler::new(batch_rx, worker_txs);
    let batcher = Batcher::new(policy, request_rx, Scheduler::handle(batch_tx));

    let stage_id = spec.id.clone();
    tokio::spawn(async move {
        if let Err(e) = scheduler.run().await {
            error!(stage = %stage_id, error = ?e, "scheduler exited");
        }
    });
    let stage_id = spec.id.clone();
    tokio::spawn(async move {
        if let Err(e) = batcher.run().await {
            error!(stage = %stage_id, error = ?e, "batcher exited");
        }
    });

    Ok(StageHandle {
        spec,
        capabilities,
        tx: request_tx,
        stats,
    })
}
