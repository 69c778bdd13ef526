use anyhow::Result;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

use crate::{SchedulerHandle, StageRequest};

/// Window policy for dynamic batching. A `max_delay` of zero dispatches
/// every request as soon as it arrives.
#[derive(Clone, Copy, Debug)]
pub struct BatchPolicy {
    pub max_batch: usize,
    pub max_delay: Duration,
}

/// A formed batch bound for one worker. Slot order is response order.
#[derive(Debug)]
pub struct BatchJob {
    pub requests: Vec<StageRequest>,
    pub created_at: std::time::Instant,
}

/// Collects requests for one stage into batches: dispatch on reaching
/// `max_batch`, or when the oldest pending request has waited `max_delay`.
pub struct Batcher {
    policy: BatchPolicy,
    rx: mpsc::Receiver<StageRequest>,
    scheduler: SchedulerHandle,
}

impl Batcher {
    pub fn new(
        policy: BatchPolicy,
        rx: mpsc::Receiver<StageRequest>,
        scheduler: SchedulerHandle,
    ) -> Self {
        Self {
            policy,
            rx,
            scheduler,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut pending: Vec<StageRequest> = Vec::new();
        let mut first_seen: Option<Instant> = None;

        loop {
            tokio::select! {
                maybe_req = self.rx.recv() => {
                    match maybe_req {
                        None => break,
                        Some(req) => {
                            if pending.is_empty() { first_seen = Some(Instant::now()); }
                            pending.push(req);
                            if pending.len() >= self.policy.max_batch {
                                self.flush(&mut pending).await?;
                                first_seen = None;
                            }
                        }
                    }
                }
                _ = async {
                    // Sleep out the remainder of the batching window.
                    if let Some(t0) = first_seen {
                        sleep(self.policy.max_delay.saturating_sub(t0.elapsed())).await;
                    }
                }, if first_seen.is_some() => {
                    if !pending.is_empty() {
                        self.flush(&mut pending).await?;
                        first_seen = None;
                    }
                }
            }
        }

        Ok(())
    }

    async fn flush(&self, pending: &mut Vec<StageRequest>) -> Result<()> {
        let mut requests = std::mem::take(pending);

        // Slots whose caller already hung up never reach a worker.
        requests.retain(|req| !req.resp_tx.is_closed());
        if requests.is_empty() {
            return Ok(());
        }

        debug!(batch = requests.len(), "dispatching batch");
        let job = BatchJob {
            requests,
            created_at: std::time::Instant::now(),
        };

        self.scheduler.submit(job).await?;
        Ok(())
    }
}
