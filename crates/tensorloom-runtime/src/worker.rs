use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tensorloom_core::{validate_slot, InferError, SlotResult, StageAdapter};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::{BatchJob, StageResponse, StageStats, Timings};

/// Owns one executor instance and drains its inbox one batch at a time.
/// Everything below the channel boundary is synchronous; stage concurrency
/// comes from running several workers.
pub struct Worker {
    pub id: u32,
    pub inbox: mpsc::Receiver<BatchJob>,
    pub adapter: Box<dyn StageAdapter>,
    pub stats: Arc<StageStats>,
}

struct SlotChannel {
    resp_tx: oneshot::Sender<StageResponse>,
    queued_us: u64,
}

impl Worker {
    pub async fn run(mut self) -> Result<()> {
        let caps = self.adapter.capabilities();
        info!(
            worker_id = self.id,
            stage = %self.adapter.spec().id,
            per_slot_faults = caps.per_slot_faults,
            "worker started"
        );
        while let Some(job) = self.inbox.recv().await {
            self.run_batch(job);
        }
        Ok(())
    }

    fn run_batch(&mut self, job: BatchJob) {
        let started = Instant::now();

        let mut batch = Vec::with_capacity(job.requests.len());
        let mut channels: Vec<Option<SlotChannel>> = Vec::with_capacity(job.requests.len());
        for req in job.requests {
            let queued_us = started
                .saturating_duration_since(req.enqueued_at)
                .as_micros() as u64;
            self.stats.record_queued(queued_us);
            batch.push(req.inputs);
            channels.push(Some(SlotChannel {
                resp_tx: req.resp_tx,
                queued_us,
            }));
        }

        // Admission per slot: a bad slot bounces here and its neighbors
        // still run. Tensors that pass are within the declared bounds by
        // the time the executor sees them.
        let stage = self.adapter.spec().id.clone();
        let verdicts: Vec<Result<(), InferError>> = {
            let spec = self.adapter.spec();
            if batch.len() > spec.max_batch {
                let err = InferError::BatchTooLarge {
                    stage: spec.id.clone(),
                    len: batch.len(),
                    max: spec.max_batch,
                };
                for channel in &mut channels {
                    self.stats.record_failure();
                    respond(channel, Err(err.clone()), 0);
                }
                return;
            }
            batch.iter().map(|slot| validate_slot(spec, slot)).collect()
        };

        let mut live = Vec::with_capacity(batch.len());
        let mut live_idx = Vec::with_capacity(batch.len());
        for (idx, (slot, verdict)) in batch.into_iter().zip(verdicts).enumerate() {
            match verdict {
                Ok(()) => {
                    live_idx.push(idx);
                    live.push(slot);
                }
                Err(err) => {
                    debug!(stage = %stage, slot = idx, error = %err, "slot rejected");
                    self.stats.record_failure();
                    respond(&mut channels[idx], Err(err), 0);
                }
            }
        }
        if live.is_empty() {
            return;
        }

        let live_len = live.len();
        let t0 = Instant::now();
        let outcome = self.adapter.execute(live);
        let execute_us = t0.elapsed().as_micros() as u64;
        self.stats.record_batch(live_len, execute_us);

        match outcome {
            Ok(results) => {
                if results.len() != live_len {
                    warn!(
                        stage = %stage,
                        got = results.len(),
                        want = live_len,
                        "executor broke the slot contract"
                    );
                    let defect = InferError::ExecutorFault {
                        stage: stage.clone(),
                        retry_safe: false,
                        message: format!(
                            "executor returned {} results for {live_len} slots",
                            results.len()
                        ),
                    };
                    for idx in &live_idx {
                        self.stats.record_failure();
                        respond(&mut channels[*idx], Err(defect.clone()), execute_us);
                    }
                    return;
                }
                for (idx, result) in live_idx.iter().zip(results) {
                    if result.is_err() {
                        self.stats.record_failure();
                    }
                    respond(&mut channels[*idx], result, execute_us);
                }
            }
            Err(err) => {
                // A whole-batch fault lands on every live slot identically.
                debug!(stage = %stage, error = %err, "batch execution failed");
                for idx in &live_idx {
                    self.stats.record_failure();
                    respond(&mut channels[*idx], Err(err.clone()), execute_us);
                }
            }
        }
    }
}

fn respond(channel: &mut Option<SlotChannel>, result: SlotResult, execute_us: u64) {
    if let Some(channel) = channel.take() {
        let _ = channel.resp_tx.send(StageResponse {
            result,
            timings: Timings {
                queued_us: channel.queued_us,
                execute_us,
            },
        });
    }
}
