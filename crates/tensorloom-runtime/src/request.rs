use tensorloom_core::{SlotInputs, SlotResult};
use tokio::sync::oneshot;

/// One slot of work bound for a stage, carrying its own reply channel.
///
/// Dropping the receiver cancels the slot: the batcher skips closed slots at
/// dispatch time, and a result that arrives after the caller hung up is
/// discarded by the worker's send.
#[derive(Debug)]
pub struct StageRequest {
    pub request_id: String,
    pub inputs: SlotInputs,
    pub enqueued_at: std::time::Instant,
    pub resp_tx: oneshot::Sender<StageResponse>,
}

#[derive(Debug)]
pub struct StageResponse {
    pub result: SlotResult,
    pub timings: Timings,
}

/// Microsecond wall-clock accounting for one slot.
#[derive(Debug, Default, Clone, Copy)]
pub struct Timings {
    /// Arrival at the stage queue until the worker picked the batch up.
    pub queued_us: u64,
    /// Executor call for the whole batch this slot rode in.
    pub execute_us: u64,
}
