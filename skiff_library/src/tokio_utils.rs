use crate::transaction::TransactionId;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::debug;

pub type TokioRuntime = Arc<Runtime>;

/// Build the multi-threaded runtime the agent runs on.
/// Zero or missing intervals fall back to Tokio's defaults.
pub fn build_tokio_runtime(
    tokio_event_interval: &Option<u32>,
    tokio_queue_interval: &Option<u32>,
    num_threads: &Option<usize>,
    tid: &TransactionId,
) -> anyhow::Result<TokioRuntime> {
    let event = tokio_event_interval.filter(|i| *i > 0).unwrap_or(61);
    let queue = tokio_queue_interval.filter(|i| *i > 0).unwrap_or(31);
    debug!(tid = tid, event_interval = event, queue_interval = queue, "building tokio runtime");

    let mut rt = tokio::runtime::Builder::new_multi_thread();
    let rt: &mut tokio::runtime::Builder = match num_threads {
        Some(n) => rt.worker_threads(*n),
        None => &mut rt,
    };
    match rt.enable_all().event_interval(event).global_queue_interval(queue).build() {
        Ok(rt) => Ok(Arc::new(rt)),
        Err(e) => {
            anyhow::bail!(format!("Tokio thread runtime for main failed to start because: {}", e));
        },
    }
}
