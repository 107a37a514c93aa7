use crate::transaction::TransactionId;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle as TokioHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// Start an async function inside a Tokio worker task.
/// It will be executed every `period`, the first time one `period` after starting.
/// The task exits once `true` is sent on the `stop` channel (or the sender is dropped).
/// A call of `function` that is already running when stop is signaled is allowed to complete,
/// so awaiting the returned handle guarantees no execution is left in flight.
pub fn periodic_tokio_task<S, T>(
    period: Duration,
    tid: TransactionId,
    service: Arc<S>,
    mut stop: watch::Receiver<bool>,
    function: fn(Arc<S>, TransactionId) -> T,
) -> anyhow::Result<TokioHandle<()>>
where
    T: Future<Output = ()> + Send + 'static,
    S: Send + Sync + 'static,
{
    if period.is_zero() {
        anyhow::bail!("Periodic task '{}' cannot have a zero period", tid);
    }
    let td = async move {
        debug!(tid=tid, typename=%std::any::type_name::<S>(), period=?period, "periodic tokio task started");
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
              biased;
              res = stop.changed() => {
                  if res.is_err() || *stop.borrow() {
                      break;
                  }
              },
              _ = ticker.tick() => {
                  tracing::trace!(tid = tid, "Executing");
                  function(service.clone(), tid.clone()).await;
                  tracing::trace!(tid = tid, "Completed");
              },
            }
        }
        debug!(tid=tid, typename=%std::any::type_name::<S>(), "periodic tokio task exiting");
    };
    Ok(tokio::spawn(td))
}
