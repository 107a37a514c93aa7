use crate::services::containers::structs::PruneReport;
use crate::services::containers::ContainerRuntime;
use anyhow::Result;
use parking_lot::Mutex;
use skiff_library::threading::periodic_tokio_task;
use skiff_library::transaction::TransactionId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug, serde::Deserialize, Clone)]
pub struct JanitorConfig {
    /// Run the periodic cleanup at all
    pub enabled: bool,
    /// Seconds between cleanups
    pub interval_sec: u64,
}

enum State {
    Idle,
    Running {
        stop: watch::Sender<bool>,
        handle: JoinHandle<()>,
    },
    Stopped,
}

/// What one cleanup pass freed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub containers: PruneReport,
    pub images: PruneReport,
}
impl ReclaimReport {
    pub fn space_reclaimed(&self) -> u64 {
        self.containers.space_reclaimed + self.images.space_reclaimed
    }
}

/// Does one round of cleanup
struct Reclaimer {
    runtime: Arc<dyn ContainerRuntime>,
}
impl Reclaimer {
    /// Containers and images are pruned independently, a failure of one is logged and doesn't stop the other
    async fn prune(&self, tid: &TransactionId) -> ReclaimReport {
        let containers = match self.runtime.prune_containers(tid).await {
            Ok(r) => r,
            Err(e) => {
                error!(tid=tid, error=%e, "Failed to prune stopped containers");
                PruneReport::default()
            },
        };
        let images = match self.runtime.prune_images(tid).await {
            Ok(r) => r,
            Err(e) => {
                error!(tid=tid, error=%e, "Failed to prune dangling images");
                PruneReport::default()
            },
        };
        let report = ReclaimReport { containers, images };
        info!(
            tid = tid,
            containers = report.containers.removed,
            images = report.images.removed,
            reclaimed = report.space_reclaimed(),
            "Prune finished"
        );
        report
    }

    async fn tick(svc: Arc<Self>, tid: TransactionId) {
        svc.prune(&tid).await;
    }
}

/// Periodically frees stopped containers and dangling images.
/// Can be started once, and stopped once.
pub struct Janitor {
    reclaimer: Arc<Reclaimer>,
    interval: Duration,
    state: Mutex<State>,
}

impl Janitor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &JanitorConfig) -> Arc<Self> {
        Arc::new(Janitor {
            reclaimer: Arc::new(Reclaimer { runtime }),
            interval: Duration::from_secs(config.interval_sec),
            state: Mutex::new(State::Idle),
        })
    }

    /// Launch the background loop, the first cleanup happens one interval from now
    pub fn start(&self, tid: &TransactionId) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            State::Idle => (),
            State::Running { .. } => anyhow::bail!("Janitor is already running"),
            State::Stopped => anyhow::bail!("Janitor has been stopped and cannot be restarted"),
        };
        let (stop, stop_rx) = watch::channel(false);
        let handle = periodic_tokio_task(
            self.interval,
            tid.clone(),
            self.reclaimer.clone(),
            stop_rx,
            Reclaimer::tick,
        )?;
        *state = State::Running { stop, handle };
        info!(tid=tid, interval=?self.interval, "Janitor started");
        Ok(())
    }

    /// Signal the loop to exit and wait until any cleanup in progress has finished
    pub async fn stop(&self, tid: &TransactionId) -> Result<()> {
        let previous = std::mem::replace(&mut *self.state.lock(), State::Stopped);
        if let State::Running { stop, handle } = previous {
            // the receiver lives in the task, it may already be gone
            let _ = stop.send(true);
            if let Err(e) = handle.await {
                anyhow::bail!("Janitor task failed: {}", e);
            }
            info!(tid = tid, "Janitor stopped");
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), State::Running { .. })
    }

    /// One cleanup pass right now, outside the schedule
    pub async fn prune_once(&self, tid: &TransactionId) -> ReclaimReport {
        self.reclaimer.prune(tid).await
    }
}
