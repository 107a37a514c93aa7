use super::instance_locks::{InstanceLockGuard, InstanceLocks};
use crate::agent_api::agent_config::UpdateConfig;
use crate::error::{AgentError, RollbackOutcome};
use crate::services::containers::structs::{ContainerInfo, ContainerSpec, RuntimeError};
use crate::services::containers::ContainerRuntime;
use anyhow::{Context, Result};
use skiff_library::{bail_error, transaction::TransactionId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

/// How a finished update left its instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The new configuration is running
    Success,
    /// The update failed and the previous configuration is running again
    RolledBack,
    /// The update failed and the instance could not be brought back
    Failed,
}

/// Sent to the completion notifier when an update task ends
#[derive(Debug, Clone)]
pub struct UpdateReport {
    pub instance: String,
    pub tid: TransactionId,
    pub outcome: UpdateOutcome,
    pub error: Option<String>,
}
impl UpdateReport {
    fn new(instance: &str, tid: &TransactionId, res: &Result<()>) -> Self {
        let (outcome, error) = match res {
            Ok(_) => (UpdateOutcome::Success, None),
            Err(e) => {
                let outcome = match e.downcast_ref::<AgentError>() {
                    Some(AgentError::UpdateFailed {
                        rollback: RollbackOutcome::Restored,
                        ..
                    }) => UpdateOutcome::RolledBack,
                    _ => UpdateOutcome::Failed,
                };
                (outcome, Some(format!("{:#}", e)))
            },
        };
        UpdateReport {
            instance: instance.to_string(),
            tid: tid.clone(),
            outcome,
            error,
        }
    }
}

fn runtime_cause(e: &anyhow::Error) -> Option<&RuntimeError> {
    e.chain().find_map(|c| c.downcast_ref::<RuntimeError>())
}

/// Every host port `target` wants must be free, or held by the instance being replaced
fn check_ports(containers: &[ContainerInfo], target: &ContainerSpec) -> Result<(), AgentError> {
    for port in target.host_ports() {
        if let Some(holder) = containers
            .iter()
            .find(|c| c.name != target.name && c.ports.contains(&port))
        {
            return Err(AgentError::PortInUse {
                port,
                holder: holder.name.clone(),
            });
        }
    }
    Ok(())
}

/// Creates, replaces, and otherwise mutates container instances, one operation per instance at a time.
/// Updates are break-before-make: the old container is stopped and removed before its replacement is created,
/// since the name and published ports cannot be held by both at once.
pub struct UpdateOrchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    locks: Arc<InstanceLocks>,
    config: Arc<UpdateConfig>,
    completion: Option<UnboundedSender<UpdateReport>>,
}

impl UpdateOrchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, locks: Arc<InstanceLocks>, config: Arc<UpdateConfig>) -> Arc<Self> {
        Arc::new(UpdateOrchestrator {
            runtime,
            locks,
            config,
            completion: None,
        })
    }

    /// Like [UpdateOrchestrator::new], but every finished update is also reported on `completion`
    pub fn with_completion_notifier(
        runtime: Arc<dyn ContainerRuntime>,
        locks: Arc<InstanceLocks>,
        config: Arc<UpdateConfig>,
        completion: UnboundedSender<UpdateReport>,
    ) -> Arc<Self> {
        Arc::new(UpdateOrchestrator {
            runtime,
            locks,
            config,
            completion: Some(completion),
        })
    }

    pub fn locks(&self) -> &Arc<InstanceLocks> {
        &self.locks
    }

    fn claim(&self, name: &str, tid: &TransactionId) -> Result<InstanceLockGuard> {
        match self.locks.try_acquire(name) {
            Some(g) => Ok(g),
            None => {
                warn!(tid=tid, instance=%name, "Instance is already being updated");
                anyhow::bail!(AgentError::AlreadyUpdating(name.to_string()))
            },
        }
    }

    /// Read-only checks that must pass before an update may touch anything.
    /// Returns the current container list.
    pub async fn precheck(&self, target: &ContainerSpec, tid: &TransactionId) -> Result<Vec<ContainerInfo>> {
        let containers = self.runtime.list_containers(tid).await?;
        let images = self.runtime.list_images(tid).await?;
        let reference = target.image_ref();
        if !images.iter().any(|i| i.repo_tags.contains(&reference)) {
            anyhow::bail!(AgentError::ImageNotFound(reference));
        }
        if !containers.iter().any(|c| c.name == target.name) {
            anyhow::bail!(AgentError::InstanceNotFound(target.name.clone()));
        }
        check_ports(&containers, target)?;
        Ok(containers)
    }

    /// Replace the running instance `target.name` with `target` and wait for the result.
    /// The work runs on its own task, so dropping the returned future does not interrupt an update in flight.
    #[tracing::instrument(skip(self, target, deadline), fields(tid=tid, instance=%target.name))]
    pub async fn update(
        self: &Arc<Self>,
        target: ContainerSpec,
        deadline: Option<Duration>,
        tid: &TransactionId,
    ) -> Result<String> {
        self.precheck(&target, tid).await?;
        let guard = self.claim(&target.name, tid)?;
        let name = target.name.clone();
        match self.dispatch(target, guard, deadline, tid.clone()).await {
            Ok(Ok(())) => Ok(name),
            Ok(Err(e)) => Err(e),
            Err(e) => bail_error!(tid=tid, error=%e, "Update task did not complete"),
        }
    }

    /// Like [UpdateOrchestrator::update], but returns as soon as the checks pass and the instance is claimed
    #[tracing::instrument(skip(self, target, deadline), fields(tid=tid, instance=%target.name))]
    pub async fn update_async(
        self: &Arc<Self>,
        target: ContainerSpec,
        deadline: Option<Duration>,
        tid: &TransactionId,
    ) -> Result<String> {
        self.precheck(&target, tid).await?;
        let guard = self.claim(&target.name, tid)?;
        let name = target.name.clone();
        let _detached = self.dispatch(target, guard, deadline, tid.clone());
        info!(tid=tid, instance=%name, "Update dispatched");
        Ok(name)
    }

    fn dispatch(
        self: &Arc<Self>,
        target: ContainerSpec,
        guard: InstanceLockGuard,
        deadline: Option<Duration>,
        tid: TransactionId,
    ) -> JoinHandle<Result<()>> {
        let svc = self.clone();
        let deadline = deadline.unwrap_or(Duration::from_secs(svc.config.default_deadline_sec));
        tokio::spawn(async move {
            let res = svc.execute(&target, deadline, &tid).await;
            drop(guard);
            match &res {
                Ok(_) => info!(tid=%tid, instance=%target.name, "Update complete"),
                Err(e) => error!(tid=%tid, instance=%target.name, error=%format!("{:#}", e), "Update failed"),
            };
            if let Some(completion) = &svc.completion {
                if completion.send(UpdateReport::new(&target.name, &tid, &res)).is_err() {
                    debug!(tid=%tid, "Update completion receiver is gone");
                }
            }
            res
        })
    }

    /// Capture the old configuration, then swap it for `target` within `deadline`
    async fn execute(&self, target: &ContainerSpec, deadline: Duration, tid: &TransactionId) -> Result<()> {
        let started = Instant::now();
        let prior = match timeout(deadline, self.runtime.inspect_container(&target.name, tid)).await {
            Ok(Ok(p)) => p,
            Ok(Err(e)) => return Err(e.context(format!("failed to capture configuration of '{}'", target.name))),
            Err(_) => anyhow::bail!(AgentError::DeadlineExceeded {
                instance: target.name.clone(),
                deadline,
            }),
        };
        debug!(tid=tid, prior=?prior, "Captured prior configuration");

        let remaining = deadline.saturating_sub(started.elapsed());
        match timeout(remaining, self.swap(target, &prior, tid)).await {
            Ok(res) => res,
            Err(_) => {
                warn!(tid=tid, instance=%target.name, deadline=?deadline, "Update ran past its deadline, rolling back");
                let rollback = match timeout(deadline, self.restore(&prior, tid)).await {
                    Ok(Ok(_)) => RollbackOutcome::Restored,
                    Ok(Err(e)) => RollbackOutcome::Failed(format!("{:#}", e)),
                    Err(_) => RollbackOutcome::Failed("rollback ran past the deadline".to_string()),
                };
                anyhow::bail!(AgentError::UpdateFailed {
                    instance: target.name.clone(),
                    cause: format!("deadline of {:?} exceeded", deadline),
                    rollback,
                })
            },
        }
    }

    /// stop -> remove -> create -> start, rolling back to `prior` if the new instance won't come up
    async fn swap(&self, target: &ContainerSpec, prior: &ContainerSpec, tid: &TransactionId) -> Result<()> {
        let name = &target.name;
        match self.runtime.stop_container(name, false, tid).await {
            Ok(_) => debug!(tid=tid, instance=%name, "Old instance stopped"),
            Err(e) if matches!(runtime_cause(&e), Some(RuntimeError::NotRunning(_))) => {
                warn!(tid=tid, instance=%name, "Old instance was not running")
            },
            Err(e) => return Err(e.context(format!("failed to stop '{}'", name))),
        };

        if let Err(e) = self.runtime.remove_container(name, false, tid).await {
            let cause = format!("failed to remove old instance: {:#}", e);
            let rollback = match self.runtime.start_container(name, tid).await {
                Ok(_) => RollbackOutcome::Restored,
                Err(re) => RollbackOutcome::Failed(format!("{:#}", re)),
            };
            anyhow::bail!(AgentError::UpdateFailed {
                instance: name.clone(),
                cause,
                rollback,
            });
        }
        debug!(tid=tid, instance=%name, "Old instance removed");

        let created = match self.runtime.create_container(target, tid).await {
            Ok(_) => self.runtime.start_container(name, tid).await,
            Err(e) => Err(e),
        };
        match created {
            Ok(_) => {
                info!(tid=tid, instance=%name, image=%target.image_ref(), "New instance running");
                Ok(())
            },
            Err(e) => {
                let cause = format!("{:#}", e);
                warn!(tid=tid, instance=%name, error=%cause, "New instance failed to start, restoring previous configuration");
                let rollback = match self.restore(prior, tid).await {
                    Ok(_) => RollbackOutcome::Restored,
                    Err(re) => {
                        error!(tid=tid, instance=%name, error=%format!("{:#}", re), "Rollback failed");
                        RollbackOutcome::Failed(format!("{:#}", re))
                    },
                };
                anyhow::bail!(AgentError::UpdateFailed {
                    instance: name.clone(),
                    cause,
                    rollback,
                })
            },
        }
    }

    /// Bring back the instance exactly as it was, clearing whatever holds its name first
    async fn restore(&self, prior: &ContainerSpec, tid: &TransactionId) -> Result<()> {
        match self.runtime.remove_container(&prior.name, true, tid).await {
            Ok(_) => debug!(tid=tid, instance=%prior.name, "Cleared partial instance"),
            Err(e) if matches!(runtime_cause(&e), Some(RuntimeError::NotFound(_))) => (),
            Err(e) => return Err(e.context("failed to clear partial instance")),
        };
        self.runtime
            .create_container(prior, tid)
            .await
            .context("failed to re-create previous instance")?;
        self.runtime
            .start_container(&prior.name, tid)
            .await
            .context("failed to start previous instance")?;
        info!(tid=tid, instance=%prior.name, "Previous configuration restored");
        Ok(())
    }

    /// Create and start a brand new instance
    #[tracing::instrument(skip(self, spec), fields(tid=tid, instance=%spec.name))]
    pub async fn run(&self, spec: ContainerSpec, tid: &TransactionId) -> Result<String> {
        let containers = self.runtime.list_containers(tid).await?;
        let images = self.runtime.list_images(tid).await?;
        let reference = spec.image_ref();
        if !images.iter().any(|i| i.repo_tags.contains(&reference)) {
            anyhow::bail!(AgentError::ImageNotFound(reference));
        }
        if containers.iter().any(|c| c.name == spec.name) {
            anyhow::bail!(AgentError::InstanceExists(spec.name.clone()));
        }
        check_ports(&containers, &spec)?;
        let _guard = self.claim(&spec.name, tid)?;

        self.runtime.create_container(&spec, tid).await?;
        if let Err(e) = self.runtime.start_container(&spec.name, tid).await {
            if let Err(re) = self.runtime.remove_container(&spec.name, true, tid).await {
                warn!(tid=tid, instance=%spec.name, error=%re, "Failed to clean up instance that did not start");
            }
            return Err(e.context(format!("failed to start '{}'", spec.name)));
        }
        info!(tid=tid, instance=%spec.name, image=%reference, "Instance running");
        Ok(spec.name)
    }

    pub async fn start(&self, name: &str, tid: &TransactionId) -> Result<()> {
        let _guard = self.claim(name, tid)?;
        self.runtime.start_container(name, tid).await
    }

    pub async fn stop(&self, name: &str, force: bool, tid: &TransactionId) -> Result<()> {
        let _guard = self.claim(name, tid)?;
        self.runtime.stop_container(name, force, tid).await
    }

    pub async fn remove(&self, name: &str, force: bool, tid: &TransactionId) -> Result<()> {
        let _guard = self.claim(name, tid)?;
        self.runtime.remove_container(name, force, tid).await
    }
}
