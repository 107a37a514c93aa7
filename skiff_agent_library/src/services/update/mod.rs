pub mod instance_locks;
pub mod orchestrator;

pub use instance_locks::{InstanceLockGuard, InstanceLocks};
pub use orchestrator::{UpdateOrchestrator, UpdateOutcome, UpdateReport};
