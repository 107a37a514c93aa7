use crate::services::containers::structs::RuntimeError;
use std::time::Duration;
use tonic::{Code, Status};

/// How the attempt to put an instance back after a failed update went
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// The previous configuration is running again
    Restored,
    /// Neither the old nor the new configuration is running
    Failed(String),
}
impl std::fmt::Display for RollbackOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RollbackOutcome::Restored => write!(f, "previous state restored"),
            RollbackOutcome::Failed(e) => write!(f, "rollback failed: {}; instance is not running", e),
        }
    }
}

/// Conditions callers are expected to branch on.
/// These travel inside [anyhow::Error] and are recovered with `downcast_ref` at the RPC edge.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("received {0} message before a transfer was declared")]
    OutOfOrder(String),
    #[error("unexpected {0} message")]
    UnexpectedMessage(String),
    #[error("not enough disk space: {needed} bytes needed, {available} available")]
    InsufficientSpace { needed: u64, available: u64 },
    #[error("too much data: {declared} bytes declared, {received} received")]
    Overrun { declared: u64, received: u64 },
    #[error("incomplete transfer: {declared} bytes declared, {received} received")]
    IncompleteTransfer { declared: u64, received: u64 },
    #[error("chunk of {size} bytes is larger than the announced chunk size of {chunk_size}")]
    ChunkTooLarge { size: u64, chunk_size: u64 },
    #[error("chunk {index} arrived after a short chunk")]
    ChunkAfterShort { index: u64 },
    #[error("transfer stream closed: {0}")]
    StreamClosed(String),
    #[error("image '{0}' not found")]
    ImageNotFound(String),
    #[error("instance '{0}' not found")]
    InstanceNotFound(String),
    #[error("instance '{0}' already exists")]
    InstanceExists(String),
    #[error("port {port} is already in use by '{holder}'")]
    PortInUse { port: u16, holder: String },
    #[error("instance '{0}' is already being updated")]
    AlreadyUpdating(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("update of '{instance}' did not finish within {deadline:?}")]
    DeadlineExceeded { instance: String, deadline: Duration },
    #[error("update of '{instance}' failed: {cause}; {rollback}")]
    UpdateFailed {
        instance: String,
        cause: String,
        rollback: RollbackOutcome,
    },
}

fn agent_code(e: &AgentError) -> Code {
    match e {
        AgentError::OutOfOrder(_) | AgentError::AlreadyUpdating(_) => Code::Unavailable,
        AgentError::UnexpectedMessage(_)
        | AgentError::Overrun { .. }
        | AgentError::IncompleteTransfer { .. }
        | AgentError::ChunkTooLarge { .. }
        | AgentError::ChunkAfterShort { .. }
        | AgentError::InvalidArgument(_) => Code::InvalidArgument,
        AgentError::InsufficientSpace { .. } => Code::ResourceExhausted,
        AgentError::StreamClosed(_) => Code::Cancelled,
        AgentError::ImageNotFound(_) | AgentError::InstanceNotFound(_) => Code::NotFound,
        AgentError::InstanceExists(_) | AgentError::PortInUse { .. } => Code::AlreadyExists,
        AgentError::DeadlineExceeded { .. } => Code::DeadlineExceeded,
        AgentError::UpdateFailed { rollback, .. } => match rollback {
            RollbackOutcome::Restored => Code::Aborted,
            RollbackOutcome::Failed(_) => Code::DataLoss,
        },
    }
}

fn runtime_code(e: &RuntimeError) -> Code {
    match e {
        RuntimeError::NotFound(_) => Code::NotFound,
        RuntimeError::NotRunning(_) | RuntimeError::Conflict(_) => Code::FailedPrecondition,
        RuntimeError::Internal(_) => Code::Internal,
    }
}

/// Translate an error into the [Status] returned to RPC callers.
/// The outermost typed condition in the cause chain picks the code, the message is the full chain.
pub fn status_from_error(e: &anyhow::Error) -> Status {
    let code = e
        .chain()
        .find_map(|cause| {
            if let Some(agent) = cause.downcast_ref::<AgentError>() {
                return Some(agent_code(agent));
            }
            cause.downcast_ref::<RuntimeError>().map(runtime_code)
        })
        .unwrap_or(Code::Internal);
    Status::new(code, format!("{:#}", e))
}
