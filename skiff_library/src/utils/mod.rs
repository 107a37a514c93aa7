pub mod file_utils;
pub use file_utils as file;

use crate::bail_error;
use crate::transaction::TransactionId;
use anyhow::Result;
use async_process::Command;
use std::path::Path;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info};

/// Run a host tool such as the docker or tar CLI and return its trimmed stdout.
/// `program` must be an absolute path. A non-zero exit fails with the tool's own complaint.
/// The child is killed if the returned future is dropped, so a caller's deadline also bounds the tool.
pub async fn run_host_command(program: &str, args: &[&str], tid: &TransactionId) -> Result<String> {
    if !Path::new(program).is_absolute() {
        bail_error!(tid=tid, program=%program, "Host tools must be configured with an absolute path");
    }
    debug!(tid=tid, program=%program, args=?args, "Running host command");
    let output = match Command::new(program).args(args).kill_on_drop(true).output().await {
        Ok(out) => out,
        Err(e) => bail_error!(tid=tid, program=%program, error=%e, "Failed to start host command"),
    };
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if output.status.success() {
        return Ok(stdout);
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let complaint = match stderr.is_empty() {
        true => stdout,
        false => stderr,
    };
    error!(tid=tid, program=%program, args=?args, code=output.status.code(), output=%complaint, "Host command failed");
    anyhow::bail!("'{} {}' failed ({}): {}", program, args.join(" "), output.status, complaint)
}

/// Signals that ask the agent to shut down
fn exit_signals() -> [(SignalKind, &'static str); 5] {
    [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
        (SignalKind::quit(), "SIGQUIT"),
        (SignalKind::user_defined1(), "SIGUSR1"),
        (SignalKind::user_defined2(), "SIGUSR2"),
    ]
}

/// Block until the OS asks the agent to exit, returns the name of the signal that arrived
pub async fn wait_for_exit_signal(tid: &TransactionId) -> Result<&'static str> {
    let mut listeners = Vec::with_capacity(5);
    for (kind, name) in exit_signals() {
        match signal(kind) {
            Ok(s) => listeners.push((s, name)),
            Err(e) => bail_error!(tid=tid, signal=name, error=%e, "Failed to listen for exit signal"),
        }
    }
    info!(tid = tid, "Waiting on exit signal");
    let waits = listeners
        .iter_mut()
        .map(|(s, name)| Box::pin(async move { s.recv().await.map(|_| *name) }));
    let (received, _, _) = futures::future::select_all(waits).await;
    match received {
        Some(name) => {
            info!(tid = tid, signal = name, "Exit signal received");
            Ok(name)
        },
        None => bail_error!(tid = tid, "Signal stream closed before an exit signal arrived"),
    }
}
