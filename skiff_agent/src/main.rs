use anyhow::Result;
use clap::Parser;
use skiff_agent_library::agent_api::config::{AgentConfig, Configuration};
use skiff_agent_library::agent_api::create_agent;
use skiff_agent_library::services::containers::docker::DockerRuntime;
use skiff_library::tokio_utils::build_tokio_runtime;
use skiff_library::transaction::{TransactionId, CLEAN_TID, JANITOR_TID, STARTUP_TID};
use skiff_library::{bail_error, logging::start_tracing, utils::wait_for_exit_signal};
use skiff_rpc::rpc::skiff_agent_server::SkiffAgentServer;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::Server;
use tracing::{debug, error, info};
use utils::Args;

pub mod utils;

async fn run(server_config: AgentConfig, tid: &TransactionId) -> Result<()> {
    debug!(tid=tid, config=?server_config, "loaded configuration");

    if !DockerRuntime::supported(tid).await {
        bail_error!(tid = tid, "Docker daemon is not reachable, cannot manage containers");
    }
    let runtime = match DockerRuntime::new(server_config.runtime.clone(), tid) {
        Ok(r) => Arc::new(r),
        Err(e) => bail_error!(tid=tid, error=%e, "Error connecting to the container runtime on startup"),
    };
    let agent = match create_agent(server_config.clone(), runtime, tid).await {
        Ok(a) => a,
        Err(e) => bail_error!(tid=tid, error=%e, "Error creating agent on startup"),
    };
    let janitor = agent.janitor.clone();
    if server_config.janitor.enabled {
        janitor.start(&JANITOR_TID)?;
    } else {
        info!(tid = tid, "Janitor disabled, skipping periodic cleanup");
    }

    let addr = format!("{}:{}", server_config.address, server_config.port);
    info!(tid=tid, name=%server_config.name, address=%addr, "Starting RPC server");
    let server = Server::builder()
        .timeout(Duration::from_secs(server_config.timeout_sec))
        .add_service(SkiffAgentServer::new(agent))
        .serve(addr.parse()?);
    let _j = tokio::spawn(async move {
        if let Err(e) = server.await {
            error!(error=%e, "RPC server error");
        }
    });

    let signal = wait_for_exit_signal(tid).await?;
    info!(tid = tid, signal = signal, "Shutting down");
    janitor.stop(tid).await?;
    Ok(())
}

async fn clean(server_config: AgentConfig, tid: &TransactionId) -> Result<()> {
    debug!(tid=tid, config=?server_config, "loaded configuration");

    let runtime = Arc::new(DockerRuntime::new(server_config.runtime.clone(), tid)?);
    let agent = create_agent(server_config, runtime, tid).await?;
    let report = agent.janitor.prune_once(tid).await;
    info!(
        tid = tid,
        containers = report.containers.removed,
        images = report.images.removed,
        space_reclaimed = report.space_reclaimed(),
        "Cleanup finished"
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Args::parse();
    let (tid, server_config): (&TransactionId, _) = match cli.command {
        Some(utils::Commands::Clean) => (&CLEAN_TID, Configuration::boxed(cli.config.as_deref(), None)?),
        None => (&STARTUP_TID, Configuration::boxed(cli.config.as_deref(), None)?),
    };
    let _guard = start_tracing(&server_config.logging, tid)?;
    let agent_rt = build_tokio_runtime(
        &server_config.tokio_event_interval,
        &server_config.tokio_queue_interval,
        &server_config.tokio_threads,
        tid,
    )?;

    match cli.command {
        Some(utils::Commands::Clean) => agent_rt.block_on(clean(server_config, tid))?,
        None => agent_rt.block_on(run(server_config, tid))?,
    }
    Ok(())
}
