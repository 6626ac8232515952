use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod cli;
mod config;
mod consensus;
mod error;
mod node;
mod privatetx;
mod process;
mod proxy;
mod rpc;
#[cfg(test)]
mod testutil;
mod types;

use cli::Cli;
use config::NodeConfig;
use error::HibernatorError;
use node::{Monitor, NodeControl, PeerRegistry};
use process::StatusPoller;
use proxy::ProxyServer;
use rpc::{RpcClient, RpcService};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.verbosity)),
        )
        .init();

    let cfg = match config::load(&cli.config) {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!("invalid configuration: {e}");
            return ExitCode::from(1);
        }
    };
    info!("starting node hibernator {}", cfg.basic.name);

    match run(cfg).await {
        Ok(()) => {
            info!("node hibernator shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) if is_config_error(&e) => {
            error!("invalid configuration: {e}");
            ExitCode::from(1)
        }
        Err(e) => {
            error!("fatal error: {e}");
            ExitCode::from(2)
        }
    }
}

fn is_config_error(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<HibernatorError>(),
        Some(HibernatorError::Config(_))
    )
}

async fn run(cfg: Arc<NodeConfig>) -> anyhow::Result<()> {
    // one rpc client per TLS configuration, shared by everything that
    // talks to the same endpoint
    let bc_client = RpcClient::new(cfg.basic.blockchain_client.tls_config.as_ref())?;

    consensus::verify_client_consensus(&bc_client, &cfg.basic).await?;
    let consensus = consensus::new_consensus(&cfg, bc_client.clone());

    // managed processes, with an initial status reading
    let bc_process = process::new_process(&cfg.basic.blockchain_client.process, bc_client.clone());
    bc_process.update_status().await;
    let pm_process = match &cfg.basic.privacy_manager {
        Some(pm) => {
            let pm_client = RpcClient::new(pm.tls_config.as_ref())?;
            let process = process::new_process(&pm.process, pm_client);
            process.update_status().await;
            Some(process)
        }
        None => None,
    };

    let peers = PeerRegistry::new(&cfg.peers)?;
    info!("{} sibling hibernators configured", peers.len());

    let ctl = NodeControl::new(
        Arc::clone(&cfg),
        Arc::clone(&bc_process),
        pm_process.clone(),
        consensus,
        peers,
    );
    info!("managed node is initially {}", ctl.client_status());

    let cancel = CancellationToken::new();
    let (err_tx, mut err_rx) = mpsc::channel::<anyhow::Error>(8);

    // background workers: process status polling and the 1 s timer tick
    let mut processes = vec![bc_process];
    processes.extend(pm_process);
    let poller = StatusPoller::new(
        processes,
        Duration::from_secs(cfg.basic.upcheck_polling_interval),
    )
    .spawn(cancel.clone());
    let monitor = Monitor::new(Arc::clone(&ctl)).spawn(cancel.clone());

    // servers
    let (rpc_task, _rpc_handle) = RpcService::new(Arc::clone(&ctl), cfg.basic.server.clone())
        .start(cancel.clone(), err_tx.clone())
        .await?;
    let mut proxy_tasks = Vec::new();
    for proxy in ProxyServer::make_proxies(&ctl)? {
        let (task, _handle) = proxy.start(cancel.clone(), err_tx.clone())?;
        proxy_tasks.push(task);
    }

    // supervise until interrupted or a component reports a fatal error
    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            Ok(())
        }
        err = err_rx.recv() => {
            Err(err.unwrap_or_else(|| anyhow::anyhow!("error channel closed unexpectedly")))
        }
    };

    // orderly teardown: servers drain in-flight work, timers stop, and the
    // managed client is left running
    cancel.cancel();
    let _ = monitor.await;
    let _ = poller.await;
    let _ = rpc_task.await;
    for task in proxy_tasks {
        let _ = task.await;
    }

    result
}
