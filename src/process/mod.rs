use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ProcessConfig, ProcessControlKind, UpcheckMethod, UpcheckReturnType};
use crate::error::{HibernatorError, Result};
use crate::rpc::RpcClient;

pub mod docker;
pub mod shell;

pub use docker::DockerProcess;
pub use shell::ShellProcess;

const UPCHECK_RETRIES: u32 = 30;
const UPCHECK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Control surface for one managed OS process. Start and Stop are
/// serialized per instance; both are no-ops when the process is already in
/// the requested state.
#[async_trait]
pub trait Process: Send + Sync {
    fn name(&self) -> &str;

    /// Last observed up/down status.
    fn status(&self) -> bool;

    /// Probes the up-check endpoint now and records the result.
    async fn update_status(&self) -> bool;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Polls the up-check once per second until the process reports up, for
    /// at most thirty seconds.
    async fn wait_up(&self) -> bool {
        for attempt in 1..=UPCHECK_RETRIES {
            if self.update_status().await {
                return true;
            }
            debug!("waiting for {} to come up, attempt {attempt}", self.name());
            tokio::time::sleep(UPCHECK_POLL_INTERVAL).await;
        }
        false
    }

    /// Polls the up-check once per second until the process reports down,
    /// for at most thirty seconds.
    async fn wait_down(&self) -> bool {
        for attempt in 1..=UPCHECK_RETRIES {
            if !self.update_status().await {
                return true;
            }
            debug!("waiting for {} to go down, attempt {attempt}", self.name());
            tokio::time::sleep(UPCHECK_POLL_INTERVAL).await;
        }
        false
    }
}

/// Builds the process controller matching the configured control type.
pub fn new_process(cfg: &ProcessConfig, client: RpcClient) -> Arc<dyn Process> {
    match cfg.control_type {
        ProcessControlKind::Shell => Arc::new(ShellProcess::new(cfg.clone(), client)),
        ProcessControlKind::Docker => Arc::new(DockerProcess::new(cfg.clone(), client)),
    }
}

/// HTTP up-check against a managed process.
#[derive(Debug, Clone)]
pub(crate) struct Upcheck {
    client: RpcClient,
    cfg: crate::config::UpcheckConfig,
}

impl Upcheck {
    pub(crate) fn new(client: RpcClient, cfg: crate::config::UpcheckConfig) -> Self {
        Self { client, cfg }
    }

    /// True when the endpoint answers 200 and the body matches what the
    /// configuration expects.
    pub(crate) async fn probe(&self) -> bool {
        match self.cfg.return_type {
            UpcheckReturnType::String => {
                let method = match self.cfg.method {
                    UpcheckMethod::Get => "GET",
                    UpcheckMethod::Post => "POST",
                };
                match self.client.call_rest(&self.cfg.url, method, &self.cfg.body).await {
                    Ok(body) => match &self.cfg.expected {
                        Some(expected) => body.trim() == expected.trim(),
                        None => true,
                    },
                    Err(e) => {
                        debug!("upcheck {} failed: {e}", self.cfg.url);
                        false
                    }
                }
            }
            UpcheckReturnType::RpcResult => {
                match self.client.call_raw_rpc(&self.cfg.url, &self.cfg.body).await {
                    Ok(resp) => resp.error.is_none(),
                    Err(e) => {
                        debug!("upcheck {} failed: {e}", self.cfg.url);
                        false
                    }
                }
            }
        }
    }
}

/// Runs a command to completion, requiring a zero exit status.
pub(crate) async fn run_command(process: &str, operation: &str, argv: &[String]) -> Result<()> {
    let status = tokio::process::Command::new(&argv[0])
        .args(&argv[1..])
        .status()
        .await
        .map_err(|e| {
            warn!("{operation} command for {process} failed to launch: {e}");
            HibernatorError::ProcessLifecycle {
                name: process.to_string(),
                operation: operation.to_string(),
            }
        })?;
    if !status.success() {
        warn!("{operation} command for {process} exited with {status}");
        return Err(HibernatorError::ProcessLifecycle {
            name: process.to_string(),
            operation: operation.to_string(),
        });
    }
    Ok(())
}

/// Periodically refreshes the observed status of every managed process, so
/// an externally stopped client is noticed without traffic.
pub struct StatusPoller {
    processes: Vec<Arc<dyn Process>>,
    interval: Duration,
}

impl StatusPoller {
    pub fn new(processes: Vec<Arc<dyn Process>>, interval: Duration) -> Self {
        Self { processes, interval }
    }

    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for process in &self.processes {
                            process.update_status().await;
                        }
                    }
                }
            }
        })
    }
}
