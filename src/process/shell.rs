use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::config::ProcessConfig;
use crate::error::{HibernatorError, Result};
use crate::process::{run_command, Process, Upcheck};
use crate::rpc::RpcClient;

/// Process control backed by configured shell commands.
pub struct ShellProcess {
    cfg: ProcessConfig,
    upcheck: Upcheck,
    status: AtomicBool,
    // serializes start/stop per instance
    lock: Mutex<()>,
}

impl ShellProcess {
    pub fn new(cfg: ProcessConfig, client: RpcClient) -> Self {
        let upcheck = Upcheck::new(client, cfg.upcheck_config.clone());
        Self {
            cfg,
            upcheck,
            status: AtomicBool::new(false),
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl Process for ShellProcess {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    fn status(&self) -> bool {
        self.status.load(Ordering::SeqCst)
    }

    async fn update_status(&self) -> bool {
        let up = self.upcheck.probe().await;
        self.status.store(up, Ordering::SeqCst);
        debug!("process {} observed {}", self.cfg.name, if up { "up" } else { "down" });
        up
    }

    async fn start(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        if self.status() {
            info!("start - process {} is already up", self.cfg.name);
            return Ok(());
        }
        run_command(&self.cfg.name, "start", &self.cfg.start_command).await?;
        if self.wait_up().await {
            info!("started process {}", self.cfg.name);
            Ok(())
        } else {
            error!("process {} did not come up within the up-check window", self.cfg.name);
            Err(HibernatorError::ProcessLifecycle {
                name: self.cfg.name.clone(),
                operation: "start".to_string(),
            })
        }
    }

    async fn stop(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        if !self.status() {
            debug!("stop - process {} is already down", self.cfg.name);
            return Ok(());
        }
        run_command(&self.cfg.name, "stop", &self.cfg.stop_command).await?;
        if self.wait_down().await {
            info!("stopped process {}", self.cfg.name);
            Ok(())
        } else {
            error!("process {} did not go down within the up-check window", self.cfg.name);
            Err(HibernatorError::ProcessLifecycle {
                name: self.cfg.name.clone(),
                operation: "stop".to_string(),
            })
        }
    }
}
