use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::config::ProcessConfig;
use crate::error::{HibernatorError, Result};
use crate::process::{run_command, Process, Upcheck};
use crate::rpc::RpcClient;

/// Process control backed by the docker CLI. The container is expected to
/// exist; start and stop address it by the configured id.
pub struct DockerProcess {
    cfg: ProcessConfig,
    upcheck: Upcheck,
    status: AtomicBool,
    lock: Mutex<()>,
}

impl DockerProcess {
    pub fn new(cfg: ProcessConfig, client: RpcClient) -> Self {
        let upcheck = Upcheck::new(client, cfg.upcheck_config.clone());
        Self {
            cfg,
            upcheck,
            status: AtomicBool::new(false),
            lock: Mutex::new(()),
        }
    }

    fn docker_command(&self, action: &str) -> Vec<String> {
        vec![
            "docker".to_string(),
            action.to_string(),
            self.cfg.container_id.clone(),
        ]
    }
}

#[async_trait]
impl Process for DockerProcess {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    fn status(&self) -> bool {
        self.status.load(Ordering::SeqCst)
    }

    async fn update_status(&self) -> bool {
        let up = self.upcheck.probe().await;
        self.status.store(up, Ordering::SeqCst);
        debug!("container {} observed {}", self.cfg.container_id, if up { "up" } else { "down" });
        up
    }

    async fn start(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        if self.status() {
            info!("start - container {} is already up", self.cfg.container_id);
            return Ok(());
        }
        run_command(&self.cfg.name, "start", &self.docker_command("start")).await?;
        if self.wait_up().await {
            info!("started container {}", self.cfg.container_id);
            Ok(())
        } else {
            error!(
                "container {} did not come up within the up-check window",
                self.cfg.container_id
            );
            Err(HibernatorError::ProcessLifecycle {
                name: self.cfg.name.clone(),
                operation: "start".to_string(),
            })
        }
    }

    async fn stop(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        if !self.status() {
            debug!("stop - container {} is already down", self.cfg.container_id);
            return Ok(());
        }
        run_command(&self.cfg.name, "stop", &self.docker_command("stop")).await?;
        if self.wait_down().await {
            info!("stopped container {}", self.cfg.container_id);
            Ok(())
        } else {
            error!(
                "container {} did not go down within the up-check window",
                self.cfg.container_id
            );
            Err(HibernatorError::ProcessLifecycle {
                name: self.cfg.name.clone(),
                operation: "stop".to_string(),
            })
        }
    }
}
