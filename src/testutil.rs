//! Shared test fixtures: canned configs, scriptable fake processes, and a
//! static consensus validator.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{
    BasicConfig, BlockchainClient, ClientKind, ConsensusKind, NodeConfig, PeerConfig,
    PrivacyManager, ProcessConfig, ProcessControlKind, RpcServerConfig, UpcheckConfig,
};
use crate::consensus::Consensus;
use crate::error::{HibernatorError, Result};
use crate::node::{NodeControl, PeerRegistry};
use crate::process::Process;

pub fn process_config(name: &str) -> ProcessConfig {
    ProcessConfig {
        name: name.to_string(),
        control_type: ProcessControlKind::Shell,
        container_id: String::new(),
        start_command: vec!["true".into()],
        stop_command: vec!["true".into()],
        upcheck_config: UpcheckConfig {
            url: "http://localhost:22000".to_string(),
            method: Default::default(),
            body: String::new(),
            return_type: Default::default(),
            expected: None,
        },
    }
}

/// A strict-mode raft config with a 60 s inactivity limit and a 120 s
/// resync timer; tests mutate fields as needed.
pub fn node_config(name: &str) -> NodeConfig {
    NodeConfig {
        basic: BasicConfig {
            name: name.to_string(),
            disable_strict_mode: false,
            upcheck_polling_interval: 1,
            peers_config_file: "peers.toml".into(),
            inactivity_time: 60,
            resync_time: 120,
            blockchain_client: BlockchainClient {
                client_type: ClientKind::GoQuorum,
                consensus: ConsensusKind::Raft,
                rpc_url: "http://localhost:22000".to_string(),
                tls_config: None,
                process: process_config("geth"),
                sealer_activity_threshold: 5,
            },
            privacy_manager: None,
            server: RpcServerConfig {
                rpc_addr: "127.0.0.1:0".to_string(),
                rpc_cors_list: vec![],
                rpc_vhosts: vec![],
                tls_config: None,
            },
            proxies: vec![],
        },
        peers: vec![],
    }
}

pub fn with_privacy_manager(mut cfg: NodeConfig, key: &str) -> NodeConfig {
    cfg.basic.privacy_manager = Some(PrivacyManager {
        public_key: key.to_string(),
        tls_config: None,
        process: process_config("tessera"),
    });
    cfg
}

/// Global sequence so tests can assert start/stop ordering across
/// processes.
static SEQUENCE: AtomicUsize = AtomicUsize::new(0);

pub struct FakeProcess {
    name: String,
    pub up: AtomicBool,
    fail_start: bool,
    fail_stop: bool,
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub last_start_seq: AtomicUsize,
    pub last_stop_seq: AtomicUsize,
    start_delay: Duration,
}

impl FakeProcess {
    pub fn new(name: &str, up: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            up: AtomicBool::new(up),
            fail_start: false,
            fail_stop: false,
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            last_start_seq: AtomicUsize::new(0),
            last_stop_seq: AtomicUsize::new(0),
            start_delay: Duration::ZERO,
        })
    }

    pub fn failing_start(name: &str) -> Arc<Self> {
        let mut p = Self::new(name, false);
        Arc::get_mut(&mut p).unwrap().fail_start = true;
        p
    }

    pub fn failing_stop(name: &str) -> Arc<Self> {
        let mut p = Self::new(name, true);
        Arc::get_mut(&mut p).unwrap().fail_stop = true;
        p
    }

    pub fn slow_start(name: &str, delay: Duration) -> Arc<Self> {
        let mut p = Self::new(name, false);
        Arc::get_mut(&mut p).unwrap().start_delay = delay;
        p
    }
}

#[async_trait]
impl Process for FakeProcess {
    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    async fn update_status(&self) -> bool {
        self.status()
    }

    async fn start(&self) -> Result<()> {
        if self.start_delay > Duration::ZERO {
            tokio::time::sleep(self.start_delay).await;
        }
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.last_start_seq
            .store(SEQUENCE.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
        if self.fail_start {
            return Err(HibernatorError::ProcessLifecycle {
                name: self.name.clone(),
                operation: "start".to_string(),
            });
        }
        self.up.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.last_stop_seq
            .store(SEQUENCE.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
        if self.fail_stop {
            return Err(HibernatorError::ProcessLifecycle {
                name: self.name.clone(),
                operation: "stop".to_string(),
            });
        }
        self.up.store(false, Ordering::SeqCst);
        Ok(())
    }
}

pub struct StaticConsensus {
    is_member: bool,
    refuse: Option<String>,
}

impl StaticConsensus {
    pub fn allowing(is_member: bool) -> Arc<Self> {
        Arc::new(Self {
            is_member,
            refuse: None,
        })
    }

    pub fn refusing(msg: &str) -> Arc<Self> {
        Arc::new(Self {
            is_member: true,
            refuse: Some(msg.to_string()),
        })
    }
}

#[async_trait]
impl Consensus for StaticConsensus {
    async fn validate_shutdown(&self) -> Result<bool> {
        match &self.refuse {
            Some(msg) => Err(HibernatorError::ConsensusViolation(msg.clone())),
            None => Ok(self.is_member),
        }
    }
}

pub fn control(
    cfg: NodeConfig,
    bc: Arc<FakeProcess>,
    pm: Option<Arc<FakeProcess>>,
    consensus: Arc<StaticConsensus>,
    peer_cfgs: &[PeerConfig],
) -> Arc<NodeControl> {
    NodeControl::new(
        Arc::new(cfg),
        bc,
        pm.map(|p| p as Arc<dyn Process>),
        consensus,
        PeerRegistry::new(peer_cfgs).unwrap(),
    )
}
