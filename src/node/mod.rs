use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::consensus::Consensus;
use crate::error::{HibernatorError, Result};
use crate::process::Process;
use crate::types::{ClientStatus, NodeStatusInfo};

pub mod monitor;
pub mod peers;

pub use monitor::Monitor;
pub use peers::{PeerClient, PeerRegistry};

use peers::PEER_DEADLINE;

/// How long a wake caller may wait for a competing transition to finish
/// before giving up.
const PREPARE_WAIT: Duration = Duration::from_secs(120);

#[derive(Debug)]
struct ControlState {
    client_status: ClientStatus,
    inactive_secs: u64,
    sync_secs: u64,
}

/// Background action due after a timer tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    None,
    Hibernate,
    Resync,
}

/// Control plane for the managed node: owns the lifecycle state machine,
/// the inactivity and resync counters, and the single-slot busy latch that
/// serializes Up/Down transitions.
///
/// The control mutex is held only for state and counter access, never
/// across I/O; long-running process starts and stops execute while holding
/// the latch instead.
pub struct NodeControl {
    cfg: Arc<NodeConfig>,
    bc_process: Arc<dyn Process>,
    pm_process: Option<Arc<dyn Process>>,
    consensus: Arc<dyn Consensus>,
    peers: PeerRegistry,
    state: Mutex<ControlState>,
    busy: Arc<Semaphore>,
}

impl NodeControl {
    pub fn new(
        cfg: Arc<NodeConfig>,
        bc_process: Arc<dyn Process>,
        pm_process: Option<Arc<dyn Process>>,
        consensus: Arc<dyn Consensus>,
        peers: PeerRegistry,
    ) -> Arc<Self> {
        let initial = if bc_process.status() {
            ClientStatus::Up
        } else {
            ClientStatus::Down
        };
        Arc::new(Self {
            cfg,
            bc_process,
            pm_process,
            consensus,
            peers,
            state: Mutex::new(ControlState {
                client_status: initial,
                inactive_secs: 0,
                sync_secs: 0,
            }),
            busy: Arc::new(Semaphore::new(1)),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.cfg
    }

    pub fn has_privacy_manager(&self) -> bool {
        self.pm_process.is_some()
    }

    pub fn client_status(&self) -> ClientStatus {
        self.state.lock().unwrap().client_status
    }

    /// Clears the inactivity counter. Called on every activity signal.
    pub fn reset_inactive_time(&self) {
        let mut st = self.state.lock().unwrap();
        st.inactive_secs = 0;
    }

    /// Clears both the inactivity and the resync counters.
    pub fn reset_inactive_sync_time(&self) {
        let mut st = self.state.lock().unwrap();
        st.inactive_secs = 0;
        st.sync_secs = 0;
    }

    /// Rejects callers while a transition is in flight.
    pub fn is_node_busy(&self) -> Result<()> {
        match self.client_status() {
            ClientStatus::ShuttingDown => Err(HibernatorError::Busy(
                "node is being shutdown, try after sometime".to_string(),
            )),
            ClientStatus::StartingUp => Err(HibernatorError::Busy(
                "node is being started, try after sometime".to_string(),
            )),
            _ if self.busy.available_permits() == 0 => Err(HibernatorError::Busy(
                "node is busy, try after sometime".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Snapshot of state and counters for the peer RPC.
    pub fn get_node_status(&self) -> NodeStatusInfo {
        let st = self.state.lock().unwrap();
        let limit = self.cfg.basic.inactivity_time;
        NodeStatusInfo {
            status: st.client_status,
            inactive_time_limit: limit,
            inactive_time: st.inactive_secs,
            time_to_shutdown: limit as i64 - st.inactive_secs as i64,
        }
    }

    /// True when the state machine says Up and both managed processes last
    /// observed up.
    pub fn is_client_up(&self) -> bool {
        self.client_status() == ClientStatus::Up && self.processes_observed_up()
    }

    fn processes_observed_up(&self) -> bool {
        self.bc_process.status()
            && self.pm_process.as_ref().map_or(true, |pm| pm.status())
    }

    fn set_status(&self, status: ClientStatus) {
        let mut st = self.state.lock().unwrap();
        debug!("client status {} -> {}", st.client_status, status);
        st.client_status = status;
    }

    /// The wake path. Returns true iff on return the blockchain client (and
    /// privacy manager, when configured) are up and ready for traffic.
    ///
    /// Contenders wait on the busy latch for a bounded time, so a wake
    /// issued during a shutdown coalesces into a restart as soon as the
    /// shutdown holder releases the latch.
    pub async fn prepare_client(&self) -> bool {
        if self.is_client_up() {
            return true;
        }

        let _permit =
            match tokio::time::timeout(PREPARE_WAIT, Arc::clone(&self.busy).acquire_owned()).await
            {
                Ok(Ok(permit)) => permit,
                _ => {
                    warn!("timed out waiting for a competing transition to finish");
                    return false;
                }
            };

        // a competing caller may have completed the start while we waited
        if self.is_client_up() {
            return true;
        }

        info!("starting managed node");
        self.set_status(ClientStatus::StartingUp);

        if let Some(pm) = &self.pm_process {
            if let Err(e) = pm.start().await {
                error!("privacy manager start failed: {e}");
                self.set_status(ClientStatus::Down);
                return false;
            }
        }
        if let Err(e) = self.bc_process.start().await {
            error!("blockchain client start failed: {e}");
            self.set_status(ClientStatus::Down);
            return false;
        }

        {
            let mut st = self.state.lock().unwrap();
            st.client_status = ClientStatus::Up;
            st.inactive_secs = 0;
            st.sync_secs = 0;
        }
        info!("managed node is up");
        true
    }

    /// Triggers a background prepare without blocking the caller. Duplicate
    /// triggers coalesce on the busy latch.
    pub fn spawn_prepare(self: &Arc<Self>) {
        let ctl = Arc::clone(self);
        tokio::spawn(async move {
            info!("background client prepare triggered");
            let ok = ctl.prepare_client().await;
            info!("background client prepare completed, ready={ok}");
        });
    }

    /// Wakes the hibernators of every private-transaction participant.
    /// Fails when a participant has no known hibernator or when any owning
    /// peer does not report ready within the deadline.
    pub async fn prepare_hibernator_for_private_tx(&self, participants: &[String]) -> Result<()> {
        let own_key = self
            .cfg
            .basic
            .privacy_manager
            .as_ref()
            .map(|pm| pm.public_key.as_str());

        let mut targets: Vec<Arc<PeerClient>> = Vec::new();
        for key in participants {
            if Some(key.as_str()) == own_key {
                continue;
            }
            let peer = self.peers.find_by_participant(key).ok_or_else(|| {
                HibernatorError::ParticipantUnavailable(format!(
                    "no hibernator manages participant key {key}"
                ))
            })?;
            if !targets.iter().any(|t| t.name() == peer.name()) {
                targets.push(peer);
            }
        }

        let from = self.cfg.basic.name.clone();
        let results = join_all(targets.iter().map(|peer| {
            let peer = Arc::clone(peer);
            let from = from.clone();
            async move {
                match tokio::time::timeout(PEER_DEADLINE, peer.prepare_for_private_tx(&from)).await
                {
                    Ok(Ok(true)) => Ok(()),
                    Ok(Ok(false)) => Err(HibernatorError::ParticipantUnavailable(format!(
                        "peer {} is not ready for the private transaction",
                        peer.name()
                    ))),
                    Ok(Err(e)) => Err(HibernatorError::ParticipantUnavailable(format!(
                        "peer {}: {e}",
                        peer.name()
                    ))),
                    Err(_) => Err(HibernatorError::ParticipantUnavailable(format!(
                        "peer {}: deadline exceeded",
                        peer.name()
                    ))),
                }
            }
        }))
        .await;

        for res in results {
            res?;
        }
        Ok(())
    }

    /// The hibernation path. Consults the consensus validator and every
    /// peer before stopping anything; at most one node in the group
    /// transitions at a time, with the lexicographically lower name winning
    /// a tie.
    pub async fn try_shutdown(&self) {
        if self.is_node_busy().is_err() || self.client_status() != ClientStatus::Up {
            return;
        }

        match self.consensus.validate_shutdown().await {
            Ok(is_member) => {
                if is_member && self.cfg.is_strict_mode() {
                    info!("strict mode keeps consensus members alive, skipping hibernation");
                    self.reset_inactive_time();
                    return;
                }
            }
            Err(e) => {
                warn!("consensus refused shutdown: {e}");
                self.reset_inactive_to_half();
                return;
            }
        }

        let own_name = self.cfg.basic.name.as_str();
        for (peer_name, res) in self.peers.poll_statuses(own_name).await {
            match res {
                Err(e) => {
                    warn!("peer {peer_name} status unavailable, aborting hibernation: {e}");
                    return;
                }
                Ok(status) => {
                    if status.status.is_transitioning() {
                        info!(
                            "peer {peer_name} is {}, deferring hibernation",
                            status.status
                        );
                        return;
                    }
                    if status.is_due_for_shutdown() && peer_name.as_str() < own_name {
                        info!("peer {peer_name} is due to hibernate and wins the tie-break");
                        return;
                    }
                }
            }
        }

        let _permit = match Arc::clone(&self.busy).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return,
        };
        if self.client_status() != ClientStatus::Up {
            return;
        }

        info!("hibernating managed node");
        self.set_status(ClientStatus::ShuttingDown);

        let mut stop_err = None;
        if let Err(e) = self.bc_process.stop().await {
            stop_err = Some(e);
        } else if let Some(pm) = &self.pm_process {
            if let Err(e) = pm.stop().await {
                stop_err = Some(e);
            }
        }

        if let Some(e) = stop_err {
            // reconcile with what the up-checks actually see
            let bc_up = self.bc_process.update_status().await;
            let pm_up = match &self.pm_process {
                Some(pm) => pm.update_status().await,
                None => false,
            };
            if bc_up || pm_up {
                error!("hibernation failed, node still up: {e}");
                self.set_status(ClientStatus::Up);
                self.reset_inactive_to_half();
                return;
            }
            warn!("stop reported failure but processes are down: {e}");
        }

        {
            let mut st = self.state.lock().unwrap();
            st.client_status = ClientStatus::Down;
            st.inactive_secs = 0;
        }
        info!("managed node hibernated");
    }

    fn reset_inactive_to_half(&self) {
        let mut st = self.state.lock().unwrap();
        st.inactive_secs = self.cfg.basic.inactivity_time / 2;
    }

    /// One-second timer tick: reconciles an externally exited process,
    /// advances the counters, and reports the background action now due.
    /// Counters are frozen while a transition holds the busy latch.
    pub fn advance_timers(&self) -> TimerAction {
        if self.busy.available_permits() == 0 {
            return TimerAction::None;
        }
        let mut st = self.state.lock().unwrap();

        if st.client_status == ClientStatus::Up && !self.processes_observed_up() {
            warn!("managed process went down outside our control, marking node down");
            st.client_status = ClientStatus::Down;
            st.inactive_secs = 0;
        }

        if st.client_status == ClientStatus::Up {
            st.inactive_secs += 1;
        }
        st.sync_secs += 1;

        if st.client_status == ClientStatus::Up && st.inactive_secs >= self.cfg.basic.inactivity_time
        {
            return TimerAction::Hibernate;
        }
        if self.cfg.is_resync_enabled()
            && st.client_status == ClientStatus::Down
            && st.sync_secs >= self.cfg.basic.resync_time
        {
            st.sync_secs = 0;
            return TimerAction::Resync;
        }
        TimerAction::None
    }
}
