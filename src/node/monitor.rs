use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::node::{NodeControl, TimerAction};

const TICK: Duration = Duration::from_secs(1);

/// Drives the inactivity and resync timers: one tick per second, hibernate
/// when the node has idled past its limit, restart a hibernated node when
/// it is due to resync with the chain.
pub struct Monitor {
    ctl: Arc<NodeControl>,
}

impl Monitor {
    pub fn new(ctl: Arc<NodeControl>) -> Self {
        Self { ctl }
    }

    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("monitor stopped");
                        break;
                    }
                    _ = ticker.tick() => self.tick().await,
                }
            }
        })
    }

    async fn tick(&self) {
        match self.ctl.advance_timers() {
            TimerAction::None => {}
            TimerAction::Hibernate => {
                info!("inactivity limit reached, attempting hibernation");
                self.ctl.try_shutdown().await;
            }
            TimerAction::Resync => {
                info!("resync timer fired, waking node to sync with the chain");
                self.ctl.prepare_client().await;
            }
        }
    }
}
