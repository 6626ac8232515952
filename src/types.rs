use serde::{Deserialize, Serialize};

/// Observed lifecycle status of the managed blockchain client.
///
/// External transitions between Up and Down always pass through the
/// transient StartingUp/ShuttingDown states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientStatus {
    Up,
    Down,
    ShuttingDown,
    StartingUp,
}

impl ClientStatus {
    /// True while a Start or Stop is in flight.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, ClientStatus::StartingUp | ClientStatus::ShuttingDown)
    }
}

impl std::fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClientStatus::Up => "up",
            ClientStatus::Down => "down",
            ClientStatus::ShuttingDown => "shutting down",
            ClientStatus::StartingUp => "starting up",
        };
        f.write_str(s)
    }
}

/// Snapshot of a hibernator's state, exchanged between peers over
/// `node_nodeStatus`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeStatusInfo {
    pub status: ClientStatus,
    /// Configured inactivity limit in seconds.
    pub inactive_time_limit: u64,
    /// Seconds of inactivity observed so far.
    pub inactive_time: u64,
    /// Seconds until this node attempts hibernation; zero or negative when due.
    pub time_to_shutdown: i64,
}

impl NodeStatusInfo {
    /// True when the peer is due to attempt hibernation on its next tick.
    pub fn is_due_for_shutdown(&self) -> bool {
        self.status == ClientStatus::Up && self.time_to_shutdown <= 0
    }
}

/// Reply payload for `node_isNodeUp` and `node_prepareForPrivateTx`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusReply {
    pub status: bool,
}
