use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// A category of related measurements reported by the agent.
///
/// The set of groups is fixed; raw group identifiers coming from callers are
/// validated through [`MetricsGroup::from_id`].
///
/// # Examples
///
/// ```
/// use defender_common::types::MetricsGroup;
///
/// let group: MetricsGroup = "tcp_connections".parse().unwrap();
/// assert_eq!(group, MetricsGroup::TcpConnections);
/// assert_eq!(group.to_string(), "tcp_connections");
/// assert_eq!(MetricsGroup::from_id(0), Some(MetricsGroup::TcpConnections));
/// assert_eq!(MetricsGroup::from_id(10_000), None);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricsGroup {
    TcpConnections,
}

impl MetricsGroup {
    /// Every group, in table order.
    pub const ALL: [MetricsGroup; 1] = [MetricsGroup::TcpConnections];

    /// Number of groups in the flag table.
    pub const COUNT: usize = Self::ALL.len();

    /// Looks up a group by its numeric identifier.
    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    /// Position of this group in the flag table.
    pub fn index(self) -> usize {
        match self {
            MetricsGroup::TcpConnections => 0,
        }
    }

    /// Key under which the group appears in the report's `metrics` map.
    pub fn wire_name(self) -> &'static str {
        match self {
            MetricsGroup::TcpConnections => "tcp_connections",
        }
    }
}

impl From<MetricsGroup> for u32 {
    fn from(group: MetricsGroup) -> Self {
        group.index() as u32
    }
}

impl std::fmt::Display for MetricsGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl std::str::FromStr for MetricsGroup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp_connections" => Ok(MetricsGroup::TcpConnections),
            _ => Err(format!("unknown metrics group: {s}")),
        }
    }
}

/// One established TCP connection observed on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpConnection {
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
}

impl TcpConnection {
    pub fn new(local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            remote_addr,
        }
    }
}

/// Live metric values pulled from the collectors for one reporting cycle.
///
/// Connections keep the order the collector discovered them in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub collected_at: DateTime<Utc>,
    pub tcp_connections: Vec<TcpConnection>,
}

impl MetricsSnapshot {
    pub fn new(tcp_connections: Vec<TcpConnection>) -> Self {
        Self {
            collected_at: Utc::now(),
            tcp_connections,
        }
    }
}

/// Lifecycle state of the reporting agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    #[default]
    Stopped,
    Running,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentState::Stopped => write!(f, "stopped"),
            AgentState::Running => write!(f, "running"),
        }
    }
}
