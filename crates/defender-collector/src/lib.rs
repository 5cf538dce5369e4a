//! Connection collection for the defender agent.
//!
//! A [`ConnectionCollector`] enumerates the device's established TCP
//! connections at the start of every reporting cycle. The agent never sorts
//! the result, so the order returned here is the order that appears in the
//! published report.

pub mod fixed;
pub mod network;

use anyhow::Result;
use defender_common::types::{MetricsSnapshot, TcpConnection};

/// A source of established TCP connections on the agent host.
///
/// Implementations are shared with the agent's background task, hence the
/// `Send + Sync` bound and the `&self` receiver.
pub trait ConnectionCollector: Send + Sync {
    /// Returns the collector name (e.g., `"procfs"`), used for logging.
    fn name(&self) -> &str;

    /// Enumerates currently established connections in discovery order.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying system source cannot be read.
    fn established_connections(&self) -> Result<Vec<TcpConnection>>;

    /// Collects a full snapshot for one reporting cycle.
    fn snapshot(&self) -> Result<MetricsSnapshot> {
        Ok(MetricsSnapshot::new(self.established_connections()?))
    }
}
