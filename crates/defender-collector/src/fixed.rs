use crate::ConnectionCollector;
use anyhow::Result;
use defender_common::types::TcpConnection;
use std::sync::{Mutex, PoisonError};

/// Returns a caller-supplied list of connections.
///
/// Used for dry runs and tests; the list can be swapped between cycles with
/// [`FixedCollector::replace`].
///
/// # Examples
///
/// ```
/// use defender_collector::fixed::FixedCollector;
/// use defender_collector::ConnectionCollector;
/// use defender_common::types::TcpConnection;
///
/// let conn = TcpConnection::new(
///     "10.0.0.2:50000".parse().unwrap(),
///     "52.1.2.3:8883".parse().unwrap(),
/// );
/// let collector = FixedCollector::new(vec![conn.clone()]);
/// assert_eq!(collector.established_connections().unwrap(), vec![conn]);
/// ```
#[derive(Default)]
pub struct FixedCollector {
    connections: Mutex<Vec<TcpConnection>>,
}

impl FixedCollector {
    pub fn new(connections: Vec<TcpConnection>) -> Self {
        Self {
            connections: Mutex::new(connections),
        }
    }

    pub fn replace(&self, connections: Vec<TcpConnection>) {
        *self.connections.lock().unwrap_or_else(PoisonError::into_inner) = connections;
    }
}

impl ConnectionCollector for FixedCollector {
    fn name(&self) -> &str {
        "fixed"
    }

    fn established_connections(&self) -> Result<Vec<TcpConnection>> {
        Ok(self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}
