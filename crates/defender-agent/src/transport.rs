//! Boundary to the messaging layer that carries reports to the service.
//!
//! The agent opens one [`Session`] per reporting cycle through a
//! [`Connector`], publishes the encoded report, waits for the reply and
//! closes the session again.

use async_trait::async_trait;

/// Failure reported by a connector or session.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The endpoint could not be reached or the session could not be set up.
    #[error("Transport: connection failed: {0}")]
    Connection(String),

    /// No reply arrived within the transport's deadline.
    #[error("Transport: timed out waiting for a reply")]
    Timeout,

    /// The session was up but the report could not be delivered.
    #[error("Transport: publish failed: {0}")]
    Publish(String),
}

/// Opaque credentials forwarded to the connector.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// Bearer token presented to the service, if it requires one.
    pub auth_token: Option<String>,
}

/// Everything a connector needs to open a session for a device.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub thing_name: String,
    pub endpoint: String,
    pub credentials: Credentials,
    /// Codec format name, used to pick the publish channel.
    pub format: &'static str,
}

/// Opens sessions to the reporting service.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establishes a session.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connection`] if the endpoint is unreachable.
    async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn Session>, TransportError>;
}

/// A connected session for one reporting cycle.
///
/// The agent calls [`Session::close`] after every publish, including one that
/// timed out. When the agent is stopped mid-cycle the session is dropped
/// without `close`, so implementations holding remote state release it in
/// `Drop` as well.
#[async_trait]
pub trait Session: Send {
    /// Publishes an encoded report and returns the raw reply document.
    async fn publish(&mut self, payload: &[u8]) -> Result<Vec<u8>, TransportError>;

    /// Releases the session.
    async fn close(self: Box<Self>);
}

/// Channel names for a device's metrics exchange.
///
/// # Examples
///
/// ```
/// use defender_agent::transport::Topics;
///
/// let topics = Topics::new("sensor-01", "json");
/// assert_eq!(topics.publish, "things/sensor-01/defender/metrics/json");
/// assert_eq!(topics.accepted, "things/sensor-01/defender/metrics/json/accepted");
/// assert_eq!(topics.rejected, "things/sensor-01/defender/metrics/json/rejected");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub publish: String,
    pub accepted: String,
    pub rejected: String,
}

impl Topics {
    pub fn new(thing_name: &str, format: &str) -> Self {
        let publish = format!("things/{thing_name}/defender/metrics/{format}");
        Self {
            accepted: format!("{publish}/accepted"),
            rejected: format!("{publish}/rejected"),
            publish,
        }
    }
}
