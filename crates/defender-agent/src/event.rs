use chrono::{DateTime, Utc};
use tokio::sync::mpsc::UnboundedSender;

/// Why the service refused a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The device is reporting more often than the service allows.
    Throttled,
    /// Any other refusal; carries the service's error code when present.
    Unknown { error_code: Option<String> },
    /// The reply could not be decoded or had an unexpected shape.
    Malformed,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Throttled => write!(f, "throttled"),
            RejectReason::Unknown {
                error_code: Some(code),
            } => write!(f, "rejected ({code})"),
            RejectReason::Unknown { error_code: None } => write!(f, "rejected"),
            RejectReason::Malformed => write!(f, "malformed response"),
        }
    }
}

/// Outcome of one reporting cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    MetricsAccepted,
    MetricsRejected(RejectReason),
    /// The connection could not be established or no reply arrived in time.
    NetworkConnectionFailed,
    /// The connection worked but the publish itself failed.
    PublishFailed,
    ReportEncodingFailed,
    CollectionFailed,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::MetricsAccepted => write!(f, "metrics_accepted"),
            EventKind::MetricsRejected(reason) => write!(f, "metrics_rejected: {reason}"),
            EventKind::NetworkConnectionFailed => write!(f, "network_connection_failed"),
            EventKind::PublishFailed => write!(f, "publish_failed"),
            EventKind::ReportEncodingFailed => write!(f, "report_encoding_failed"),
            EventKind::CollectionFailed => write!(f, "collection_failed"),
        }
    }
}

/// Event delivered to the caller's [`EventSink`] at the end of a cycle.
#[derive(Debug, Clone)]
pub struct DefenderEvent {
    pub kind: EventKind,
    /// Id of the report built for the cycle, if one was built.
    pub report_id: Option<u64>,
    /// Encoded report that was published, if any.
    pub metrics_report: Option<Vec<u8>>,
    /// Raw reply document from the service, if any.
    pub payload: Option<Vec<u8>>,
    pub timestamp: DateTime<Utc>,
}

impl DefenderEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            report_id: None,
            metrics_report: None,
            payload: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_report(mut self, report_id: u64, metrics_report: Vec<u8>) -> Self {
        self.report_id = Some(report_id);
        self.metrics_report = Some(metrics_report);
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Receiver of agent events.
///
/// `notify` runs synchronously on the agent's background task. It may call
/// [`crate::agent::Defender::stop`] on the agent delivering the event.
pub trait EventSink: Send + Sync {
    fn notify(&self, event: &DefenderEvent);
}

impl<F> EventSink for F
where
    F: Fn(&DefenderEvent) + Send + Sync,
{
    fn notify(&self, event: &DefenderEvent) {
        self(event)
    }
}

/// Forwards events into a Tokio unbounded channel.
pub struct ChannelSink {
    tx: UnboundedSender<DefenderEvent>,
}

impl ChannelSink {
    pub fn new(tx: UnboundedSender<DefenderEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn notify(&self, event: &DefenderEvent) {
        if self.tx.send(event.clone()).is_err() {
            tracing::debug!(kind = %event.kind, "Event receiver dropped, discarding event");
        }
    }
}

/// Logs every event through `tracing`.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn notify(&self, event: &DefenderEvent) {
        let report_bytes = event.metrics_report.as_ref().map_or(0, Vec::len);
        let payload_bytes = event.payload.as_ref().map_or(0, Vec::len);
        match &event.kind {
            EventKind::MetricsAccepted => tracing::info!(
                report_id = event.report_id,
                report_bytes,
                "Metrics report accepted"
            ),
            EventKind::MetricsRejected(reason) => tracing::warn!(
                report_id = event.report_id,
                reason = %reason,
                payload = %String::from_utf8_lossy(event.payload.as_deref().unwrap_or_default()),
                "Metrics report rejected"
            ),
            kind => tracing::warn!(
                report_id = event.report_id,
                kind = %kind,
                payload_bytes,
                "Reporting cycle failed"
            ),
        }
    }
}
