//! Maps replies and transport outcomes to caller-visible event kinds.

use crate::codec::ReportCodec;
use crate::error::{DefenderError, Result};
use crate::event::{EventKind, RejectReason};
use crate::transport::TransportError;
use serde_json::Value;

/// `status` value of an accepted report.
pub const STATUS_ACCEPTED: &str = "ACCEPTED";
/// `statusDetails.ErrorCode` value of a throttled report.
pub const ERROR_CODE_THROTTLED: &str = "Throttled";

/// Result of classifying a single reply document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Accepted,
    Rejected(RejectReason),
}

impl From<Classification> for EventKind {
    fn from(classification: Classification) -> Self {
        match classification {
            Classification::Accepted => EventKind::MetricsAccepted,
            Classification::Rejected(reason) => EventKind::MetricsRejected(reason),
        }
    }
}

/// Interprets a reply document.
///
/// Replies that cannot be decoded, or whose top level is not a map, are
/// rejections with [`RejectReason::Malformed`].
///
/// # Examples
///
/// ```
/// use defender_agent::classifier::{classify_reply, Classification};
/// use defender_agent::codec::JsonCodec;
/// use defender_agent::event::RejectReason;
///
/// let codec = JsonCodec::new();
/// let reply = br#"{"status":"REJECTED","statusDetails":{"ErrorCode":"Throttled"}}"#;
/// assert_eq!(
///     classify_reply(&codec, reply),
///     Classification::Rejected(RejectReason::Throttled)
/// );
/// ```
pub fn classify_reply(codec: &dyn ReportCodec, reply: &[u8]) -> Classification {
    match parse_reply(codec, reply) {
        Ok(classification) => classification,
        Err(e) => {
            tracing::warn!(error = %e, bytes = reply.len(), "Unclassifiable reply");
            Classification::Rejected(RejectReason::Malformed)
        }
    }
}

/// Strict variant of [`classify_reply`] that surfaces decoding problems.
///
/// # Errors
///
/// Returns [`DefenderError::MalformedResponse`] if the reply is not a map.
pub fn parse_reply(codec: &dyn ReportCodec, reply: &[u8]) -> Result<Classification> {
    let document = codec.decode(reply)?;
    let Value::Object(root) = document else {
        return Err(DefenderError::MalformedResponse(
            "top-level reply is not a map".to_string(),
        ));
    };

    if root.get("status").and_then(Value::as_str) == Some(STATUS_ACCEPTED) {
        return Ok(Classification::Accepted);
    }

    let error_code = root
        .get("statusDetails")
        .and_then(|details| details.get("ErrorCode"))
        .and_then(Value::as_str);

    let reason = match error_code {
        Some(ERROR_CODE_THROTTLED) => RejectReason::Throttled,
        other => RejectReason::Unknown {
            error_code: other.map(str::to_string),
        },
    };
    Ok(Classification::Rejected(reason))
}

/// Maps a transport failure to the event reported for the cycle.
///
/// Connection and timeout failures are connection-level; they are never
/// reported as a rejection.
pub fn classify_transport_error(error: &TransportError) -> EventKind {
    match error {
        TransportError::Connection(_) | TransportError::Timeout => {
            EventKind::NetworkConnectionFailed
        }
        TransportError::Publish(_) => EventKind::PublishFailed,
    }
}
