use crate::error::{DefenderError, Result};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// Self-describing document codec used for reports and replies.
///
/// The logical document model is a [`serde_json::Value`] tree; codecs only
/// decide how that tree becomes bytes.
pub trait ReportCodec: Send + Sync {
    /// Short format name appended to the publish channel (e.g. `"json"`).
    fn format(&self) -> &'static str;

    /// Serializes a document.
    ///
    /// # Errors
    ///
    /// Returns [`DefenderError::Encoding`] if the document cannot be
    /// represented, including when it does not fit the output limit.
    fn encode(&self, document: &Value) -> Result<Vec<u8>>;

    /// Parses a document.
    ///
    /// # Errors
    ///
    /// Returns [`DefenderError::MalformedResponse`] if the bytes are not a
    /// valid document.
    fn decode(&self, bytes: &[u8]) -> Result<Value>;
}

/// Wire format of reports and replies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Json,
    Cbor,
}

impl ReportFormat {
    /// Looks up a format by the name its codec reports from [`ReportCodec::format`].
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "json" => Some(ReportFormat::Json),
            "cbor" => Some(ReportFormat::Cbor),
            _ => None,
        }
    }

    /// Builds the codec for this format.
    pub fn codec(self, max_len: Option<usize>) -> Arc<dyn ReportCodec> {
        match self {
            ReportFormat::Json => Arc::new(JsonCodec { max_len }),
            ReportFormat::Cbor => Arc::new(CborCodec { max_len }),
        }
    }
}

fn check_len(bytes: Vec<u8>, max_len: Option<usize>) -> Result<Vec<u8>> {
    match max_len {
        Some(max_len) if bytes.len() > max_len => Err(DefenderError::Encoding(format!(
            "encoded report is {} bytes, limit is {max_len}",
            bytes.len()
        ))),
        _ => Ok(bytes),
    }
}

/// JSON codec with an optional output size limit.
///
/// # Examples
///
/// ```
/// use defender_agent::codec::{JsonCodec, ReportCodec};
/// use serde_json::json;
///
/// let codec = JsonCodec::new();
/// let bytes = codec.encode(&json!({"status": "ACCEPTED"})).unwrap();
/// assert_eq!(codec.decode(&bytes).unwrap()["status"], "ACCEPTED");
///
/// let tiny = JsonCodec::with_max_len(4);
/// assert!(tiny.encode(&json!({"status": "ACCEPTED"})).is_err());
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec {
    max_len: Option<usize>,
}

impl JsonCodec {
    pub fn new() -> Self {
        Self { max_len: None }
    }

    /// Limits encoded output to `max_len` bytes, like a fixed report buffer.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            max_len: Some(max_len),
        }
    }
}

impl ReportCodec for JsonCodec {
    fn format(&self) -> &'static str {
        "json"
    }

    fn encode(&self, document: &Value) -> Result<Vec<u8>> {
        let bytes =
            serde_json::to_vec(document).map_err(|e| DefenderError::Encoding(e.to_string()))?;
        check_len(bytes, self.max_len)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes).map_err(|e| DefenderError::MalformedResponse(e.to_string()))
    }
}

/// CBOR codec with an optional output size limit.
///
/// Documents are the same [`Value`] trees as with [`JsonCodec`]; only the
/// byte representation differs.
///
/// # Examples
///
/// ```
/// use defender_agent::codec::{CborCodec, ReportCodec};
/// use serde_json::json;
///
/// let codec = CborCodec::new();
/// let bytes = codec.encode(&json!({"status": "ACCEPTED"})).unwrap();
/// assert_eq!(codec.decode(&bytes).unwrap()["status"], "ACCEPTED");
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct CborCodec {
    max_len: Option<usize>,
}

impl CborCodec {
    pub fn new() -> Self {
        Self { max_len: None }
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            max_len: Some(max_len),
        }
    }
}

impl ReportCodec for CborCodec {
    fn format(&self) -> &'static str {
        "cbor"
    }

    fn encode(&self, document: &Value) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(document, &mut bytes)
            .map_err(|e| DefenderError::Encoding(format!("{e:?}")))?;
        check_len(bytes, self.max_len)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        ciborium::from_reader(bytes).map_err(|e| DefenderError::MalformedResponse(format!("{e:?}")))
    }
}
