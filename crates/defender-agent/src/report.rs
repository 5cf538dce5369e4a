use crate::codec::ReportCodec;
use crate::error::Result;
use crate::metrics::{fields, is_emitted, tcp, MetricsRegistry};
use defender_common::types::{MetricsGroup, MetricsSnapshot};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Version written into every report header.
pub const REPORT_VERSION: &str = "1.0";

/// A report built for one publish cycle, kept together with its encoding.
#[derive(Debug, Clone)]
pub struct Report {
    pub report_id: u64,
    pub document: Value,
    pub payload: Vec<u8>,
}

/// Builds report documents from the flag table and a metrics snapshot.
pub struct ReportBuilder {
    codec: Arc<dyn ReportCodec>,
}

impl ReportBuilder {
    pub fn new(codec: Arc<dyn ReportCodec>) -> Self {
        Self { codec }
    }

    /// Builds and encodes a report.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::DefenderError::Encoding`] when the codec cannot
    /// represent the document.
    pub fn build(
        &self,
        report_id: u64,
        registry: &MetricsRegistry,
        snapshot: &MetricsSnapshot,
    ) -> Result<Report> {
        let document = build_document(report_id, registry, snapshot);
        let payload = self.codec.encode(&document)?;
        tracing::debug!(report_id, bytes = payload.len(), "Report encoded");
        Ok(Report {
            report_id,
            document,
            payload,
        })
    }
}

/// Assembles the logical report document.
///
/// Groups with a zero mask do not appear under `metrics`.
pub fn build_document(report_id: u64, registry: &MetricsRegistry, snapshot: &MetricsSnapshot) -> Value {
    let mut metrics = Map::new();
    for group in registry.enabled_groups() {
        let section = match group {
            MetricsGroup::TcpConnections => tcp_connections_section(registry.metrics(group), snapshot),
        };
        metrics.insert(group.wire_name().to_string(), section);
    }

    json!({
        "header": {
            "report_id": report_id,
            "version": REPORT_VERSION,
        },
        "metrics": Value::Object(metrics),
    })
}

fn tcp_connections_section(mask: u32, snapshot: &MetricsSnapshot) -> Value {
    let table = fields(MetricsGroup::TcpConnections);
    let emitted = |index| is_emitted(table, mask, index);
    let mut section = Map::new();

    if emitted(tcp::ESTABLISHED_FIELD) {
        let mut established = Map::new();

        if emitted(tcp::TOTAL_FIELD) {
            established.insert(
                table[tcp::TOTAL_FIELD].name.to_string(),
                json!(snapshot.tcp_connections.len() as i64),
            );
        }

        if emitted(tcp::CONNECTIONS_FIELD) {
            let with_remote_addr = emitted(tcp::REMOTE_ADDR_FIELD);
            let connections = snapshot
                .tcp_connections
                .iter()
                .map(|conn| {
                    let mut entry = Map::new();
                    if with_remote_addr {
                        entry.insert(
                            table[tcp::REMOTE_ADDR_FIELD].name.to_string(),
                            Value::String(conn.remote_addr.to_string()),
                        );
                    }
                    Value::Object(entry)
                })
                .collect();
            established.insert(
                table[tcp::CONNECTIONS_FIELD].name.to_string(),
                Value::Array(connections),
            );
        }

        section.insert(
            table[tcp::ESTABLISHED_FIELD].name.to_string(),
            Value::Object(established),
        );
    }

    Value::Object(section)
}
