use crate::agent::{StartInfo, DEFAULT_PERIOD_SECS, DEFAULT_PUBLISH_TIMEOUT, MINIMUM_PERIOD_SECS};
use crate::codec::{ReportCodec, ReportFormat};
use crate::error::{DefenderError, Result};
use crate::metrics::flag_by_name;
use crate::transport::Credentials;
use defender_common::types::MetricsGroup;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct AgentConfig {
    pub thing_name: String,
    pub server_endpoint: String,
    /// Use https when `server_endpoint` has no scheme
    #[serde(default)]
    pub tls: bool,
    #[serde(default = "default_period_secs")]
    pub period_secs: u32,
    #[serde(default = "default_publish_timeout_secs")]
    pub publish_timeout_secs: u64,
    /// Wire format of reports and replies, `"json"` or `"cbor"`
    #[serde(default)]
    pub format: ReportFormat,
    /// Upper bound on the encoded report size
    pub max_report_bytes: Option<usize>,
    /// Optional bearer token presented to the service
    pub auth_token: Option<String>,
    /// Snowflake node id used for report ids (0-31)
    #[serde(default = "default_node_id")]
    pub node_id: i32,
    /// Group name -> flag names, e.g. `tcp_connections = ["established_total"]`
    #[serde(default)]
    pub metrics: BTreeMap<String, Vec<String>>,
}

fn default_period_secs() -> u32 {
    DEFAULT_PERIOD_SECS
}

fn default_publish_timeout_secs() -> u64 {
    DEFAULT_PUBLISH_TIMEOUT.as_secs()
}

fn default_node_id() -> i32 {
    1
}

impl AgentConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| DefenderError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// - [`DefenderError::Config`] if the document does not parse or `node_id`
    ///   is out of range.
    /// - [`DefenderError::PeriodTooShort`] if `period_secs` is below the minimum.
    /// - [`DefenderError::InvalidInput`] for unknown metrics groups or flags.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| DefenderError::Config(e.to_string()))?;
        if config.period_secs < MINIMUM_PERIOD_SECS {
            return Err(DefenderError::PeriodTooShort {
                period: config.period_secs,
                minimum: MINIMUM_PERIOD_SECS,
            });
        }
        if !(0..=31).contains(&config.node_id) {
            return Err(DefenderError::Config(format!(
                "node_id {} is outside 0-31",
                config.node_id
            )));
        }
        config.metric_masks()?;
        Ok(config)
    }

    /// Resolves the `[metrics]` table into one mask per configured group.
    pub fn metric_masks(&self) -> Result<Vec<(MetricsGroup, u32)>> {
        self.metrics
            .iter()
            .map(|(group_name, flags)| {
                let group: MetricsGroup =
                    group_name.parse().map_err(DefenderError::InvalidInput)?;
                let mask = flags.iter().try_fold(0u32, |mask, flag| {
                    flag_by_name(group, flag).map(|bits| mask | bits).ok_or_else(|| {
                        DefenderError::InvalidInput(format!("unknown flag '{flag}' for {group}"))
                    })
                })?;
                Ok((group, mask))
            })
            .collect()
    }

    /// Build the service URL from `server_endpoint` and the tls setting.
    pub fn endpoint(&self) -> String {
        let addr = self.server_endpoint.trim();
        if addr.contains("://") {
            return addr.to_string();
        }
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://{addr}")
    }

    pub fn codec(&self) -> Arc<dyn ReportCodec> {
        self.format.codec(self.max_report_bytes)
    }

    pub fn start_info(&self) -> StartInfo {
        StartInfo::new(self.thing_name.clone(), self.endpoint()).with_credentials(Credentials {
            auth_token: self.auth_token.clone(),
        })
    }
}
