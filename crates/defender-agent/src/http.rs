use crate::codec::{ReportCodec, ReportFormat};
use crate::transport::{ConnectTarget, Connector, Session, TransportError, Topics};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{StatusCode, Url};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Connector that publishes reports as HTTP POST requests.
///
/// A 2xx body is returned unchanged for classification. The service also
/// describes rejections in 4xx bodies, so those are returned when they decode
/// to a reply document. A 404, 5xx or redirect means the request never reached
/// the reporting service and is a connection failure. Other 4xx replies fail
/// the publish.
pub struct HttpConnector {
    client: reqwest::Client,
}

impl HttpConnector {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn Session>, TransportError> {
        let url = publish_url(&target.endpoint, &target.thing_name, target.format)?;
        tracing::debug!(url = %url, "Opening HTTP session");
        Ok(Box::new(HttpSession {
            client: self.client.clone(),
            url,
            content_type: content_type(target.format),
            auth_token: target.credentials.auth_token.clone(),
            reply_codec: ReportFormat::from_name(target.format).map(|format| format.codec(None)),
        }))
    }
}

struct HttpSession {
    client: reqwest::Client,
    url: Url,
    content_type: &'static str,
    auth_token: Option<String>,
    reply_codec: Option<Arc<dyn ReportCodec>>,
}

impl HttpSession {
    fn is_reply_document(&self, body: &[u8]) -> bool {
        self.reply_codec
            .as_ref()
            .and_then(|codec| codec.decode(body).ok())
            .is_some_and(|document| matches!(document, Value::Object(_)))
    }
}

#[async_trait]
impl Session for HttpSession {
    async fn publish(&mut self, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut request = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, self.content_type)
            .body(payload.to_vec());
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        let body = response.bytes().await.map_err(map_reqwest_error)?;
        tracing::debug!(status = status.as_u16(), bytes = body.len(), "Reply received");

        if status.is_success() {
            if body.is_empty() {
                return Err(TransportError::Publish(format!(
                    "empty reply with HTTP status {status}"
                )));
            }
            return Ok(body.to_vec());
        }
        if status.is_client_error() && status != StatusCode::NOT_FOUND && self.is_reply_document(&body)
        {
            return Ok(body.to_vec());
        }
        if status == StatusCode::NOT_FOUND || status.is_server_error() || status.is_redirection() {
            return Err(TransportError::Connection(format!(
                "{} answered HTTP status {status}",
                self.url
            )));
        }
        Err(TransportError::Publish(format!("HTTP status {status}")))
    }

    async fn close(self: Box<Self>) {}
}

/// Builds `<endpoint>/things/<thing>/defender/metrics/<format>`.
fn publish_url(endpoint: &str, thing_name: &str, format: &str) -> Result<Url, TransportError> {
    let topics = Topics::new(thing_name, format);
    let raw = format!("{}/{}", endpoint.trim_end_matches('/'), topics.publish);
    Url::parse(&raw).map_err(|e| TransportError::Connection(format!("invalid endpoint {endpoint}: {e}")))
}

fn content_type(format: &str) -> &'static str {
    match format {
        "json" => "application/json",
        "cbor" => "application/cbor",
        _ => "application/octet-stream",
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::Connection(e.to_string())
    } else {
        TransportError::Publish(e.to_string())
    }
}
