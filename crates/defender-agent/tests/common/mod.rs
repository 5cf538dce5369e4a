#![allow(dead_code)]

use async_trait::async_trait;
use defender_agent::codec::JsonCodec;
use defender_agent::event::ChannelSink;
use defender_agent::transport::{ConnectTarget, Connector, Session, TransportError};
use defender_agent::{Defender, DefenderEvent, StartInfo};
use defender_collector::fixed::FixedCollector;
use defender_common::types::TcpConnection;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::Notify;
use tokio::time::Instant;

pub const THING: &str = "gateway-7";
pub const ENDPOINT: &str = "http://defender.test";

/// How the mock service answers one cycle.
#[derive(Clone)]
pub enum Reply {
    Accepted,
    Rejected(&'static str),
    Raw(&'static [u8]),
    ConnectFails,
    PublishFails,
    /// Never answers.
    Hang,
    /// Answers `Accepted` after the given delay.
    Delay(Duration),
    /// Answers `Accepted` once the notify is triggered.
    WaitFor(Arc<Notify>),
}

#[derive(Default)]
struct MockState {
    script: Mutex<VecDeque<Reply>>,
    connects: Mutex<Vec<Instant>>,
    published: Mutex<Vec<Vec<u8>>>,
    publish_started: Notify,
    closed: AtomicUsize,
}

/// Connector backed by a scripted in-memory service.
///
/// Each connect consumes the next scripted reply; once the script runs out
/// every report is accepted.
#[derive(Default)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    pub fn scripted(replies: impl IntoIterator<Item = Reply>) -> Self {
        let connector = Self::default();
        connector.state.script.lock().unwrap().extend(replies);
        connector
    }

    pub fn push(&self, reply: Reply) {
        self.state.script.lock().unwrap().push_back(reply);
    }

    /// Instants at which sessions were opened.
    pub fn connect_times(&self) -> Vec<Instant> {
        self.state.connects.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<Vec<u8>> {
        self.state.published.lock().unwrap().clone()
    }

    /// Number of sessions closed through `Session::close`.
    pub fn closed_sessions(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Resolves once a publish has started.
    pub async fn publish_started(&self) {
        self.state.publish_started.notified().await;
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn Session>, TransportError> {
        assert_eq!(target.thing_name, THING);
        assert_eq!(target.format, "json");
        self.state.connects.lock().unwrap().push(Instant::now());

        let reply = self
            .state
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Reply::Accepted);
        if let Reply::ConnectFails = reply {
            return Err(TransportError::Connection("connection refused".into()));
        }
        Ok(Box::new(MockSession {
            state: self.state.clone(),
            reply,
        }))
    }
}

struct MockSession {
    state: Arc<MockState>,
    reply: Reply,
}

#[async_trait]
impl Session for MockSession {
    async fn publish(&mut self, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.state.published.lock().unwrap().push(payload.to_vec());
        self.state.publish_started.notify_one();

        match &self.reply {
            Reply::Accepted | Reply::ConnectFails => Ok(status_reply("ACCEPTED", None)),
            Reply::Rejected(code) => Ok(status_reply("REJECTED", Some(*code))),
            Reply::Raw(bytes) => Ok(bytes.to_vec()),
            Reply::PublishFails => Err(TransportError::Publish("session closed".into())),
            Reply::Hang => std::future::pending().await,
            Reply::Delay(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(status_reply("ACCEPTED", None))
            }
            Reply::WaitFor(gate) => {
                gate.notified().await;
                Ok(status_reply("ACCEPTED", None))
            }
        }
    }

    async fn close(self: Box<Self>) {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn status_reply(status: &str, error_code: Option<&str>) -> Vec<u8> {
    let mut reply = json!({
        "thingName": THING,
        "reportId": 1,
        "status": status,
        "timestamp": 1_700_000_000_000u64,
    });
    if let Some(code) = error_code {
        reply["statusDetails"] = json!({ "ErrorCode": code, "ErrorMessage": "refused" });
    }
    serde_json::to_vec(&reply).unwrap()
}

pub fn conn(remote: &str) -> TcpConnection {
    TcpConnection::new("192.168.1.20:41000".parse().unwrap(), remote.parse().unwrap())
}

/// A defender wired to mocks, plus the receiving end of its events.
pub struct Harness {
    pub defender: Defender,
    pub connector: Arc<MockConnector>,
    pub collector: Arc<FixedCollector>,
    pub events: UnboundedReceiver<DefenderEvent>,
    sink: Arc<ChannelSink>,
}

impl Harness {
    pub fn new(replies: impl IntoIterator<Item = Reply>) -> Self {
        Self::build(replies.into_iter().collect(), JsonCodec::new())
    }

    /// Every report is accepted.
    pub fn accepting() -> Self {
        Self::build(Vec::new(), JsonCodec::new())
    }

    pub fn with_codec(codec: JsonCodec) -> Self {
        Self::build(Vec::new(), codec)
    }

    fn build(replies: Vec<Reply>, codec: JsonCodec) -> Self {
        let connector = Arc::new(MockConnector::scripted(replies));
        let collector = Arc::new(FixedCollector::new(vec![
            conn("52.1.2.3:8883"),
            conn("10.9.8.7:443"),
        ]));
        let defender = Defender::new(connector.clone(), collector.clone(), Arc::new(codec));
        let (tx, events) = mpsc::unbounded_channel();
        Self {
            defender,
            connector,
            collector,
            events,
            sink: Arc::new(ChannelSink::new(tx)),
        }
    }

    pub fn start_info(&self) -> StartInfo {
        StartInfo::new(THING, ENDPOINT).with_sink(self.sink.clone())
    }

    pub fn start(&self) -> defender_agent::Result<()> {
        self.defender.start(self.start_info())
    }

    /// Waits for the next event, failing the test if none arrives within
    /// an hour of (paused) time.
    pub async fn next_event(&mut self) -> DefenderEvent {
        tokio::time::timeout(Duration::from_secs(3600), self.events.recv())
            .await
            .expect("no event within an hour")
            .expect("event channel closed")
    }
}

/// Decodes a published JSON report.
pub fn decode(report: &[u8]) -> Value {
    serde_json::from_slice(report).unwrap()
}
