mod common;

use common::{conn, decode, Harness, MockConnector, Reply, ENDPOINT, THING};
use defender_agent::codec::JsonCodec;
use defender_agent::metrics::tcp;
use defender_agent::{Defender, DefenderError, DefenderEvent, EventKind, RejectReason, StartInfo};
use defender_collector::fixed::FixedCollector;
use defender_common::types::{AgentState, MetricsGroup};
use serde_json::json;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::Notify;

const PERIOD: Duration = Duration::from_secs(300);

#[tokio::test(start_paused = true)]
async fn first_report_is_published_after_start_returns() {
    let mut h = Harness::accepting();
    h.defender
        .set_metrics(MetricsGroup::TcpConnections, tcp::ALL)
        .unwrap();

    h.start().unwrap();
    assert_eq!(h.defender.state(), AgentState::Running);
    assert!(h.connector.connect_times().is_empty());

    let event = h.next_event().await;
    assert_eq!(event.kind, EventKind::MetricsAccepted);
    assert!(event.payload.is_some());

    let report = decode(event.metrics_report.as_deref().unwrap());
    assert_eq!(report["header"]["report_id"], event.report_id.unwrap());
    assert_eq!(
        report["metrics"]["tcp_connections"]["established_connections"],
        json!({
            "total": 2,
            "connections": [
                { "remote_addr": "52.1.2.3:8883" },
                { "remote_addr": "10.9.8.7:443" },
            ],
        })
    );
    assert_eq!(h.connector.published(), vec![event.metrics_report.unwrap()]);
}

#[tokio::test(start_paused = true)]
async fn report_with_no_flags_has_empty_metrics() {
    let mut h = Harness::accepting();
    h.start().unwrap();

    let event = h.next_event().await;
    assert_eq!(event.kind, EventKind::MetricsAccepted);
    let report = decode(event.metrics_report.as_deref().unwrap());
    assert_eq!(report["metrics"], json!({}));
}

#[tokio::test(start_paused = true)]
async fn second_start_is_rejected_and_run_continues() {
    let mut h = Harness::accepting();
    h.start().unwrap();

    let err = h.start().unwrap_err();
    assert!(matches!(err, DefenderError::AlreadyStarted));
    assert_eq!(h.defender.state(), AgentState::Running);

    assert_eq!(h.next_event().await.kind, EventKind::MetricsAccepted);
    assert_eq!(h.next_event().await.kind, EventKind::MetricsAccepted);
    assert_eq!(h.connector.connect_times().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn invalid_thing_name_fails_start() {
    let h = Harness::accepting();
    let too_long = "x".repeat(129);
    for name in ["", "   ", "has space", "slash/name", too_long.as_str()] {
        let err = h.defender.start(StartInfo::new(name, ENDPOINT)).unwrap_err();
        assert!(matches!(err, DefenderError::InvalidConfig(_)), "{name:?}");
        assert_eq!(h.defender.state(), AgentState::Stopped);
    }

    let err = h
        .defender
        .start(StartInfo::new(common::THING, ""))
        .unwrap_err();
    assert!(matches!(err, DefenderError::InvalidConfig(_)));
}

#[tokio::test(start_paused = true)]
async fn unusable_endpoint_surfaces_as_connection_failure() {
    let mut h = Harness::new([Reply::ConnectFails]);
    h.start().unwrap();

    let event = h.next_event().await;
    assert_eq!(event.kind, EventKind::NetworkConnectionFailed);
    assert!(event.payload.is_none());
    assert!(event.metrics_report.is_some());
}

#[test]
fn start_outside_runtime_fails() {
    let h = Harness::accepting();
    let err = h.start().unwrap_err();
    assert!(matches!(err, DefenderError::NoRuntime));
    assert_eq!(h.defender.state(), AgentState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn short_period_is_rejected_and_unchanged() {
    let h = Harness::accepting();
    assert_eq!(h.defender.period(), 300);

    let err = h.defender.set_period(299).unwrap_err();
    assert!(matches!(
        err,
        DefenderError::PeriodTooShort {
            period: 299,
            minimum: 300
        }
    ));
    assert_eq!(h.defender.period(), 300);

    h.defender.set_period(301).unwrap();
    assert_eq!(h.defender.period(), 301);

    h.start().unwrap();
    h.defender.set_period(600).unwrap();
    assert_eq!(h.defender.period(), 600);
    assert!(h.defender.set_period(0).is_err());
    assert_eq!(h.defender.period(), 600);
}

#[tokio::test(start_paused = true)]
async fn unknown_group_leaves_flags_untouched_while_running() {
    let h = Harness::accepting();
    h.defender
        .set_metrics(MetricsGroup::TcpConnections, tcp::ESTABLISHED_TOTAL)
        .unwrap();
    h.start().unwrap();

    let before = h.defender.registry();
    let err = h.defender.set_metrics(99u32, tcp::ALL).unwrap_err();
    assert!(matches!(err, DefenderError::InvalidInput(_)));
    assert_eq!(h.defender.registry(), before);
    assert_eq!(
        h.defender.metrics(MetricsGroup::TcpConnections),
        tcp::ESTABLISHED_TOTAL
    );
}

#[tokio::test(start_paused = true)]
async fn throttled_rejection_is_reported() {
    let mut h = Harness::new([Reply::Rejected("Throttled"), Reply::Rejected("InvalidPayload")]);
    h.start().unwrap();

    let event = h.next_event().await;
    assert_eq!(
        event.kind,
        EventKind::MetricsRejected(RejectReason::Throttled)
    );
    let reply = decode(event.payload.as_deref().unwrap());
    assert_eq!(reply["statusDetails"]["ErrorCode"], "Throttled");

    let event = h.next_event().await;
    assert_eq!(
        event.kind,
        EventKind::MetricsRejected(RejectReason::Unknown {
            error_code: Some("InvalidPayload".into())
        })
    );
}

#[tokio::test(start_paused = true)]
async fn malformed_reply_is_a_rejection() {
    let mut h = Harness::new([Reply::Raw(b"\x00\x01garbage")]);
    h.start().unwrap();

    let event = h.next_event().await;
    assert_eq!(
        event.kind,
        EventKind::MetricsRejected(RejectReason::Malformed)
    );
    assert_eq!(event.payload.as_deref(), Some(&b"\x00\x01garbage"[..]));
}

#[tokio::test(start_paused = true)]
async fn publish_failure_is_distinct_from_connection_failure() {
    let mut h = Harness::new([Reply::PublishFails]);
    h.start().unwrap();

    assert_eq!(h.next_event().await.kind, EventKind::PublishFailed);
}

#[tokio::test(start_paused = true)]
async fn connection_failure_rearms_next_cycle() {
    let mut h = Harness::new([Reply::ConnectFails]);
    h.start().unwrap();

    assert_eq!(h.next_event().await.kind, EventKind::NetworkConnectionFailed);
    assert_eq!(h.next_event().await.kind, EventKind::MetricsAccepted);

    let times = h.connector.connect_times();
    assert_eq!(times[1] - times[0], PERIOD);
}

#[tokio::test(start_paused = true)]
async fn missing_reply_times_out_as_connection_failure() {
    let mut h = Harness::new([Reply::Hang]);
    h.start().unwrap();
    let started = tokio::time::Instant::now();

    let event = h.next_event().await;
    assert_eq!(event.kind, EventKind::NetworkConnectionFailed);
    assert_eq!(started.elapsed(), Duration::from_secs(30));
    assert_eq!(h.connector.closed_sessions(), 1);

    assert_eq!(h.next_event().await.kind, EventKind::MetricsAccepted);
    assert_eq!(started.elapsed(), PERIOD);
}

#[tokio::test(start_paused = true)]
async fn encoding_failure_is_reported_every_cycle() {
    let mut h = Harness::with_codec(JsonCodec::with_max_len(8));
    h.start().unwrap();

    for _ in 0..2 {
        let event = h.next_event().await;
        assert_eq!(event.kind, EventKind::ReportEncodingFailed);
        assert!(event.report_id.is_some());
        assert!(event.metrics_report.is_none());
    }
    assert!(h.connector.connect_times().is_empty());
    assert_eq!(h.defender.state(), AgentState::Running);
}

#[tokio::test(start_paused = true)]
async fn no_event_after_stop_even_when_reply_arrives_late() {
    let gate = Arc::new(Notify::new());
    let mut h = Harness::new([Reply::WaitFor(gate.clone())]);
    h.start().unwrap();

    h.connector.publish_started().await;
    h.defender.stop();
    assert_eq!(h.defender.state(), AgentState::Stopped);

    gate.notify_one();
    tokio::time::sleep(PERIOD * 4).await;

    assert!(matches!(h.events.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(h.connector.connect_times().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent() {
    let h = Harness::accepting();
    h.defender.stop();
    h.start().unwrap();
    h.defender.stop();
    h.defender.stop();
    assert_eq!(h.defender.state(), AgentState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn restart_reports_only_new_flags() {
    let mut h = Harness::accepting();
    h.defender
        .set_metrics(MetricsGroup::TcpConnections, tcp::ESTABLISHED_TOTAL)
        .unwrap();
    h.start().unwrap();

    let report = decode(h.next_event().await.metrics_report.as_deref().unwrap());
    let established = &report["metrics"]["tcp_connections"]["established_connections"];
    assert_eq!(established["total"], 2);
    assert!(established.get("connections").is_none());

    h.defender.stop();
    h.defender
        .set_metrics(MetricsGroup::TcpConnections, tcp::ESTABLISHED_REMOTE_ADDR)
        .unwrap();
    h.start().unwrap();

    let report = decode(h.next_event().await.metrics_report.as_deref().unwrap());
    let established = &report["metrics"]["tcp_connections"]["established_connections"];
    assert!(established.get("total").is_none());
    assert_eq!(established["connections"].as_array().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn flag_change_while_running_applies_next_cycle() {
    let mut h = Harness::accepting();
    h.defender
        .set_metrics(MetricsGroup::TcpConnections, tcp::ESTABLISHED_TOTAL)
        .unwrap();
    h.start().unwrap();
    h.next_event().await;

    h.defender
        .set_metrics(MetricsGroup::TcpConnections, 0)
        .unwrap();
    h.collector.replace(vec![conn("198.51.100.4:8443")]);

    let report = decode(h.next_event().await.metrics_report.as_deref().unwrap());
    assert_eq!(report["metrics"], json!({}));
}

#[tokio::test(start_paused = true)]
async fn cycles_are_scheduled_from_previous_wake() {
    let mut h = Harness::accepting();
    h.start().unwrap();
    for _ in 0..4 {
        h.next_event().await;
    }

    let times = h.connector.connect_times();
    for pair in times.windows(2) {
        assert_eq!(pair[1] - pair[0], PERIOD);
    }
}

#[tokio::test(start_paused = true)]
async fn period_change_keeps_the_armed_wake() {
    let mut h = Harness::accepting();
    h.start().unwrap();
    h.next_event().await;

    h.defender.set_period(600).unwrap();
    h.next_event().await;
    h.next_event().await;

    let times = h.connector.connect_times();
    assert_eq!(times[1] - times[0], PERIOD);
    assert_eq!(times[2] - times[1], Duration::from_secs(600));
}

#[tokio::test(start_paused = true)]
async fn overrunning_cycle_skips_missed_wakes() {
    let mut h = Harness::new([Reply::Delay(Duration::from_secs(700))]);
    h.defender = h.defender.with_publish_timeout(Duration::from_secs(1000));
    h.start().unwrap();

    assert_eq!(h.next_event().await.kind, EventKind::MetricsAccepted);
    assert_eq!(h.next_event().await.kind, EventKind::MetricsAccepted);

    let times = h.connector.connect_times();
    assert_eq!(times[1] - times[0], PERIOD * 3);
}

#[tokio::test(start_paused = true)]
async fn late_reply_from_previous_run_does_not_leak_into_restart() {
    let gate = Arc::new(Notify::new());
    let mut h = Harness::new([Reply::WaitFor(gate.clone())]);
    h.defender
        .set_metrics(MetricsGroup::TcpConnections, tcp::ESTABLISHED_TOTAL)
        .unwrap();
    h.start().unwrap();
    h.connector.publish_started().await;

    h.defender.stop();
    h.defender
        .set_metrics(MetricsGroup::TcpConnections, tcp::ESTABLISHED_REMOTE_ADDR)
        .unwrap();
    h.start().unwrap();
    gate.notify_one();

    let event = h.next_event().await;
    assert_eq!(event.kind, EventKind::MetricsAccepted);
    let report = decode(event.metrics_report.as_deref().unwrap());
    let established = &report["metrics"]["tcp_connections"]["established_connections"];
    assert!(established.get("total").is_none());
    assert_eq!(established["connections"].as_array().unwrap().len(), 2);

    assert!(matches!(h.events.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(h.connector.published().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn sink_may_stop_the_agent_it_is_notified_by() {
    let connector = Arc::new(MockConnector::default());
    let collector = Arc::new(FixedCollector::new(vec![conn("52.1.2.3:8883")]));
    let defender = Arc::new(Defender::new(
        connector.clone(),
        collector,
        Arc::new(JsonCodec::new()),
    ));

    let slot: Arc<OnceLock<Weak<Defender>>> = Arc::new(OnceLock::new());
    let (tx, mut events) = mpsc::unbounded_channel();
    let sink = {
        let slot = slot.clone();
        move |event: &DefenderEvent| {
            tx.send(event.kind.clone()).unwrap();
            if let Some(defender) = slot.get().and_then(Weak::upgrade) {
                defender.stop();
            }
        }
    };
    slot.set(Arc::downgrade(&defender)).unwrap();

    defender
        .start(StartInfo::new(THING, ENDPOINT).with_sink(Arc::new(sink)))
        .unwrap();

    let kind = tokio::time::timeout(Duration::from_secs(60), events.recv())
        .await
        .unwrap();
    assert_eq!(kind, Some(EventKind::MetricsAccepted));
    assert_eq!(defender.state(), AgentState::Stopped);

    tokio::time::sleep(PERIOD * 3).await;
    assert!(events.try_recv().is_err());
    assert_eq!(connector.connect_times().len(), 1);
}
