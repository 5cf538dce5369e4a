//! Reporting state machine.
//!
//! [`Defender`] owns the flag table, the reporting period and the lifecycle
//! state behind one lock. `start` spawns a background task that wakes every
//! period, builds a report, publishes it through a fresh transport session
//! and hands the classified outcome to the caller's [`EventSink`].

use crate::classifier::{classify_reply, classify_transport_error};
use crate::codec::ReportCodec;
use crate::error::{DefenderError, Result};
use crate::event::{DefenderEvent, EventKind, EventSink};
use crate::metrics::MetricsRegistry;
use crate::report::ReportBuilder;
use crate::transport::{ConnectTarget, Connector, Credentials, TransportError};
use defender_collector::ConnectionCollector;
use defender_common::types::{AgentState, MetricsGroup};
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Shortest accepted reporting period; the service throttles faster devices.
pub const MINIMUM_PERIOD_SECS: u32 = 300;
pub const DEFAULT_PERIOD_SECS: u32 = MINIMUM_PERIOD_SECS;
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest thing name the service accepts.
const MAX_THING_NAME_LEN: usize = 128;

/// Parameters for [`Defender::start`].
#[derive(Clone)]
pub struct StartInfo {
    pub thing_name: String,
    pub endpoint: String,
    pub credentials: Credentials,
    /// Receiver of cycle outcomes; `None` runs the agent without callbacks.
    pub sink: Option<Arc<dyn EventSink>>,
}

impl StartInfo {
    pub fn new(thing_name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            thing_name: thing_name.into(),
            endpoint: endpoint.into(),
            credentials: Credentials::default(),
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Validates the parameters and turns them into a connect target.
    ///
    /// The endpoint is only checked for presence; an unreachable or
    /// unparsable endpoint shows up as a connection failure on the first
    /// cycle.
    fn connect_target(&self, format: &'static str) -> Result<ConnectTarget> {
        let thing_name = self.thing_name.trim();
        if thing_name.is_empty() {
            return Err(DefenderError::InvalidConfig(
                "thing name must not be empty".to_string(),
            ));
        }
        if thing_name.len() > MAX_THING_NAME_LEN {
            return Err(DefenderError::InvalidConfig(format!(
                "thing name is longer than {MAX_THING_NAME_LEN} characters"
            )));
        }
        if let Some(c) = thing_name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-')))
        {
            return Err(DefenderError::InvalidConfig(format!(
                "thing name contains invalid character {c:?}"
            )));
        }
        if self.endpoint.trim().is_empty() {
            return Err(DefenderError::InvalidConfig(
                "endpoint must not be empty".to_string(),
            ));
        }

        Ok(ConnectTarget {
            thing_name: thing_name.to_string(),
            endpoint: self.endpoint.trim().to_string(),
            credentials: self.credentials.clone(),
            format,
        })
    }
}

thread_local! {
    /// Address of the `Shared` whose sink is being notified on this thread, 0 otherwise.
    static DELIVERING: Cell<usize> = const { Cell::new(0) };
}

/// Clears [`DELIVERING`] when the sink returns or panics.
struct DeliveringGuard;

impl DeliveringGuard {
    fn enter(shared: &Arc<Shared>) -> Self {
        DELIVERING.with(|d| d.set(shared.id()));
        DeliveringGuard
    }
}

impl Drop for DeliveringGuard {
    fn drop(&mut self) {
        DELIVERING.with(|d| d.set(0));
    }
}

struct RunHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    registry: MetricsRegistry,
    period_secs: u32,
    state: AgentState,
    generation: u64,
    run: Option<RunHandle>,
}

struct Shared {
    inner: Mutex<Inner>,
    /// Generation allowed to deliver events; 0 while stopped.
    active_generation: AtomicU64,
    /// Held for the duration of every event delivery.
    delivery: Mutex<()>,
}

impl Shared {
    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_delivery(&self) -> MutexGuard<'_, ()> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn period(&self) -> Duration {
        Duration::from_secs(u64::from(self.lock_inner().period_secs))
    }

    fn registry(&self) -> MetricsRegistry {
        self.lock_inner().registry
    }

    fn id(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }
}

/// The device-side reporting agent.
///
/// All methods take `&self` and may be called from any thread; none of
/// them wait on network I/O.
pub struct Defender {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    collector: Arc<dyn ConnectionCollector>,
    codec: Arc<dyn ReportCodec>,
    publish_timeout: Duration,
}

impl Defender {
    pub fn new(
        connector: Arc<dyn Connector>,
        collector: Arc<dyn ConnectionCollector>,
        codec: Arc<dyn ReportCodec>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    registry: MetricsRegistry::default(),
                    period_secs: DEFAULT_PERIOD_SECS,
                    state: AgentState::Stopped,
                    generation: 0,
                    run: None,
                }),
                active_generation: AtomicU64::new(0),
                delivery: Mutex::new(()),
            }),
            connector,
            collector,
            codec,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    /// Bounds each cycle's connect-publish-reply exchange.
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Selects the fields reported for a group.
    ///
    /// Allowed while running; the change applies from the next cycle.
    ///
    /// # Errors
    ///
    /// Returns [`DefenderError::InvalidInput`] for an unknown group id, with
    /// the flag table left as it was.
    pub fn set_metrics(&self, group: impl Into<u32>, mask: u32) -> Result<()> {
        let group = group.into();
        self.shared.lock_inner().registry.set_metrics(group, mask)?;
        tracing::debug!(group, mask, "Metrics flags updated");
        Ok(())
    }

    /// Current mask for a group.
    pub fn metrics(&self, group: MetricsGroup) -> u32 {
        self.shared.lock_inner().registry.metrics(group)
    }

    /// Copy of the whole flag table.
    pub fn registry(&self) -> MetricsRegistry {
        self.shared.registry()
    }

    /// Sets the reporting period.
    ///
    /// While running, the wake that is already armed keeps its time; the new
    /// period is used to schedule the wakes after it.
    ///
    /// # Errors
    ///
    /// Returns [`DefenderError::PeriodTooShort`] below
    /// [`MINIMUM_PERIOD_SECS`], leaving the period unchanged.
    pub fn set_period(&self, period_secs: u32) -> Result<()> {
        if period_secs < MINIMUM_PERIOD_SECS {
            return Err(DefenderError::PeriodTooShort {
                period: period_secs,
                minimum: MINIMUM_PERIOD_SECS,
            });
        }
        self.shared.lock_inner().period_secs = period_secs;
        tracing::info!(period_secs, "Reporting period updated");
        Ok(())
    }

    /// Currently configured period in seconds.
    pub fn period(&self) -> u32 {
        self.shared.lock_inner().period_secs
    }

    pub fn state(&self) -> AgentState {
        self.shared.lock_inner().state
    }

    /// Starts periodic reporting.
    ///
    /// Returns as soon as the background task is spawned; the first report
    /// is built and published asynchronously, using the flag table as it is
    /// at this call.
    ///
    /// # Errors
    ///
    /// - [`DefenderError::AlreadyStarted`] if already running.
    /// - [`DefenderError::InvalidConfig`] for a missing or malformed thing
    ///   name or endpoint.
    /// - [`DefenderError::NoRuntime`] outside a Tokio runtime.
    pub fn start(&self, info: StartInfo) -> Result<()> {
        let mut inner = self.shared.lock_inner();
        if inner.state == AgentState::Running {
            return Err(DefenderError::AlreadyStarted);
        }
        let target = info.connect_target(self.codec.format())?;
        let runtime = Handle::try_current().map_err(|_| DefenderError::NoRuntime)?;

        inner.generation += 1;
        let generation = inner.generation;
        let cancel = CancellationToken::new();

        tracing::info!(
            thing = %target.thing_name,
            endpoint = %target.endpoint,
            period_secs = inner.period_secs,
            generation,
            "Defender starting"
        );

        let task = ReportingTask {
            shared: self.shared.clone(),
            connector: self.connector.clone(),
            collector: self.collector.clone(),
            builder: ReportBuilder::new(self.codec.clone()),
            codec: self.codec.clone(),
            target,
            sink: info.sink,
            publish_timeout: self.publish_timeout,
            generation,
            cancel: cancel.clone(),
        };

        self.shared
            .active_generation
            .store(generation, Ordering::SeqCst);
        let handle = runtime.spawn(task.run(inner.registry));
        inner.state = AgentState::Running;
        inner.run = Some(RunHandle {
            cancel,
            task: handle,
        });
        Ok(())
    }

    /// Stops reporting. Does nothing when already stopped.
    ///
    /// Once this returns, the sink is not called again for the stopped run,
    /// even if a reply for its in-flight cycle arrives later. Calling it from
    /// the sink's own `notify` is allowed; the current delivery is the last.
    pub fn stop(&self) {
        let run = {
            let mut inner = self.shared.lock_inner();
            if inner.state == AgentState::Stopped {
                return;
            }
            inner.state = AgentState::Stopped;
            self.shared.active_generation.store(0, Ordering::SeqCst);
            inner.run.take()
        };

        if let Some(run) = run {
            run.cancel.cancel();
            run.task.abort();
        }

        if DELIVERING.with(Cell::get) == self.shared.id() {
            tracing::debug!("Stop requested from the event sink");
        } else {
            // A delivery that passed its generation check before the store
            // above still holds this lock; wait for it to finish.
            drop(self.shared.lock_delivery());
        }
        tracing::info!("Defender stopped");
    }
}

impl Drop for Defender {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State moved into the background task for one run.
struct ReportingTask {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    collector: Arc<dyn ConnectionCollector>,
    builder: ReportBuilder,
    codec: Arc<dyn ReportCodec>,
    target: ConnectTarget,
    sink: Option<Arc<dyn EventSink>>,
    publish_timeout: Duration,
    generation: u64,
    cancel: CancellationToken,
}

impl ReportingTask {
    async fn run(self, start_registry: MetricsRegistry) {
        let mut pending_registry = Some(start_registry);
        let mut next_wake = Instant::now();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep_until(next_wake) => {}
            }

            let cycle_start = next_wake;
            let registry = pending_registry
                .take()
                .unwrap_or_else(|| self.shared.registry());

            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = self.run_cycle(&registry) => event,
            };
            self.deliver(&event);

            next_wake = self.next_wake(cycle_start);
        }

        tracing::debug!(generation = self.generation, "Reporting task exited");
    }

    /// Next wake is the previous scheduled wake plus the current period.
    /// Wakes that already passed while the cycle was outstanding are skipped.
    fn next_wake(&self, cycle_start: Instant) -> Instant {
        let period = self.shared.period();
        let now = Instant::now();
        let mut next = cycle_start + period;
        let mut skipped = 0u32;
        while next <= now {
            next += period;
            skipped += 1;
        }
        if skipped > 0 {
            tracing::warn!(skipped, "Reporting cycle overran its period, wakes skipped");
        }
        next
    }

    async fn run_cycle(&self, registry: &MetricsRegistry) -> DefenderEvent {
        let snapshot = match self.collector.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(collector = self.collector.name(), error = %e, "Collection failed");
                return DefenderEvent::new(EventKind::CollectionFailed);
            }
        };

        let report_id = defender_common::id::next_report_id();
        let report = match self.builder.build(report_id, registry, &snapshot) {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(report_id, error = %e, "Report encoding failed");
                let mut event = DefenderEvent::new(EventKind::ReportEncodingFailed);
                event.report_id = Some(report_id);
                return event;
            }
        };

        let event = match self.exchange(&report.payload).await {
            Ok(reply) => {
                let kind = classify_reply(self.codec.as_ref(), &reply).into();
                DefenderEvent::new(kind).with_payload(reply)
            }
            Err(TransportError::Timeout) => {
                tracing::warn!(
                    report_id,
                    timeout_secs = self.publish_timeout.as_secs(),
                    "No reply before timeout"
                );
                DefenderEvent::new(classify_transport_error(&TransportError::Timeout))
            }
            Err(e) => {
                tracing::warn!(report_id, error = %e, "Publish failed");
                DefenderEvent::new(classify_transport_error(&e))
            }
        };

        event.with_report(report_id, report.payload)
    }

    /// Connects, publishes and waits for the reply, all within
    /// `publish_timeout`. The session is closed even when the reply times out.
    async fn exchange(&self, payload: &[u8]) -> std::result::Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + self.publish_timeout;
        let mut session = tokio::time::timeout_at(deadline, self.connector.connect(&self.target))
            .await
            .map_err(|_| TransportError::Timeout)??;
        let result = tokio::time::timeout_at(deadline, session.publish(payload))
            .await
            .unwrap_or(Err(TransportError::Timeout));
        session.close().await;
        result
    }

    fn deliver(&self, event: &DefenderEvent) {
        let _guard = self.shared.lock_delivery();
        if self.cancel.is_cancelled()
            || self.shared.active_generation.load(Ordering::SeqCst) != self.generation
        {
            tracing::debug!(kind = %event.kind, "Run stopped, discarding event");
            return;
        }

        tracing::info!(
            kind = %event.kind,
            report_id = event.report_id,
            "Reporting cycle finished"
        );
        if let Some(sink) = &self.sink {
            let _delivering = DeliveringGuard::enter(&self.shared);
            sink.notify(event);
        }
    }
}
