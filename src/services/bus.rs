//! Event bus - typed pub/sub dispatcher
//!
//! Producers publish onto one bounded intake queue (`publish` never blocks).
//! A dispatch loop validates each event and routes it to the worker owning
//! its kind; each worker runs that kind's handlers one event at a time, so
//! delivery is FIFO per kind while different kinds progress independently.
//!
//! Every handler call runs in its own task under the handler timeout. Errors,
//! panics and overruns are logged and re-published as `SYSTEM_ERROR` events
//! (`HANDLER_FAILED`) without affecting the other handlers.

use crate::domain::error::{BusError, ErrorCode};
use crate::domain::event::{Event, EventKind, SystemError};
use crate::infra::metrics::Metrics;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Source id used for events the bus emits itself
pub const BUS_SOURCE: &str = "event_bus";

#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Name used in logs and `HANDLER_FAILED` messages
    fn name(&self) -> &str;

    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into an [`EventHandler`]
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Arc<Self> {
        Arc::new(Self { name: name.into(), f })
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.f)(event.clone()).await
    }
}

/// De-registration token returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken {
    kind: EventKind,
    id: u64,
}

impl SubscriptionToken {
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

#[derive(Clone)]
struct Registration {
    id: u64,
    handler: Arc<dyn EventHandler>,
}

struct Queued {
    event: Event,
    enqueued_at: Instant,
}

struct Shared {
    intake: mpsc::Sender<Queued>,
    registry: RwLock<FxHashMap<EventKind, Vec<Registration>>>,
    next_token: AtomicU64,
    metrics: Arc<Metrics>,
    handler_timeout: Duration,
    shutdown_tx: watch::Sender<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to the process-wide bus
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<Shared>,
}

impl EventBus {
    /// Create the bus and spawn its dispatch loop
    pub fn start(capacity: usize, handler_timeout: Duration, metrics: Arc<Metrics>) -> Self {
        let (intake, intake_rx) = mpsc::channel(capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            intake,
            registry: RwLock::new(FxHashMap::default()),
            next_token: AtomicU64::new(1),
            metrics,
            handler_timeout,
            shutdown_tx,
            dispatcher: Mutex::new(None),
        });

        let handle = tokio::spawn(dispatch_loop(shared.clone(), intake_rx, shutdown_rx));
        *shared.dispatcher.lock() = Some(handle);

        info!(capacity = %capacity, handler_timeout_ms = %handler_timeout.as_millis(), "event_bus_started");
        Self { shared }
    }

    /// Enqueue an event for asynchronous delivery
    pub fn publish(&self, event: Event) -> Result<(), BusError> {
        self.shared.publish(event)
    }

    /// Decode a wire-format event and enqueue it
    pub fn publish_json(&self, raw: &str) -> Result<(), BusError> {
        match Event::from_json(raw) {
            Ok(event) => self.publish(event),
            Err(e) => {
                self.shared.metrics.record_event_malformed();
                warn!(error = %e, "event_malformed_dropped");
                Err(e.into())
            }
        }
    }

    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> SubscriptionToken {
        let id = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
        debug!(kind = %kind, handler = %handler.name(), token = %id, "handler_subscribed");
        self.shared.registry.write().entry(kind).or_default().push(Registration { id, handler });
        SubscriptionToken { kind, id }
    }

    /// Remove a handler; returns false when the token was already removed
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut registry = self.shared.registry.write();
        let Some(handlers) = registry.get_mut(&token.kind) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|r| r.id != token.id);
        before != handlers.len()
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.shared.registry.read().get(&kind).map_or(0, Vec::len)
    }

    /// Stop intake, deliver everything already queued, then join the workers
    pub async fn shutdown(&self) {
        let _ = self.shared.shutdown_tx.send(true);
        let handle = self.shared.dispatcher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "event_bus_dispatcher_join_failed");
            }
        }
        info!("event_bus_stopped");
    }
}

impl Shared {
    fn publish(&self, event: Event) -> Result<(), BusError> {
        let queued = Queued { event, enqueued_at: Instant::now() };
        match self.intake.try_send(queued) {
            Ok(()) => {
                self.metrics.record_event_published();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(q)) => {
                self.metrics.record_event_dropped();
                warn!(kind = %q.event.kind(), source = %q.event.source, "event_queue_full_dropped");
                Err(BusError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(q)) => {
                debug!(kind = %q.event.kind(), "event_bus_closed_dropped");
                Err(BusError::Closed)
            }
        }
    }

    fn handlers_for(&self, kind: EventKind) -> Vec<Registration> {
        self.registry.read().get(&kind).cloned().unwrap_or_default()
    }

    /// Run one handler to completion, timeout or panic
    async fn invoke(&self, registration: &Registration, event: &Arc<Event>) {
        let handler = registration.handler.clone();
        let task_event = event.clone();
        let mut task = tokio::spawn(async move { handler.handle(&task_event).await });

        let failure = match tokio::time::timeout(self.handler_timeout, &mut task).await {
            Ok(Ok(Ok(()))) => return,
            Ok(Ok(Err(e))) => format!("{e:#}"),
            Ok(Err(join_err)) if join_err.is_panic() => "handler panicked".to_string(),
            Ok(Err(join_err)) => format!("handler task cancelled: {join_err}"),
            Err(_) => {
                task.abort();
                self.metrics.record_handler_timeout();
                format!("handler exceeded {}ms", self.handler_timeout.as_millis())
            }
        };

        let name = registration.handler.name();
        self.metrics.record_handler_failure();
        warn!(handler = %name, kind = %event.kind(), error = %failure, "handler_failed");

        // A failing SYSTEM_ERROR handler must not feed itself
        if event.kind() != EventKind::SystemError {
            let report = SystemError::new(ErrorCode::HandlerFailed, format!("{name}: {failure}"));
            let _ = self.publish(Event::system_error(BUS_SOURCE, report));
        }
    }
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    mut intake_rx: mpsc::Receiver<Queued>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut workers: FxHashMap<EventKind, mpsc::UnboundedSender<Queued>> = FxHashMap::default();
    let mut joins = Vec::with_capacity(EventKind::ALL.len());
    for kind in EventKind::ALL {
        let (tx, rx) = mpsc::unbounded_channel();
        joins.push(tokio::spawn(worker_loop(shared.clone(), kind, rx)));
        workers.insert(kind, tx);
    }

    let route = |queued: Queued| {
        if let Err(e) = queued.event.validate() {
            shared.metrics.record_event_malformed();
            warn!(kind = %queued.event.kind(), source = %queued.event.source, error = %e, "event_malformed_dropped");
            return;
        }
        if let Some(worker) = workers.get(&queued.event.kind()) {
            let _ = worker.send(queued);
        }
    };

    loop {
        tokio::select! {
            biased;

            maybe = intake_rx.recv() => {
                match maybe {
                    Some(queued) => {
                        shared.metrics.set_bus_queue_depth(intake_rx.len() as u64);
                        route(queued);
                    }
                    None => break,
                }
            }

            _ = shutdown.changed() => {
                // Refuse new events, deliver the backlog
                intake_rx.close();
                while let Some(queued) = intake_rx.recv().await {
                    route(queued);
                }
                break;
            }
        }
    }

    drop(route);
    drop(workers);
    for join in joins {
        let _ = join.await;
    }
}

async fn worker_loop(shared: Arc<Shared>, kind: EventKind, mut rx: mpsc::UnboundedReceiver<Queued>) {
    while let Some(queued) = rx.recv().await {
        shared.metrics.record_event_dispatched(queued.enqueued_at.elapsed().as_micros() as u64);
        let event = Arc::new(queued.event);
        for registration in shared.handlers_for(kind) {
            shared.invoke(&registration, &event).await;
        }
    }
    debug!(kind = %kind, "event_worker_stopped");
}
