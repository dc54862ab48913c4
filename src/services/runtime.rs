//! Gateway runtime - wires the components together and owns their tasks
//!
//! Startup order is bottom-up (metrics, bus, store, sink, correlator, then
//! the signal path). Shutdown runs in stages so nothing is lost in between:
//!
//! 1. signal source and pump stop producing
//! 2. correlator aborts open sessions (`SHUTDOWN` errors go to the bus)
//! 3. bus drains its queues into the handlers
//! 4. inventory writer finishes queued commands and stops
//! 5. egress (subscriptions, MQTT, HTTP, metrics reporter) stops

use crate::domain::event::EventKind;
use crate::domain::types::Channel;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::http_server::{start_http_server, HttpState};
use crate::io::mqtt_egress::run_mqtt_egress;
use crate::io::snapshot::SnapshotFile;
use crate::services::bus::EventBus;
use crate::services::correlator::{
    CaptureCorrelator, CorrelatorHandle, CorrelatorTimings, PressListener,
};
use crate::services::hardware::{ExclusiveCamera, SignalSource};
use crate::services::inventory_store::{InventoryHandle, InventoryStore};
use crate::services::notification::{run_subscription, NotificationSink, NotificationTransport};
use crate::services::recognition::{Classifier, RecognitionOrchestrator, RetryPolicy};
use crate::services::signal_pump::SignalPump;
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// One shutdown signal plus the tasks that observe it
struct Stage {
    name: &'static str,
    tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Stage {
    fn new(name: &'static str) -> Self {
        let (tx, _) = watch::channel(false);
        Self { name, tx, tasks: Vec::new() }
    }

    fn signal(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    async fn stop(&mut self) {
        self.tx.send_replace(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!(stage = %self.name, error = %e, "runtime_task_failed");
                }
            }
        }
        info!(stage = %self.name, "runtime_stage_stopped");
    }
}

pub struct FridgeRuntime {
    config: Config,
    metrics: Arc<Metrics>,
    bus: EventBus,
    inventory: InventoryHandle,
    sink: Arc<NotificationSink>,
    camera: Arc<ExclusiveCamera>,
    correlator: CorrelatorHandle,
    ingress: Stage,
    sessions: Stage,
    store: Stage,
    egress: Stage,
}

impl FridgeRuntime {
    /// Start every component; the gateway runs until [`FridgeRuntime::shutdown`]
    pub fn start(
        config: Config,
        source: Arc<dyn SignalSource>,
        classifier: Arc<dyn Classifier>,
    ) -> anyhow::Result<Self> {
        let snapshot_path = Path::new(config.snapshot_file());
        if let Some(parent) = snapshot_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create snapshot directory {}", parent.display()))?;
        }

        let metrics = Arc::new(Metrics::new());
        let mut ingress = Stage::new("ingress");
        let mut sessions = Stage::new("sessions");
        let mut store_stage = Stage::new("inventory");
        let mut egress = Stage::new("egress");

        let bus = EventBus::start(config.bus_queue_capacity(), config.handler_timeout(), metrics.clone());

        let snapshot = SnapshotFile::new(snapshot_path);
        let (store, inventory) =
            InventoryStore::new(Some(snapshot), config.expiring_soon(), metrics.clone());
        store_stage.tasks.push(store.spawn(store_stage.signal()));

        let sink = NotificationSink::new(config.subscriber_buffer(), metrics.clone());
        sink.attach(&bus);

        let camera = Arc::new(ExclusiveCamera::new(source.clone(), config.capture_timeout()));
        let recognizer = Arc::new(RecognitionOrchestrator::new(
            classifier.clone(),
            RetryPolicy::from_config(&config),
            config.default_shelf_life_days(),
            metrics.clone(),
        ));
        let (correlator, correlator_handle) = CaptureCorrelator::new(
            CorrelatorTimings::from_config(&config),
            camera.clone(),
            recognizer,
            inventory.clone(),
            bus.clone(),
            metrics.clone(),
        );
        sessions.tasks.push(correlator.spawn(sessions.signal()));
        bus.subscribe(EventKind::ButtonPress, PressListener::new(correlator_handle.clone()));

        let (signal_tx, signal_rx) = mpsc::channel(config.signal_queue_capacity());
        let pump = SignalPump::new(&config, source.name(), inventory.clone(), bus.clone(), metrics.clone());
        ingress.tasks.push(tokio::spawn(pump.run(signal_rx, ingress.signal())));
        let source_shutdown = ingress.signal();
        let board = source.clone();
        ingress.tasks.push(tokio::spawn(async move {
            board.run(signal_tx, source_shutdown).await;
        }));

        if config.mqtt_enabled() {
            egress.tasks.push(tokio::spawn(run_mqtt_egress(
                config.clone(),
                sink.clone(),
                egress.signal(),
            )));
        }

        let http_port = config.http_port();
        if http_port > 0 {
            let state = HttpState {
                site_id: Arc::new(config.site_id().to_string()),
                metrics: metrics.clone(),
                inventory: inventory.clone(),
                correlator: correlator_handle.clone(),
            };
            let http_shutdown = egress.signal();
            egress.tasks.push(tokio::spawn(async move {
                if let Err(e) = start_http_server(http_port, state, http_shutdown).await {
                    error!(error = %format!("{e:#}"), "http_server_error");
                }
            }));
        }

        egress.tasks.push(tokio::spawn(run_metrics_reporter(
            metrics.clone(),
            Duration::from_secs(config.metrics_interval_secs()),
            egress.signal(),
        )));

        info!(
            site = %config.site_id(),
            source = %source.name(),
            classifier = %classifier.name(),
            snapshot = %config.snapshot_file(),
            items = %inventory.len(),
            mqtt = %config.mqtt_enabled(),
            http_port = %http_port,
            "fridge_runtime_started"
        );

        Ok(Self {
            config,
            metrics,
            bus,
            inventory,
            sink,
            camera,
            correlator: correlator_handle,
            ingress,
            sessions,
            store: store_stage,
            egress,
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn inventory(&self) -> &InventoryHandle {
        &self.inventory
    }

    pub fn sink(&self) -> &Arc<NotificationSink> {
        &self.sink
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn correlator(&self) -> &CorrelatorHandle {
        &self.correlator
    }

    pub fn camera(&self) -> &Arc<ExclusiveCamera> {
        &self.camera
    }

    /// Abort the active session on `channel`
    pub fn cancel(&self, channel: Channel) -> bool {
        self.correlator.cancel(channel)
    }

    /// Attach an external subscriber; it reconnects after the configured delay
    /// and stops with the egress stage
    pub fn spawn_subscription<T>(&mut self, channel_id: impl Into<String>, transport: T)
    where
        T: NotificationTransport + 'static,
    {
        let task = tokio::spawn(run_subscription(
            self.sink.clone(),
            channel_id.into(),
            transport,
            self.config.reconnect_delay(),
            self.egress.signal(),
        ));
        self.egress.tasks.push(task);
    }

    /// Stop in dependency order; returns once every task has finished
    pub async fn shutdown(mut self) {
        info!("fridge_runtime_shutdown_started");
        self.ingress.stop().await;
        self.sessions.stop().await;
        self.bus.shutdown().await;
        self.store.stop().await;
        self.egress.stop().await;

        let summary = self.metrics.report();
        if summary.handler_failures > 0 {
            warn!(handler_failures = %summary.handler_failures, "runtime_handler_failures_seen");
        }
        info!(
            items = %self.inventory.len(),
            sessions_committed = %summary.sessions_committed,
            sessions_aborted = %summary.sessions_aborted,
            "fridge_runtime_stopped"
        );
    }
}

async fn run_metrics_reporter(
    metrics: Arc<Metrics>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    // First tick completes immediately
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => metrics.report().log(),
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
