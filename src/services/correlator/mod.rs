//! Capture correlation - one session per button channel
//!
//! A debounced press opens a session on its channel and requests a camera
//! frame. The frame goes to recognition; the result commits an inventory
//! change (PLACE adds, TAKE removes the best match). Timeouts, capture
//! failures and cancellation abort the session instead.
//!
//! ```text
//! IDLE -> AWAITING_CAPTURE -> AWAITING_RECOGNITION -> COMMITTED
//!              |                     |
//!              +------> ABORTED <----+
//! ```
//!
//! The correlator is a single actor, so transitions of one channel never
//! interleave. Capture and recognition run as tasks that report back through
//! the actor's input queue; results carrying a session id that is no longer
//! current are dropped.

mod handlers;

use crate::domain::error::HardwareError;
use crate::domain::event::{Event, EventPayload};
use crate::domain::types::{Channel, ImageRef, SessionId};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::bus::{EventBus, EventHandler};
use crate::services::hardware::ExclusiveCamera;
use crate::services::inventory_store::InventoryHandle;
use crate::services::recognition::{RecognitionOrchestrator, RecognitionOutcome};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::info;

/// Source id on events the correlator publishes
pub const CORRELATOR_SOURCE: &str = "capture_correlator";

const INPUT_QUEUE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingCapture,
    AwaitingRecognition,
}

/// Read-only view of an active session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub session_id: SessionId,
    pub channel: Channel,
    pub state: SessionState,
    /// Captured frame, once the session is past AWAITING_CAPTURE
    pub image_id: Option<String>,
}

pub(crate) struct Session {
    pub(crate) id: SessionId,
    pub(crate) channel: Channel,
    pub(crate) state: SessionState,
    pub(crate) started_at: Instant,
    pub(crate) deadline: Instant,
    pub(crate) image: Option<ImageRef>,
    /// Outstanding capture or recognition work
    pub(crate) task: Option<JoinHandle<()>>,
}

impl Session {
    fn view(&self) -> SessionView {
        SessionView {
            session_id: self.id.clone(),
            channel: self.channel,
            state: self.state,
            image_id: self.image.as_ref().map(|i| i.id.clone()),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

pub(crate) enum CorrelatorInput {
    Pressed(Channel),
    CaptureFinished {
        channel: Channel,
        session_id: SessionId,
        result: Result<ImageRef, HardwareError>,
    },
    RecognitionFinished {
        channel: Channel,
        session_id: SessionId,
        outcome: RecognitionOutcome,
    },
    Cancel(Channel),
    Sessions(oneshot::Sender<Vec<SessionView>>),
}

/// Cloneable handle into the correlator actor
#[derive(Clone)]
pub struct CorrelatorHandle {
    tx: mpsc::Sender<CorrelatorInput>,
}

impl CorrelatorHandle {
    /// Start a session on `channel`; false when the actor is gone or saturated
    pub fn press(&self, channel: Channel) -> bool {
        self.tx.try_send(CorrelatorInput::Pressed(channel)).is_ok()
    }

    /// Abort the active session on `channel`, if any
    pub fn cancel(&self, channel: Channel) -> bool {
        self.tx.try_send(CorrelatorInput::Cancel(channel)).is_ok()
    }

    pub async fn sessions(&self) -> Vec<SessionView> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(CorrelatorInput::Sessions(reply)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

/// Bus handler feeding `BUTTON_PRESS` events into the actor
pub struct PressListener {
    handle: CorrelatorHandle,
}

impl PressListener {
    pub fn new(handle: CorrelatorHandle) -> Arc<Self> {
        Arc::new(Self { handle })
    }
}

#[async_trait]
impl EventHandler for PressListener {
    fn name(&self) -> &str {
        CORRELATOR_SOURCE
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        if let EventPayload::ButtonPress(press) = &event.payload {
            if !self.handle.press(press.channel) {
                anyhow::bail!("correlator not accepting presses ({} dropped)", press.channel);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CorrelatorTimings {
    /// Bound on waiting for the camera, busy retries included
    pub capture_wait: Duration,
    pub busy_retry: Duration,
    /// Hard cap on the capture itself once the camera is held
    pub capture_timeout: Duration,
    pub recognition_timeout: Duration,
}

impl CorrelatorTimings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            capture_wait: config.capture_wait(),
            busy_retry: config.busy_retry_interval(),
            capture_timeout: config.capture_timeout(),
            recognition_timeout: config.recognition_timeout(),
        }
    }

    /// Deadline of the AWAITING_CAPTURE state
    fn capture_deadline(&self, from: Instant) -> Instant {
        from + self.capture_wait + self.capture_timeout
    }
}

pub struct CaptureCorrelator {
    pub(crate) sessions: FxHashMap<Channel, Session>,
    pub(crate) rx: mpsc::Receiver<CorrelatorInput>,
    pub(crate) tx: mpsc::Sender<CorrelatorInput>,
    pub(crate) camera: Arc<ExclusiveCamera>,
    pub(crate) recognizer: Arc<RecognitionOrchestrator>,
    pub(crate) inventory: InventoryHandle,
    pub(crate) bus: EventBus,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) timings: CorrelatorTimings,
}

impl CaptureCorrelator {
    pub fn new(
        timings: CorrelatorTimings,
        camera: Arc<ExclusiveCamera>,
        recognizer: Arc<RecognitionOrchestrator>,
        inventory: InventoryHandle,
        bus: EventBus,
        metrics: Arc<Metrics>,
    ) -> (Self, CorrelatorHandle) {
        let (tx, rx) = mpsc::channel(INPUT_QUEUE);
        let handle = CorrelatorHandle { tx: tx.clone() };
        let correlator = Self {
            sessions: FxHashMap::default(),
            rx,
            tx,
            camera,
            recognizer,
            inventory,
            bus,
            metrics,
            timings,
        };
        (correlator, handle)
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Actor loop; on shutdown every active session is aborted, never committed
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            capture_wait_ms = %self.timings.capture_wait.as_millis(),
            recognition_timeout_ms = %self.timings.recognition_timeout.as_millis(),
            "capture_correlator_started"
        );

        loop {
            let next_deadline = self.next_deadline();
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                maybe = self.rx.recv() => {
                    match maybe {
                        Some(input) => self.handle_input(input).await,
                        None => break,
                    }
                }
                _ = sleep_until_or_never(next_deadline) => {
                    self.expire_due(Instant::now());
                }
            }
        }

        self.abort_all_for_shutdown();
        info!("capture_correlator_stopped");
    }

    async fn handle_input(&mut self, input: CorrelatorInput) {
        match input {
            CorrelatorInput::Pressed(channel) => self.handle_press(channel),
            CorrelatorInput::CaptureFinished { channel, session_id, result } => {
                self.handle_capture_finished(channel, session_id, result)
            }
            CorrelatorInput::RecognitionFinished { channel, session_id, outcome } => {
                self.handle_recognition_finished(channel, session_id, outcome).await
            }
            CorrelatorInput::Cancel(channel) => self.handle_cancel(channel),
            CorrelatorInput::Sessions(reply) => {
                let mut views: Vec<SessionView> = self.sessions.values().map(Session::view).collect();
                views.sort_by_key(|v| v.channel.as_str());
                let _ = reply.send(views);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.sessions.values().map(|s| s.deadline).min()
    }
}

async fn sleep_until_or_never(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
