//! Notification sink - push committed events to connected subscribers
//!
//! The sink is a bus handler for the outbound kinds. Every delivered event
//! gets the next global sequence number and is offered to each subscriber's
//! bounded queue. A subscriber whose queue is full or closed is disconnected;
//! the client side reconnects after a fixed delay and whatever was emitted in
//! between is not replayed.

use crate::domain::event::{Event, EventKind};
use crate::infra::metrics::Metrics;
use crate::services::bus::{EventBus, EventHandler, SubscriptionToken};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Outbound message: the wire event plus its sequence number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub seq: u64,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl Notification {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

struct Subscriber {
    tx: mpsc::Sender<Notification>,
    last_delivered_seq: u64,
}

struct SinkState {
    next_seq: u64,
    subscribers: FxHashMap<String, Subscriber>,
}

pub struct NotificationSink {
    state: Mutex<SinkState>,
    buffer: usize,
    metrics: Arc<Metrics>,
}

impl NotificationSink {
    pub fn new(buffer: usize, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SinkState { next_seq: 1, subscribers: FxHashMap::default() }),
            buffer: buffer.max(1),
            metrics,
        })
    }

    /// Subscribe this sink to every outbound kind on `bus`
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> Vec<SubscriptionToken> {
        EventKind::OUTBOUND
            .iter()
            .map(|kind| bus.subscribe(*kind, self.clone() as Arc<dyn EventHandler>))
            .collect()
    }

    /// Open a delivery queue for `channel_id`, replacing any previous one
    pub fn connect(&self, channel_id: impl Into<String>) -> mpsc::Receiver<Notification> {
        let channel_id = channel_id.into();
        let (tx, rx) = mpsc::channel(self.buffer);
        let replaced = self
            .state
            .lock()
            .subscribers
            .insert(channel_id.clone(), Subscriber { tx, last_delivered_seq: 0 })
            .is_some();
        info!(channel_id = %channel_id, replaced = %replaced, "subscriber_connected");
        rx
    }

    pub fn disconnect(&self, channel_id: &str) -> bool {
        self.state.lock().subscribers.remove(channel_id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    pub fn last_delivered_seq(&self, channel_id: &str) -> Option<u64> {
        self.state.lock().subscribers.get(channel_id).map(|s| s.last_delivered_seq)
    }

    /// Sequence number the next notification will get
    pub fn next_seq(&self) -> u64 {
        self.state.lock().next_seq
    }

    fn deliver(&self, event: &Event) -> anyhow::Result<()> {
        let wire = event.to_wire()?;

        // Sequence assignment and fan-out share one lock so every queue sees
        // notifications in sequence order
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;

        let notification = Notification {
            seq,
            kind: wire.kind,
            source: wire.source,
            timestamp: wire.timestamp,
            data: wire.data,
        };

        let mut dropped: Vec<String> = Vec::new();
        for (channel_id, subscriber) in state.subscribers.iter_mut() {
            match subscriber.tx.try_send(notification.clone()) {
                Ok(()) => {
                    subscriber.last_delivered_seq = seq;
                    self.metrics.record_notification_sent();
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(channel_id = %channel_id, seq = %seq, "subscriber_buffer_full_disconnected");
                    dropped.push(channel_id.clone());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    info!(channel_id = %channel_id, "subscriber_closed_disconnected");
                    dropped.push(channel_id.clone());
                }
            }
        }
        for channel_id in dropped {
            state.subscribers.remove(&channel_id);
            self.metrics.record_subscriber_dropped();
        }

        debug!(seq = %seq, kind = %notification.kind, subscribers = %state.subscribers.len(), "notification_fanned_out");
        Ok(())
    }
}

#[async_trait]
impl EventHandler for NotificationSink {
    fn name(&self) -> &str {
        "notification_sink"
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        self.deliver(event)
    }
}

/// Client end of a subscription: forwards notifications somewhere else
#[async_trait]
pub trait NotificationTransport: Send {
    fn name(&self) -> &str;

    async fn deliver(&mut self, notification: &Notification) -> anyhow::Result<()>;
}

/// Keep `transport` subscribed to `sink`, reconnecting after `reconnect_delay`
/// whenever the connection drops
///
/// A notification whose delivery failed is retried first after reconnecting.
pub async fn run_subscription<T: NotificationTransport>(
    sink: Arc<NotificationSink>,
    channel_id: String,
    mut transport: T,
    reconnect_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(channel_id = %channel_id, transport = %transport.name(), "subscription_started");
    let mut pending: Option<Notification> = None;
    loop {
        let mut rx = sink.connect(channel_id.clone());

        loop {
            if let Some(notification) = pending.take() {
                if let Err(e) = transport.deliver(&notification).await {
                    warn!(channel_id = %channel_id, seq = %notification.seq, error = %format!("{e:#}"), "subscription_redelivery_failed");
                    pending = Some(notification);
                    sink.disconnect(&channel_id);
                    break;
                }
                info!(channel_id = %channel_id, seq = %notification.seq, "subscription_redelivered");
            }

            tokio::select! {
                // Queued notifications go out before a shutdown is honoured
                biased;

                maybe = rx.recv() => {
                    let Some(notification) = maybe else {
                        warn!(channel_id = %channel_id, "subscription_dropped_by_sink");
                        break;
                    };
                    if let Err(e) = transport.deliver(&notification).await {
                        warn!(channel_id = %channel_id, seq = %notification.seq, error = %format!("{e:#}"), "subscription_delivery_failed");
                        pending = Some(notification);
                        sink.disconnect(&channel_id);
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        sink.disconnect(&channel_id);
                        info!(channel_id = %channel_id, "subscription_stopped");
                        return;
                    }
                }
            }
        }

        info!(channel_id = %channel_id, delay_ms = %reconnect_delay.as_millis(), "subscription_reconnect_scheduled");
        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    if let Some(lost) = pending {
                        warn!(channel_id = %channel_id, seq = %lost.seq, "subscription_stopped_with_undelivered");
                    }
                    return;
                }
            }
        }
    }
}

/// Writes each notification as one JSON line
pub struct JsonLinesTransport<W> {
    writer: W,
}

impl<W> JsonLinesTransport<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> NotificationTransport for JsonLinesTransport<W> {
    fn name(&self) -> &str {
        "json_lines"
    }

    async fn deliver(&mut self, notification: &Notification) -> anyhow::Result<()> {
        let mut line = notification.to_json()?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
