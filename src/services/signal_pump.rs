//! Signal conditioning between a signal source and the bus
//!
//! Raw signals arrive on a bounded channel. Button presses are debounced per
//! channel; proximity readings go through a hysteresis detector that fires
//! only on the far → near edge. Conditioned signals are published as
//! `BUTTON_PRESS` / `PROXIMITY_SENSOR` events; a proximity event also carries
//! a time-of-day greeting and the item that should be used first.

use crate::domain::event::Event;
use crate::domain::inventory::Suggestion;
use crate::domain::types::{Channel, Greeting, ProximityReading};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::bus::EventBus;
use crate::services::hardware::RawSignal;
use crate::services::inventory_store::InventoryHandle;
use chrono::{Local, Timelike, Utc};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Collapses presses on the same channel within the window of the last accepted one
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    last_accepted: FxHashMap<Channel, Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self { window, last_accepted: FxHashMap::default() }
    }

    pub fn accept(&mut self, channel: Channel, now: Instant) -> bool {
        if let Some(last) = self.last_accepted.get(&channel) {
            if now.saturating_duration_since(*last) < self.window {
                return false;
            }
        }
        self.last_accepted.insert(channel, now);
        true
    }
}

/// Rising-edge detector with hysteresis
///
/// Fires when a reading drops below `near_cm` while armed; re-arms once a
/// reading is at or above `far_cm`.
#[derive(Debug)]
pub struct ProximityDetector {
    near_cm: f64,
    far_cm: f64,
    armed: bool,
}

impl ProximityDetector {
    pub fn new(near_cm: f64, far_cm: f64) -> Self {
        Self { near_cm, far_cm: far_cm.max(near_cm), armed: true }
    }

    /// Returns true on a far → near transition
    pub fn update(&mut self, distance_cm: f64) -> bool {
        if !distance_cm.is_finite() {
            return false;
        }
        if self.armed && distance_cm < self.near_cm {
            self.armed = false;
            return true;
        }
        if !self.armed && distance_cm >= self.far_cm {
            self.armed = true;
        }
        false
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

pub struct SignalPump {
    source_name: String,
    debouncer: Debouncer,
    detector: ProximityDetector,
    inventory: InventoryHandle,
    bus: EventBus,
    metrics: Arc<Metrics>,
}

impl SignalPump {
    pub fn new(
        config: &Config,
        source_name: &str,
        inventory: InventoryHandle,
        bus: EventBus,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            source_name: source_name.to_string(),
            debouncer: Debouncer::new(config.debounce_window()),
            detector: ProximityDetector::new(config.proximity_near_cm(), config.proximity_far_cm()),
            inventory,
            bus,
            metrics,
        }
    }

    /// Consume raw signals until the source goes away or shutdown is signalled
    pub async fn run(mut self, mut rx: mpsc::Receiver<RawSignal>, mut shutdown: watch::Receiver<bool>) {
        info!(source = %self.source_name, "signal_pump_started");
        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                maybe = rx.recv() => {
                    match maybe {
                        Some(signal) => self.handle(signal, Instant::now()),
                        None => break,
                    }
                }
            }
        }
        info!(source = %self.source_name, "signal_pump_stopped");
    }

    fn handle(&mut self, signal: RawSignal, now: Instant) {
        match signal {
            RawSignal::Button { channel } => {
                if !self.debouncer.accept(channel, now) {
                    self.metrics.record_press_debounced();
                    debug!(channel = %channel, "button_press_debounced");
                    return;
                }
                self.metrics.record_press_accepted();
                info!(channel = %channel, source = %self.source_name, "button_pressed");
                self.publish(Event::button_press(self.source_name.clone(), channel));
            }
            RawSignal::Proximity { distance_cm, face_id } => {
                if !self.detector.update(distance_cm) {
                    return;
                }
                self.metrics.record_proximity_edge();
                let greeting = Greeting::for_hour(Local::now().hour());
                let suggestion = self.inventory.recommend(Utc::now()).first().map(Suggestion::from);
                info!(
                    distance_cm = %distance_cm,
                    face_id = ?face_id,
                    greeting = ?greeting,
                    suggested = ?suggestion.as_ref().map(|s| s.category.as_str()),
                    "proximity_detected"
                );
                let reading = ProximityReading::new(distance_cm, face_id).with_greeting(greeting, suggestion);
                self.publish(Event::proximity(self.source_name.clone(), reading));
            }
        }
    }

    fn publish(&self, event: Event) {
        if let Err(e) = self.bus.publish(event) {
            self.metrics.record_signal_dropped();
            warn!(error = %e, "signal_publish_failed");
        }
    }
}
