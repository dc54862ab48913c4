//! Deterministic simulated sensor board
//!
//! Signals are injected through a [`SimulatorHandle`] (tests, stdin keys in
//! the binary). Captures write a tiny placeholder JPEG into the capture dir.
//! Delays and failures can be injected to exercise the timeout paths.

use crate::domain::error::HardwareError;
use crate::domain::types::{Channel, ImageRef};
use crate::services::hardware::{RawSignal, SignalSource};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// SOI + EOI markers; enough for anything that sniffs the file type
const PLACEHOLDER_JPEG: [u8; 4] = [0xFF, 0xD8, 0xFF, 0xD9];

/// Distances (cm) a face passes through when walking up to the fridge and away
const FACE_APPROACH_CM: [f64; 6] = [150.0, 90.0, 45.0, 30.0, 45.0, 120.0];

#[derive(Default)]
struct Control {
    capture_delay: Mutex<Duration>,
    failing_captures: AtomicU32,
    face_counter: AtomicU64,
}

/// Cloneable injection handle
#[derive(Clone)]
pub struct SimulatorHandle {
    tx: mpsc::UnboundedSender<RawSignal>,
    control: Arc<Control>,
}

impl SimulatorHandle {
    pub fn press(&self, channel: Channel) {
        self.send(RawSignal::Button { channel });
    }

    pub fn proximity(&self, distance_cm: f64) {
        self.send(RawSignal::Proximity { distance_cm, face_id: None });
    }

    /// A face walks up to the fridge and leaves again
    pub fn face_approach(&self) {
        let n = self.control.face_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let face_id = format!("sim-face-{n}");
        for distance_cm in FACE_APPROACH_CM {
            self.send(RawSignal::Proximity { distance_cm, face_id: Some(face_id.clone()) });
        }
    }

    /// Make every subsequent capture take `delay`
    pub fn set_capture_delay(&self, delay: Duration) {
        *self.control.capture_delay.lock() = delay;
    }

    /// Fail the next `count` captures with `HardwareUnavailable`
    pub fn fail_next_captures(&self, count: u32) {
        self.control.failing_captures.store(count, Ordering::Relaxed);
    }

    fn send(&self, signal: RawSignal) {
        if self.tx.send(signal).is_err() {
            debug!("simulator_signal_dropped_not_running");
        }
    }
}

pub struct SimulatedBoard {
    capture_dir: PathBuf,
    handle: SimulatorHandle,
    inject_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<RawSignal>>,
    frame_counter: AtomicU64,
}

impl SimulatedBoard {
    pub fn new(capture_dir: impl AsRef<Path>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            capture_dir: capture_dir.as_ref().to_path_buf(),
            handle: SimulatorHandle { tx, control: Arc::new(Control::default()) },
            inject_rx: tokio::sync::Mutex::new(rx),
            frame_counter: AtomicU64::new(0),
        }
    }

    pub fn handle(&self) -> SimulatorHandle {
        self.handle.clone()
    }
}

#[async_trait]
impl SignalSource for SimulatedBoard {
    fn name(&self) -> &str {
        "simulator"
    }

    async fn run(&self, tx: mpsc::Sender<RawSignal>, mut shutdown: watch::Receiver<bool>) {
        let Ok(mut inject_rx) = self.inject_rx.try_lock() else {
            warn!("simulator_already_running");
            return;
        };
        info!(capture_dir = %self.capture_dir.display(), "simulator_started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                maybe = inject_rx.recv() => {
                    let Some(signal) = maybe else { break };
                    if tx.send(signal).await.is_err() {
                        break;
                    }
                }
            }
        }
        info!("simulator_stopped");
    }

    async fn capture(&self) -> Result<ImageRef, HardwareError> {
        let delay = *self.handle.control.capture_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failing = &self.handle.control.failing_captures;
        if failing
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(HardwareError::Unavailable("simulated capture failure".to_string()));
        }

        let n = self.frame_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("sim-{n:06}");
        let path = self.capture_dir.join(format!("{id}.jpg"));

        tokio::fs::create_dir_all(&self.capture_dir)
            .await
            .map_err(|e| HardwareError::Unavailable(format!("capture dir: {e}")))?;
        tokio::fs::write(&path, PLACEHOLDER_JPEG)
            .await
            .map_err(|e| HardwareError::Unavailable(format!("write frame: {e}")))?;

        Ok(ImageRef::new(id, path))
    }
}
