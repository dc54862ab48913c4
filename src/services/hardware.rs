//! Hardware capability interface
//!
//! A [`SignalSource`] pushes raw button/proximity signals and can grab a
//! camera frame. The physical board and the simulator both implement it;
//! everything downstream only sees this trait.

use crate::domain::error::HardwareError;
use crate::domain::types::{Channel, ImageRef};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Unconditioned signal as reported by a driver
#[derive(Debug, Clone, PartialEq)]
pub enum RawSignal {
    Button { channel: Channel },
    Proximity { distance_cm: f64, face_id: Option<String> },
}

#[async_trait]
pub trait SignalSource: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Push raw signals into `tx` until shutdown is signalled
    async fn run(&self, tx: mpsc::Sender<RawSignal>, shutdown: watch::Receiver<bool>);

    /// Grab one frame; callers serialize through [`ExclusiveCamera`]
    async fn capture(&self) -> Result<ImageRef, HardwareError>;
}

/// System-wide camera lock: one capture in flight, a second one fails fast
pub struct ExclusiveCamera {
    source: Arc<dyn SignalSource>,
    lock: Arc<Mutex<()>>,
    timeout: Duration,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Held for the duration of one capture; dropping it frees the camera
pub struct CameraGuard {
    _guard: OwnedMutexGuard<()>,
}

impl ExclusiveCamera {
    pub fn new(source: Arc<dyn SignalSource>, timeout: Duration) -> Self {
        Self {
            source,
            lock: Arc::new(Mutex::new(())),
            timeout,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn try_acquire(&self) -> Result<CameraGuard, HardwareError> {
        self.lock
            .clone()
            .try_lock_owned()
            .map(|guard| CameraGuard { _guard: guard })
            .map_err(|_| HardwareError::CameraBusy)
    }

    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    /// Highest number of captures observed inside the lock at once
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Relaxed)
    }

    /// Capture under the lock, bounded by the capture timeout
    pub async fn capture(&self) -> Result<ImageRef, HardwareError> {
        let _guard = self.try_acquire()?;
        let _counter = InFlight::enter(&self.in_flight, &self.peak_in_flight);

        match tokio::time::timeout(self.timeout, self.source.capture()).await {
            Ok(Ok(image)) => {
                debug!(source = %self.source.name(), image_id = %image.id, "camera_frame_captured");
                Ok(image)
            }
            Ok(Err(e)) => {
                warn!(source = %self.source.name(), error = %e, "camera_capture_failed");
                Err(e)
            }
            Err(_) => {
                warn!(source = %self.source.name(), timeout_ms = %self.timeout.as_millis(), "camera_capture_timeout");
                Err(HardwareError::Unavailable(format!(
                    "capture exceeded {}ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }
}

struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::Relaxed) + 1;
        peak.fetch_max(now, Ordering::Relaxed);
        Self { counter }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::simulator::SimulatedBoard;

    #[tokio::test]
    async fn test_second_capture_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let board = Arc::new(SimulatedBoard::new(dir.path()));
        board.handle().set_capture_delay(Duration::from_millis(200));
        let camera = Arc::new(ExclusiveCamera::new(board, Duration::from_secs(2)));

        let first = {
            let camera = camera.clone();
            tokio::spawn(async move { camera.capture().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(camera.is_busy());

        let second = camera.capture().await;
        assert_eq!(second, Err(HardwareError::CameraBusy));

        assert!(first.await.unwrap().is_ok());
        assert!(!camera.is_busy());
        assert_eq!(camera.peak_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_timeout_releases_camera() {
        let dir = tempfile::tempdir().unwrap();
        let board = Arc::new(SimulatedBoard::new(dir.path()));
        board.handle().set_capture_delay(Duration::from_secs(60));
        let camera = ExclusiveCamera::new(board.clone(), Duration::from_millis(100));

        let result = camera.capture().await;
        assert!(matches!(result, Err(HardwareError::Unavailable(_))));
        assert!(!camera.is_busy());
    }

    #[tokio::test]
    async fn test_aborted_capture_releases_camera() {
        let dir = tempfile::tempdir().unwrap();
        let board = Arc::new(SimulatedBoard::new(dir.path()));
        board.handle().set_capture_delay(Duration::from_secs(60));
        let camera = Arc::new(ExclusiveCamera::new(board, Duration::from_secs(120)));

        let task = {
            let camera = camera.clone();
            tokio::spawn(async move { camera.capture().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(camera.is_busy());

        task.abort();
        let _ = task.await;
        assert!(!camera.is_busy());
    }
}
