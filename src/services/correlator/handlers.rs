//! Session transitions of the capture correlator

use super::{CaptureCorrelator, CorrelatorInput, Session, SessionState, CORRELATOR_SOURCE};
use crate::domain::error::{ErrorCode, HardwareError};
use crate::domain::event::{CameraCapture, Event, EventPayload, ItemPlaced, ItemTaken, SystemError};
use crate::domain::types::{Channel, ImageRef, SessionId};
use crate::infra::metrics::Metrics;
use crate::services::hardware::ExclusiveCamera;
use crate::services::recognition::RecognitionOutcome;
use smallvec::SmallVec;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

impl CaptureCorrelator {
    pub(crate) fn handle_press(&mut self, channel: Channel) {
        if let Some(active) = self.sessions.get(&channel) {
            self.metrics.record_press_ignored();
            info!(
                channel = %channel,
                session_id = %active.id,
                state = ?active.state,
                "press_ignored_session_active"
            );
            return;
        }

        let id = SessionId::new();
        let now = Instant::now();
        let task = self.spawn_capture(channel, id.clone());
        self.sessions.insert(
            channel,
            Session {
                id: id.clone(),
                channel,
                state: SessionState::AwaitingCapture,
                started_at: now,
                deadline: self.timings.capture_deadline(now),
                image: None,
                task: Some(task),
            },
        );
        self.metrics.record_session_started();
        info!(channel = %channel, session_id = %id, "session_started");
    }

    pub(crate) fn handle_capture_finished(
        &mut self,
        channel: Channel,
        session_id: SessionId,
        result: Result<ImageRef, HardwareError>,
    ) {
        if !self.is_current(channel, &session_id) {
            self.discard_stale(channel, &session_id, "capture");
            return;
        }

        let image = match result {
            Ok(image) => image,
            Err(e) => {
                self.abort(channel, e.code(), e.to_string());
                return;
            }
        };

        let task = self.spawn_recognition(channel, session_id.clone(), image.clone());
        let deadline = Instant::now() + self.timings.recognition_timeout;
        if let Some(session) = self.sessions.get_mut(&channel) {
            session.state = SessionState::AwaitingRecognition;
            session.image = Some(image.clone());
            session.deadline = deadline;
            session.task = Some(task);
        }

        info!(channel = %channel, session_id = %session_id, image_id = %image.id, "session_frame_captured");
        self.publish(EventPayload::CameraCapture(CameraCapture { session_id, channel, image }));
    }

    pub(crate) async fn handle_recognition_finished(
        &mut self,
        channel: Channel,
        session_id: SessionId,
        outcome: RecognitionOutcome,
    ) {
        if !self.is_current(channel, &session_id) {
            self.discard_stale(channel, &session_id, "recognition");
            return;
        }
        // Owned from here on: nothing else can touch this session while the
        // store applies the change
        let Some(session) = self.sessions.remove(&channel) else {
            return;
        };

        if let Some(err) = &outcome.error {
            warn!(
                channel = %channel,
                session_id = %session.id,
                attempts = %outcome.attempts,
                error = %err,
                "recognition_fallback_used"
            );
        }

        let descriptor = outcome.descriptor;
        match channel {
            Channel::Place => match self.inventory.place(descriptor, session.id.clone()).await {
                Ok(item) => {
                    let category = item.category.clone();
                    self.publish(EventPayload::ItemPlaced(ItemPlaced {
                        session_id: session.id.clone(),
                        item,
                    }));
                    self.commit(session, &category);
                }
                Err(e) => self.abort_session(session, e.code(), e.to_string()),
            },
            Channel::Take => match self.inventory.take(&descriptor.category).await {
                Ok(Some((item, reason))) => {
                    let category = item.category.clone();
                    self.publish(EventPayload::ItemTaken(ItemTaken {
                        session_id: session.id.clone(),
                        item,
                        reason,
                        recognized_category: descriptor.category,
                    }));
                    self.commit(session, &category);
                }
                Ok(None) => self.abort_session(
                    session,
                    ErrorCode::NothingToTake,
                    "inventory is empty".to_string(),
                ),
                Err(e) => self.abort_session(session, e.code(), e.to_string()),
            },
        }
    }

    pub(crate) fn handle_cancel(&mut self, channel: Channel) {
        if self.sessions.contains_key(&channel) {
            self.abort(channel, ErrorCode::Cancelled, "cancelled".to_string());
        } else {
            debug!(channel = %channel, "cancel_without_session");
        }
    }

    /// Abort every session whose state deadline has passed
    pub(crate) fn expire_due(&mut self, now: Instant) {
        let due: SmallVec<[Channel; 2]> = self
            .sessions
            .values()
            .filter(|s| s.deadline <= now)
            .map(|s| s.channel)
            .collect();

        for channel in due {
            let message = match self.sessions.get(&channel).map(|s| s.state) {
                Some(SessionState::AwaitingCapture) => "no frame before the capture deadline",
                Some(SessionState::AwaitingRecognition) => "recognition did not finish before the deadline",
                None => continue,
            };
            self.abort(channel, ErrorCode::SessionTimeout, message.to_string());
        }
    }

    pub(crate) fn abort_all_for_shutdown(&mut self) {
        let active: SmallVec<[Channel; 2]> = self.sessions.keys().copied().collect();
        for channel in active {
            self.abort(channel, ErrorCode::Shutdown, "gateway shutting down".to_string());
        }
    }

    fn is_current(&self, channel: Channel, session_id: &SessionId) -> bool {
        self.sessions.get(&channel).is_some_and(|s| &s.id == session_id)
    }

    fn discard_stale(&self, channel: Channel, session_id: &SessionId, what: &str) {
        self.metrics.record_stale_result();
        debug!(channel = %channel, session_id = %session_id, result = %what, "stale_result_discarded");
    }

    fn commit(&self, session: Session, category: &str) {
        let duration_ms = session.elapsed_ms();
        self.metrics.record_session_committed(duration_ms);
        info!(
            channel = %session.channel,
            session_id = %session.id,
            category = %category,
            duration_ms = %duration_ms,
            "session_committed"
        );
    }

    fn abort(&mut self, channel: Channel, code: ErrorCode, message: String) {
        if let Some(session) = self.sessions.remove(&channel) {
            self.abort_session(session, code, message);
        }
    }

    /// Cancel outstanding work, report, and leave the channel idle
    fn abort_session(&self, mut session: Session, code: ErrorCode, message: String) {
        if let Some(task) = session.task.take() {
            task.abort();
        }
        let duration_ms = session.elapsed_ms();
        self.metrics.record_session_aborted(duration_ms);
        warn!(
            channel = %session.channel,
            session_id = %session.id,
            state = ?session.state,
            code = %code.as_str(),
            error = %message,
            duration_ms = %duration_ms,
            "session_aborted"
        );

        let report = SystemError::new(code, message).for_session(&session.id, session.channel);
        self.publish(EventPayload::SystemError(report));
    }

    fn publish(&self, payload: EventPayload) {
        let event = Event::new(CORRELATOR_SOURCE, payload);
        let kind = event.kind();
        if let Err(e) = self.bus.publish(event) {
            warn!(kind = %kind, error = %e, "correlator_publish_failed");
        }
    }

    fn spawn_capture(&self, channel: Channel, session_id: SessionId) -> JoinHandle<()> {
        let camera = self.camera.clone();
        let metrics = self.metrics.clone();
        let tx = self.tx.clone();
        let timings = self.timings;

        tokio::spawn(async move {
            let result =
                capture_with_retry(&camera, timings.capture_wait, timings.busy_retry, &metrics).await;
            metrics.record_capture(result.is_ok());
            let _ = tx.send(CorrelatorInput::CaptureFinished { channel, session_id, result }).await;
        })
    }

    fn spawn_recognition(
        &self,
        channel: Channel,
        session_id: SessionId,
        image: ImageRef,
    ) -> JoinHandle<()> {
        let recognizer = self.recognizer.clone();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let outcome = recognizer.classify(&image).await;
            let _ = tx
                .send(CorrelatorInput::RecognitionFinished { channel, session_id, outcome })
                .await;
        })
    }
}

/// Capture a frame, retrying while another session holds the camera
///
/// Busy retries back off from `busy_retry` (doubling, capped at 8x) and stop
/// once `wait` would be exceeded.
pub(crate) async fn capture_with_retry(
    camera: &ExclusiveCamera,
    wait: Duration,
    busy_retry: Duration,
    metrics: &Metrics,
) -> Result<ImageRef, HardwareError> {
    let give_up_at = Instant::now() + wait;
    let base = busy_retry.max(Duration::from_millis(1));
    let cap = base * 8;
    let mut delay = base;

    loop {
        match camera.capture().await {
            Err(HardwareError::CameraBusy) => {
                metrics.record_camera_busy_retry();
                if Instant::now() + delay > give_up_at {
                    return Err(HardwareError::CameraBusy);
                }
                debug!(delay_ms = %delay.as_millis(), "camera_busy_retry");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(cap);
            }
            other => return other,
        }
    }
}
