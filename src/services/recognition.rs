//! Recognition orchestration: retry, timeout and fallback around a classifier
//!
//! Transient failures (network, timeout, overload) are retried with
//! exponential backoff up to `max_attempts`; permanent failures stop at once.
//! Either way the caller always gets a descriptor: when classification gives
//! up, an `unknown` fallback keeps the physical item tracked.

use crate::domain::error::RecognitionError;
use crate::domain::inventory::ItemDescriptor;
use crate::domain::types::ImageRef;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[async_trait]
pub trait Classifier: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn classify(&self, image: &ImageRef) -> Result<ItemDescriptor, RecognitionError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.recognition_max_attempts(),
            base_backoff: config.recognition_base_backoff(),
            attempt_timeout: config.recognition_attempt_timeout(),
        }
    }

    /// Delay after failed attempt `attempt` (1-based): base, 2×base, 4×base, ...
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_backoff.saturating_mul(1u32 << exponent)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            attempt_timeout: Duration::from_secs(8),
        }
    }
}

/// Result of a full classification run
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionOutcome {
    pub descriptor: ItemDescriptor,
    pub attempts: u32,
    /// Last error when the descriptor is the fallback
    pub error: Option<RecognitionError>,
}

impl RecognitionOutcome {
    pub fn is_fallback(&self) -> bool {
        self.error.is_some()
    }
}

pub struct RecognitionOrchestrator {
    classifier: Arc<dyn Classifier>,
    policy: RetryPolicy,
    default_shelf_life_days: u32,
    metrics: Arc<Metrics>,
}

impl RecognitionOrchestrator {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        policy: RetryPolicy,
        default_shelf_life_days: u32,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { classifier, policy, default_shelf_life_days, metrics }
    }

    /// Classify with retries; returns the final error and the attempts spent
    pub async fn try_classify(
        &self,
        image: &ImageRef,
    ) -> (Result<ItemDescriptor, RecognitionError>, u32) {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.metrics.record_recognition_attempt();

            let result =
                match tokio::time::timeout(self.policy.attempt_timeout, self.classifier.classify(image))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(RecognitionError::Transient(format!(
                        "attempt exceeded {}ms",
                        self.policy.attempt_timeout.as_millis()
                    ))),
                };

            let err = match result {
                Ok(mut descriptor) => {
                    descriptor.confidence = descriptor.confidence.clamp(0.0, 1.0);
                    return (Ok(descriptor), attempt);
                }
                Err(err) => err,
            };

            self.metrics.record_recognition_failure(err.is_transient());
            if !err.is_transient() || attempt >= max_attempts {
                warn!(
                    classifier = %self.classifier.name(),
                    image_id = %image.id,
                    attempt = %attempt,
                    error = %err,
                    "recognition_gave_up"
                );
                return (Err(err), attempt);
            }

            let backoff = self.policy.backoff(attempt);
            warn!(
                classifier = %self.classifier.name(),
                image_id = %image.id,
                attempt = %attempt,
                backoff_ms = %backoff.as_millis(),
                error = %err,
                "recognition_retry"
            );
            tokio::time::sleep(backoff).await;
        }
    }

    /// Classify, substituting the fallback descriptor when classification fails
    pub async fn classify(&self, image: &ImageRef) -> RecognitionOutcome {
        match self.try_classify(image).await {
            (Ok(descriptor), attempts) => {
                info!(
                    image_id = %image.id,
                    category = %descriptor.category,
                    confidence = %descriptor.confidence,
                    shelf_life_days = %descriptor.shelf_life_days,
                    attempts = %attempts,
                    "recognition_succeeded"
                );
                RecognitionOutcome { descriptor, attempts, error: None }
            }
            (Err(err), attempts) => {
                self.metrics.record_recognition_fallback();
                RecognitionOutcome {
                    descriptor: ItemDescriptor::fallback(self.default_shelf_life_days),
                    attempts,
                    error: Some(err),
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::scripted::ScriptedClassifier;
    use super::*;
    use crate::domain::inventory::UNKNOWN_CATEGORY;

    fn orchestrator(classifier: Arc<ScriptedClassifier>) -> (RecognitionOrchestrator, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            attempt_timeout: Duration::from_secs(2),
        };
        (RecognitionOrchestrator::new(classifier, policy, 7, metrics.clone()), metrics)
    }

    fn image() -> ImageRef {
        ImageRef::new("frame-1", "/tmp/frame-1.jpg")
    }

    fn milk() -> ItemDescriptor {
        ItemDescriptor::new("milk", 0.93, 7)
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_first_attempt() {
        let classifier = ScriptedClassifier::always(Ok(milk()));
        let (orchestrator, _) = orchestrator(classifier.clone());

        let outcome = orchestrator.classify(&image()).await;
        assert_eq!(outcome.descriptor, milk());
        assert_eq!(outcome.attempts, 1);
        assert!(!outcome.is_fallback());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let classifier = ScriptedClassifier::new(
            vec![
                Err(RecognitionError::Transient("503".into())),
                Err(RecognitionError::Transient("connection reset".into())),
            ],
            Ok(milk()),
        );
        let (orchestrator, _) = orchestrator(classifier.clone());

        let started = tokio::time::Instant::now();
        let outcome = orchestrator.classify(&image()).await;

        assert_eq!(outcome.descriptor.category, "milk");
        assert_eq!(outcome.attempts, 3);
        assert_eq!(classifier.calls(), 3);
        // 500 ms + 1000 ms of backoff
        assert_eq!(started.elapsed(), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fall_back() {
        let classifier =
            ScriptedClassifier::always(Err(RecognitionError::Transient("unreachable".into())));
        let (orchestrator, metrics) = orchestrator(classifier.clone());

        let outcome = orchestrator.classify(&image()).await;

        assert!(outcome.is_fallback());
        assert_eq!(outcome.descriptor.category, UNKNOWN_CATEGORY);
        assert_eq!(outcome.descriptor.confidence, 0.0);
        assert_eq!(outcome.descriptor.shelf_life_days, 7);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(classifier.calls(), 3);
        assert_eq!(metrics.recognition_fallbacks(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_fails_immediately() {
        let classifier = ScriptedClassifier::new(
            vec![Err(RecognitionError::Permanent("malformed response".into()))],
            Ok(milk()),
        );
        let (orchestrator, _) = orchestrator(classifier.clone());

        let (result, attempts) = orchestrator.try_classify(&image()).await;
        assert!(matches!(result, Err(RecognitionError::Permanent(_))));
        assert_eq!(attempts, 1);
        assert_eq!(classifier.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_counts_as_transient() {
        let classifier = ScriptedClassifier::always(Ok(milk()));
        classifier.set_delay(Duration::from_secs(10));
        let (orchestrator, metrics) = orchestrator(classifier.clone());

        let outcome = orchestrator.classify(&image()).await;
        assert!(matches!(outcome.error, Some(RecognitionError::Transient(_))));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(metrics.recognition_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confidence_is_clamped() {
        let mut wild = milk();
        wild.confidence = 4.2;
        let classifier = ScriptedClassifier::always(Ok(wild));
        let (orchestrator, _) = orchestrator(classifier);

        let outcome = orchestrator.classify(&image()).await;
        assert_eq!(outcome.descriptor.confidence, 1.0);
    }
}
