//! Services - the gateway pipeline
//!
//! - `bus` - typed publish/subscribe with per-kind dispatch workers
//! - `hardware` - signal source seam and the exclusive camera
//! - `signal_pump` - debouncing and proximity edge detection
//! - `correlator` - press to capture to recognition to inventory sessions
//! - `recognition` - classifier retries and the unknown fallback
//! - `inventory_store` - single-writer inventory actor with snapshots
//! - `notification` - sequenced fan-out to external subscribers
//! - `runtime` - startup wiring and staged shutdown

pub mod bus;
pub mod correlator;
pub mod hardware;
pub mod inventory_store;
pub mod notification;
pub mod recognition;
pub mod runtime;
pub mod signal_pump;

pub use bus::{EventBus, EventHandler, FnHandler, SubscriptionToken};
pub use correlator::{CaptureCorrelator, CorrelatorHandle, PressListener};
pub use hardware::{ExclusiveCamera, RawSignal, SignalSource};
pub use inventory_store::{InventoryHandle, InventoryStore};
pub use notification::{JsonLinesTransport, Notification, NotificationSink, NotificationTransport};
pub use recognition::{Classifier, RecognitionOrchestrator, RetryPolicy};
pub use runtime::FridgeRuntime;
pub use signal_pump::SignalPump;
