//! Domain models - events, inventory and the error taxonomy
//!
//! - `types` - channels, session ids, image references, proximity readings
//! - `event` - bus events and their wire format
//! - `inventory` - items, descriptors and ranking rules
//! - `error` - typed failures and `SYSTEM_ERROR` codes

pub mod error;
pub mod event;
pub mod inventory;
pub mod types;

pub use error::{BusError, ErrorCode, HardwareError, MalformedEvent, RecognitionError, StoreError};
pub use event::{Event, EventKind, EventPayload, SystemError};
pub use inventory::{Inventory, InventoryItem, ItemDescriptor, ItemId, Recommendation, Suggestion, TakeReason};
pub use types::{Channel, Greeting, ImageRef, ProximityReading, SessionId};
