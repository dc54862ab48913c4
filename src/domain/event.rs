//! Bus events: a tag per kind and a typed payload per tag
//!
//! On the wire an event is `{type, source, timestamp, data}`. Decoding goes
//! through [`WireEvent`] so that a bad `data` block for a known `type` is
//! reported as a [`MalformedEvent`] instead of a generic serde error.

use crate::domain::error::{ErrorCode, MalformedEvent};
use crate::domain::inventory::{InventoryItem, TakeReason};
use crate::domain::types::{Channel, ImageRef, ProximityReading, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    ButtonPress,
    CameraCapture,
    ProximitySensor,
    ItemPlaced,
    ItemTaken,
    SystemError,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::ButtonPress,
        EventKind::CameraCapture,
        EventKind::ProximitySensor,
        EventKind::ItemPlaced,
        EventKind::ItemTaken,
        EventKind::SystemError,
    ];

    /// Kinds forwarded to external subscribers
    pub const OUTBOUND: [EventKind; 4] = [
        EventKind::ItemPlaced,
        EventKind::ItemTaken,
        EventKind::ProximitySensor,
        EventKind::SystemError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ButtonPress => "BUTTON_PRESS",
            EventKind::CameraCapture => "CAMERA_CAPTURE",
            EventKind::ProximitySensor => "PROXIMITY_SENSOR",
            EventKind::ItemPlaced => "ITEM_PLACED",
            EventKind::ItemTaken => "ITEM_TAKEN",
            EventKind::SystemError => "SYSTEM_ERROR",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ButtonPress {
    pub channel: Channel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraCapture {
    pub session_id: SessionId,
    pub channel: Channel,
    pub image: ImageRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemPlaced {
    pub session_id: SessionId,
    pub item: InventoryItem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemTaken {
    pub session_id: SessionId,
    pub item: InventoryItem,
    pub reason: TakeReason,
    /// Category the classifier reported for the taken item
    pub recognized_category: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
}

impl SystemError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), session_id: None, channel: None }
    }

    pub fn for_session(mut self, session_id: &SessionId, channel: Channel) -> Self {
        self.session_id = Some(session_id.clone());
        self.channel = Some(channel);
        self
    }
}

/// Typed payload; the variant determines the event kind
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    ButtonPress(ButtonPress),
    CameraCapture(CameraCapture),
    ProximitySensor(ProximityReading),
    ItemPlaced(ItemPlaced),
    ItemTaken(ItemTaken),
    SystemError(SystemError),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::ButtonPress(_) => EventKind::ButtonPress,
            EventPayload::CameraCapture(_) => EventKind::CameraCapture,
            EventPayload::ProximitySensor(_) => EventKind::ProximitySensor,
            EventPayload::ItemPlaced(_) => EventKind::ItemPlaced,
            EventPayload::ItemTaken(_) => EventKind::ItemTaken,
            EventPayload::SystemError(_) => EventKind::SystemError,
        }
    }

    fn to_data(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            EventPayload::ButtonPress(p) => serde_json::to_value(p),
            EventPayload::CameraCapture(p) => serde_json::to_value(p),
            EventPayload::ProximitySensor(p) => serde_json::to_value(p),
            EventPayload::ItemPlaced(p) => serde_json::to_value(p),
            EventPayload::ItemTaken(p) => serde_json::to_value(p),
            EventPayload::SystemError(p) => serde_json::to_value(p),
        }
    }

    fn from_data(kind: EventKind, data: serde_json::Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            EventKind::ButtonPress => EventPayload::ButtonPress(serde_json::from_value(data)?),
            EventKind::CameraCapture => EventPayload::CameraCapture(serde_json::from_value(data)?),
            EventKind::ProximitySensor => {
                EventPayload::ProximitySensor(serde_json::from_value(data)?)
            }
            EventKind::ItemPlaced => EventPayload::ItemPlaced(serde_json::from_value(data)?),
            EventKind::ItemTaken => EventPayload::ItemTaken(serde_json::from_value(data)?),
            EventKind::SystemError => EventPayload::SystemError(serde_json::from_value(data)?),
        })
    }
}

/// Immutable bus event
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self { source: source.into(), timestamp: Utc::now(), payload }
    }

    pub fn button_press(source: impl Into<String>, channel: Channel) -> Self {
        Self::new(source, EventPayload::ButtonPress(ButtonPress { channel }))
    }

    pub fn proximity(source: impl Into<String>, reading: ProximityReading) -> Self {
        Self::new(source, EventPayload::ProximitySensor(reading))
    }

    pub fn system_error(source: impl Into<String>, error: SystemError) -> Self {
        Self::new(source, EventPayload::SystemError(error))
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Boundary checks applied before dispatch
    pub fn validate(&self) -> Result<(), MalformedEvent> {
        if self.source.trim().is_empty() {
            return Err(MalformedEvent(format!("{} event without source", self.kind())));
        }
        match &self.payload {
            EventPayload::ProximitySensor(reading) => {
                if !reading.distance_cm.is_finite() || reading.distance_cm < 0.0 {
                    return Err(MalformedEvent(format!(
                        "invalid proximity distance {}",
                        reading.distance_cm
                    )));
                }
            }
            EventPayload::CameraCapture(capture) => {
                if capture.image.id.is_empty() || capture.image.path.as_os_str().is_empty() {
                    return Err(MalformedEvent("camera capture without image".to_string()));
                }
            }
            EventPayload::ItemPlaced(ItemPlaced { item, .. })
            | EventPayload::ItemTaken(ItemTaken { item, .. }) => {
                if item.expires_at <= item.placed_at {
                    return Err(MalformedEvent(format!(
                        "item {} expires before it was placed",
                        item.id
                    )));
                }
            }
            EventPayload::ButtonPress(_) | EventPayload::SystemError(_) => {}
        }
        Ok(())
    }

    pub fn to_wire(&self) -> Result<WireEvent, serde_json::Error> {
        Ok(WireEvent {
            kind: self.kind(),
            source: self.source.clone(),
            timestamp: self.timestamp,
            data: self.payload.to_data()?,
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_wire()?)
    }

    /// Decode and validate a wire-format event
    pub fn from_json(raw: &str) -> Result<Self, MalformedEvent> {
        let wire: WireEvent =
            serde_json::from_str(raw).map_err(|e| MalformedEvent(format!("envelope: {e}")))?;
        Self::from_wire(wire)
    }

    pub fn from_wire(wire: WireEvent) -> Result<Self, MalformedEvent> {
        let payload = EventPayload::from_data(wire.kind, wire.data)
            .map_err(|e| MalformedEvent(format!("{} data: {e}", wire.kind)))?;
        let event = Self { source: wire.source, timestamp: wire.timestamp, payload };
        event.validate()?;
        Ok(event)
    }
}

/// JSON shape of an event: `{type, source, timestamp, data}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}
