//! Shared types for the fridge gateway

use crate::domain::inventory::Suggestion;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Logical direction of a physical action (which button was pressed)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    Place,
    Take,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Place, Channel::Take];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Place => "place",
            Channel::Take => "take",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Newtype wrapper for capture session IDs (UUIDv7, time-sortable)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a captured camera frame on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Frame identifier assigned by the signal source
    pub id: String,
    /// Path of the encoded frame (JPEG)
    pub path: PathBuf,
    pub captured_at: DateTime<Utc>,
}

impl ImageRef {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self { id: id.into(), path: path.into(), captured_at: Utc::now() }
    }
}

/// Transient proximity sample; never persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProximityReading {
    /// Estimated distance to the nearest face/body in centimetres
    pub distance_cm: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub face_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Set by the gateway before the reading goes out to subscribers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub greeting: Option<Greeting>,
    /// Item that should be used first; absent when the fridge is empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<Suggestion>,
}

impl ProximityReading {
    pub fn new(distance_cm: f64, face_id: Option<String>) -> Self {
        Self { distance_cm, face_id, timestamp: Utc::now(), greeting: None, suggestion: None }
    }

    pub fn with_greeting(mut self, greeting: Greeting, suggestion: Option<Suggestion>) -> Self {
        self.greeting = Some(greeting);
        self.suggestion = suggestion;
        self
    }
}

/// Time-of-day bucket for greeting someone at the fridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Greeting {
    Morning,
    Afternoon,
    Evening,
}

impl Greeting {
    /// 06:00-11:59 morning, 12:00-17:59 afternoon, evening otherwise
    pub fn for_hour(hour: u32) -> Self {
        match hour {
            6..=11 => Greeting::Morning,
            12..=17 => Greeting::Afternoon,
            _ => Greeting::Evening,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Greeting::Morning => "Good morning",
            Greeting::Afternoon => "Good afternoon",
            Greeting::Evening => "Good evening",
        }
    }
}
