//! Normalized stream events
//!
//! This is the contract between the server relay and the client consumer. Every
//! provider-specific upstream envelope is mapped onto this small tagged union before
//! it reaches the browser.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Whether companion memory was consulted for a turn
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[cfg_attr(feature = "server", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MemoryMode {
    Off,
    Recall,
}

/// Marker names shared by every framing convention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum EventKind {
    Telemetry,
    Delta,
    Heartbeat,
    Done,
    Error,
}

/// A normalized event as emitted on `/api/chat-stream`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NormalizedStreamEvent {
    #[serde(rename_all = "camelCase")]
    Telemetry {
        timestamp: u64,
        memory_count: usize,
        memory_mode: MemoryMode,
    },
    Delta {
        content: String,
    },
    Heartbeat {},
    Done {},
    Error {
        message: String,
    },
}

impl NormalizedStreamEvent {
    /// Telemetry stamped with the current wall clock
    #[must_use]
    pub fn telemetry(memory_count: usize, memory_mode: MemoryMode) -> Self {
        Self::Telemetry {
            timestamp: now_millis(),
            memory_count,
            memory_mode,
        }
    }

    #[must_use]
    pub fn delta(content: impl Into<String>) -> Self {
        Self::Delta {
            content: content.into(),
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Telemetry { .. } => EventKind::Telemetry,
            Self::Delta { .. } => EventKind::Delta,
            Self::Heartbeat {} => EventKind::Heartbeat,
            Self::Done {} => EventKind::Done,
            Self::Error { .. } => EventKind::Error,
        }
    }

    /// Only `done` ends a stream; `error` is always followed by `done`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done {})
    }

    /// JSON payload for the `data:` line
    #[must_use]
    pub fn to_json(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => json,
            Err(e) => serde_json::json!({ "type": "error", "message": e.to_string() }).to_string(),
        }
    }

    /// Format as SSE message
    #[must_use]
    pub fn to_sse(&self) -> String {
        format!("data: {}\n\n", self.to_json())
    }
}

/// Milliseconds since the Unix epoch
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
