//! Data model shared between the acquisition loop, the store adapter, the
//! subscriber hub and the HTTP surface.
//!
//! All wire timestamps are milliseconds since the Unix epoch. Frames carry
//! exactly [`CHANNELS`] position and velocity entries; a frame is immutable
//! once published by the acquisition loop.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Number of radar channels (positions and velocities alike).
pub const CHANNELS: usize = 7;

/// Milliseconds since the Unix epoch, the timestamp unit of every message.
pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Sensor status tag, as carried on frames, status records and the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Ok,
    Obstructed,
    CommFailure,
    Initializing,
    Unknown,
}

impl StatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKind::Ok => "ok",
            StatusKind::Obstructed => "obstructed",
            StatusKind::CommFailure => "comm_failure",
            StatusKind::Initializing => "initializing",
            StatusKind::Unknown => "unknown",
        }
    }

    /// Parses a stored tag; anything unrecognized maps to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "ok" => StatusKind::Ok,
            "obstructed" => StatusKind::Obstructed,
            "comm_failure" => StatusKind::CommFailure,
            "initializing" => StatusKind::Initializing,
            _ => StatusKind::Unknown,
        }
    }
}

impl std::fmt::Display for StatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded telemetry frame. Produced once per acquisition tick.
#[derive(Debug, Clone, Serialize)]
pub struct RadarFrame {
    pub positions: [f64; CHANNELS],
    pub velocities: [f64; CHANNELS],
    /// ms since epoch, stamped on receipt of the sensor reply
    pub timestamp: i64,
    pub status: StatusKind,
}

impl RadarFrame {
    pub fn new() -> Self {
        Self {
            positions: [0.0; CHANNELS],
            velocities: [0.0; CHANNELS],
            timestamp: now_ms(),
            status: StatusKind::Ok,
        }
    }

    /// An all-zero position block is how an obstructed sensor presents.
    pub fn all_positions_zero(&self) -> bool {
        self.positions.iter().all(|&p| p == 0.0)
    }
}

impl Default for RadarFrame {
    fn default() -> Self {
        Self::new()
    }
}

/// A significant per-channel velocity delta, caused by exactly one frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VelocityChange {
    /// Channel index in 0..=6
    pub index: usize,
    pub old_value: f64,
    pub new_value: f64,
    pub change_value: f64,
    pub timestamp: i64,
}

/// Current sensor status record, monotonically updated by the acquisition
/// loop and mirrored into the store on every transition.
#[derive(Debug, Clone, Serialize)]
pub struct RadarStatus {
    pub status: StatusKind,
    pub timestamp: i64,
    #[serde(rename = "lastError", skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(rename = "errorCount", skip_serializing_if = "is_zero")]
    pub error_count: u32,
    #[serde(rename = "connectionInfo", skip_serializing_if = "Option::is_none")]
    pub connection_info: Option<String>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl RadarStatus {
    pub fn initializing() -> Self {
        Self {
            status: StatusKind::Initializing,
            timestamp: now_ms(),
            last_error: None,
            error_count: 0,
            connection_info: None,
        }
    }
}

/// One entry of a per-channel time-series ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub value: f64,
    pub timestamp: i64,
}

/// The most recent batch of change events, kept in memory and mirrored to
/// the store for clients that poll instead of subscribing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatestUpdate {
    pub timestamp: i64,
    pub changes: Vec<VelocityChange>,
}

/// Server-originated realtime messages. The `type` tag is the dispatch key
/// subscribers switch on.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        timestamp: i64,
        #[serde(rename = "clientId")]
        client_id: String,
    },
    Metrics {
        timestamp: i64,
        positions: [f64; CHANNELS],
        velocities: [f64; CHANNELS],
        status: StatusKind,
    },
    VelocityChanges {
        timestamp: i64,
        changes: Vec<VelocityChange>,
    },
    Status {
        timestamp: i64,
        status: StatusKind,
        #[serde(rename = "lastError", skip_serializing_if = "Option::is_none")]
        last_error: Option<String>,
        #[serde(rename = "errorCount", skip_serializing_if = "Option::is_none")]
        error_count: Option<u32>,
    },
    VelocityHistory {
        timestamp: i64,
        index: usize,
        history: Vec<HistoryPoint>,
    },
    Ping {
        timestamp: i64,
        time: i64,
    },
    Pong {
        timestamp: i64,
        time: i64,
        #[serde(rename = "serverTime")]
        server_time: i64,
    },
    Error {
        timestamp: i64,
        error: String,
        data: ErrorData,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorData {
    pub code: String,
}

impl ServerMessage {
    pub fn status(record: &RadarStatus) -> Self {
        ServerMessage::Status {
            timestamp: now_ms(),
            status: record.status,
            last_error: record.last_error.clone(),
            error_count: (record.error_count > 0).then_some(record.error_count),
        }
    }

    pub fn metrics(frame: &RadarFrame) -> Self {
        ServerMessage::Metrics {
            timestamp: now_ms(),
            positions: frame.positions,
            velocities: frame.velocities,
            status: frame.status,
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            timestamp: now_ms(),
            error: message.into(),
            data: ErrorData { code: code.to_string() },
        }
    }
}

/// Subscriber-originated commands. Anything that fails to parse into this
/// union is answered with an `invalid_format` error message.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    GetStatus,
    GetHistory {
        index: i64,
    },
    Ping {
        #[serde(default)]
        time: i64,
    },
}
