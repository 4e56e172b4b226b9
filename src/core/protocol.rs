//! Wire protocol for the analytics WebSocket feed
//!
//! This module contains:
//! - Timeframe and Pattern enums shared by every layer
//! - Outbound `ClientFrame` (client → server, tagged by `action`)
//! - Inbound `Envelope` decoding (server → client, tagged by `type`/`event`)

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{Error, Result};

pub type LocationId = String;

/// Location id the server uses for the multi-location aggregate frame.
pub const AGGREGATE_LOCATION: &str = "all";

// ============================================================================
// Timeframe / Pattern
// ============================================================================

/// Bucketing granularity that scopes which accumulator a count belongs to.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Timeframe {
    Hourly,
    #[default]
    Daily,
    Weekly,
    Monthly,
}

impl Timeframe {
    pub const ALL: [Timeframe; 4] = [
        Timeframe::Hourly,
        Timeframe::Daily,
        Timeframe::Weekly,
        Timeframe::Monthly,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::Hourly => "HOURLY",
            Timeframe::Daily => "DAILY",
            Timeframe::Weekly => "WEEKLY",
            Timeframe::Monthly => "MONTHLY",
        }
    }

    /// Parse the API enum spelling, case-insensitively.
    pub fn from_api(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|tf| tf.as_str().eq_ignore_ascii_case(s.trim()))
    }

    /// Map a UI label ("Hourly", "Daily", ...) to the API enum. Unknown labels
    /// fall back to `Daily`, which is also the server default.
    pub fn from_ui_label(label: &str) -> Self {
        match label {
            "Hourly" => Timeframe::Hourly,
            "Daily" => Timeframe::Daily,
            "Weekly" => Timeframe::Weekly,
            "Monthly" => Timeframe::Monthly,
            _ => Timeframe::Daily,
        }
    }

    /// Sampling period used when seeding a chart for this timeframe.
    pub fn history_period(self) -> &'static str {
        match self {
            Timeframe::Hourly => "minutely",
            Timeframe::Daily => "hourly",
            Timeframe::Weekly => "daily",
            Timeframe::Monthly => "weekly",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of update a subscription asks the server to push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
    LiveCount,
    ChartData,
    PingPong,
}

impl Pattern {
    pub fn as_str(self) -> &'static str {
        match self {
            Pattern::LiveCount => "live_count",
            Pattern::ChartData => "chart_data",
            Pattern::PingPong => "ping_pong",
        }
    }

    /// `ping_pong` is connection-wide; the server ignores location/timeframe.
    pub fn is_scoped(self) -> bool {
        !matches!(self, Pattern::PingPong)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Outbound frames
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientFrame {
    SubscribePattern {
        pattern: Pattern,
        #[serde(rename = "locationId", default, skip_serializing_if = "Option::is_none")]
        location_id: Option<LocationId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeframe: Option<Timeframe>,
        interval: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },
    UnsubscribePattern {
        pattern: Pattern,
        #[serde(rename = "locationId", default, skip_serializing_if = "Option::is_none")]
        location_id: Option<LocationId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeframe: Option<Timeframe>,
    },
    Ping,
    Pong,
    SetTimeframe {
        timeframe: Timeframe,
    },
}

impl ClientFrame {
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Inbound frames
// ============================================================================

/// Logical message kind, collapsed from the wire spellings seen in the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    LiveCountUpdate,
    ChartDataPoint,
    ChartDataBatch,
    SubscriptionAck,
    HealthPing,
    HealthPong,
    ProgressiveSample,
    ProgressiveComplete,
    TimeframeReset,
    CameraHealth,
    ServerError,
    ConnectionWarning,
    Unknown,
}

impl MessageKind {
    pub fn from_wire(kind: &str) -> Self {
        match kind {
            "live_count_update" | "timeframe_update" | "liveUpdate" => MessageKind::LiveCountUpdate,
            "chart_data_point" => MessageKind::ChartDataPoint,
            "chart_data_batch" | "chart_data_update" | "chart_data_response" => {
                MessageKind::ChartDataBatch
            }
            "live_count_subscribed" | "chart_data_subscribed" | "ping_pong_subscribed"
            | "subscribed" => MessageKind::SubscriptionAck,
            "ping" | "health_ping" => MessageKind::HealthPing,
            "pong" | "health_pong" => MessageKind::HealthPong,
            "progressive_sample" => MessageKind::ProgressiveSample,
            "progressive_loading_complete" => MessageKind::ProgressiveComplete,
            "timeframe_reset" => MessageKind::TimeframeReset,
            "camera_health_update" => MessageKind::CameraHealth,
            "error" => MessageKind::ServerError,
            "connection_warning" => MessageKind::ConnectionWarning,
            _ => MessageKind::Unknown,
        }
    }
}

/// A decoded inbound frame: routing fields pulled out, payload kept as JSON.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub kind: MessageKind,
    /// Discriminator exactly as sent, for logging unknown kinds
    pub wire_kind: String,
    pub location_id: Option<LocationId>,
    pub timeframe: Option<Timeframe>,
    /// `timeframe` value that names none of the known timeframes
    pub unknown_timeframe: Option<String>,
    pub worker_id: Option<String>,
    pub body: Value,
}

impl Envelope {
    pub fn decode(msg: &str) -> Result<Self> {
        let body: Value = serde_json::from_str(msg)?;

        let wire_kind = body
            .get("type")
            .or_else(|| body.get("event"))
            .and_then(Value::as_str)
            .ok_or(Error::MissingKind)?
            .to_string();

        let location_id = str_field(&body, &["location_id", "locationId"]);
        let raw_timeframe = str_field(&body, &["timeframe"])
            .or_else(|| body.get("data").and_then(|d| str_field(d, &["timeframe"])));
        let timeframe = raw_timeframe.as_deref().and_then(Timeframe::from_api);
        let unknown_timeframe = raw_timeframe.filter(|_| timeframe.is_none());
        let worker_id = str_field(&body, &["worker_id"]);

        Ok(Self {
            kind: MessageKind::from_wire(&wire_kind),
            wire_kind,
            location_id,
            timeframe,
            unknown_timeframe,
            worker_id,
            body,
        })
    }

    /// Whether the frame addresses the multi-location aggregate.
    pub fn is_aggregate(&self) -> bool {
        self.location_id.as_deref() == Some(AGGREGATE_LOCATION)
    }
}

/// First string-valued field among `names`.
pub(crate) fn str_field(value: &Value, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|n| value.get(*n).and_then(Value::as_str))
        .map(str::to_string)
}

/// First numeric field among `names`, accepting integers, floats and numeric strings.
pub(crate) fn num_field(value: &Value, names: &[&str]) -> Option<i64> {
    names.iter().find_map(|n| value.get(*n).and_then(as_i64))
}

pub(crate) fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
