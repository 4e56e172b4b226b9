//! Shared WebSocket connection state
//!
//! Used by the connection state machine, the manager and both socket drivers.

use serde::Serialize;
use std::fmt;

use crate::core::{LocationId, Timeframe};
use crate::time::Millis;

/// Logical channel a physical socket belongs to.
///
/// In multiplexed mode everything rides on `Shared`; in per-location mode each
/// watched (location, timeframe) pair gets its own socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelKey {
    Shared,
    Location {
        location_id: LocationId,
        timeframe: Timeframe,
    },
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKey::Shared => f.write_str("shared"),
            ChannelKey::Location {
                location_id,
                timeframe,
            } => write!(f, "{location_id}/{timeframe}"),
        }
    }
}

/// Generation id of a physical socket. Events carrying an older id than the
/// connection's current socket are stale and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Internal lifecycle of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting { socket: SocketId, since: Millis },
    Open { socket: SocketId, since: Millis },
    Backoff { attempt: u32, retry_at: Millis },
    /// Retries exhausted; only an explicit reset leaves this state
    Failed,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open { .. })
    }

    pub fn socket(&self) -> Option<SocketId> {
        match self {
            ConnectionState::Connecting { socket, .. } | ConnectionState::Open { socket, .. } => {
                Some(*socket)
            }
            _ => None,
        }
    }
}

/// Status shown by the connection indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Fallback,
}

impl From<&ConnectionState> for ConnectionStatus {
    fn from(state: &ConnectionState) -> Self {
        match state {
            ConnectionState::Connecting { .. } => ConnectionStatus::Connecting,
            ConnectionState::Open { .. } => ConnectionStatus::Connected,
            ConnectionState::Idle | ConnectionState::Backoff { .. } => {
                ConnectionStatus::Disconnected
            }
            ConnectionState::Failed => ConnectionStatus::Fallback,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Warning,
    Critical,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub level: HealthLevel,
    pub score: u8,
    /// Time since the last inbound frame, if any arrived on this socket
    pub since_last_frame: Option<Millis>,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
}

impl HealthReport {
    pub fn is_connected(&self) -> bool {
        self.level != HealthLevel::Disconnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_state() {
        let open = ConnectionState::Open {
            socket: SocketId(3),
            since: 0,
        };
        assert_eq!(ConnectionStatus::from(&open), ConnectionStatus::Connected);
        assert_eq!(open.socket(), Some(SocketId(3)));

        let backoff = ConnectionState::Backoff {
            attempt: 1,
            retry_at: 2000,
        };
        assert_eq!(ConnectionStatus::from(&backoff), ConnectionStatus::Disconnected);
        assert_eq!(backoff.socket(), None);
        assert_eq!(
            ConnectionStatus::from(&ConnectionState::Failed),
            ConnectionStatus::Fallback
        );
    }

    #[test]
    fn test_channel_key_display() {
        let key = ChannelKey::Location {
            location_id: "women_region".into(),
            timeframe: Timeframe::Weekly,
        };
        assert_eq!(key.to_string(), "women_region/WEEKLY");
        assert_eq!(ChannelKey::Shared.to_string(), "shared");
    }
}
