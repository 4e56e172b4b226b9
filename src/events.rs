//! Typed dashboard events and the observer registry that fans them out

use serde::Serialize;
use tracing::trace;

use crate::core::{CameraHealth, ChartSeries, CountUpdate, LocationId, ServerNotice, Timeframe};
use crate::ws_state::{ChannelKey, ConnectionStatus};

/// Warning code raised alongside a camera-health frame below 50 %.
pub const CAMERA_HEALTH_DEGRADED: &str = "CAMERA_HEALTH_DEGRADED";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardEvent {
    Status {
        channel: ChannelKey,
        status: ConnectionStatus,
    },
    /// One flushed batch of display-ready counts
    Counts { updates: Vec<CountUpdate> },
    Chart {
        location_id: LocationId,
        timeframe: Timeframe,
        series: ChartSeries,
    },
    TimeframeReset {
        location_id: Option<LocationId>,
        timeframe: Timeframe,
    },
    CameraHealth(CameraHealth),
    ServerError(ServerNotice),
    Warning(ServerNotice),
    TransportError {
        channel: ChannelKey,
        message: String,
    },
    /// Retries exhausted on a channel; live data will not resume on its own
    Fallback {
        channel: ChannelKey,
    },
}

impl DashboardEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DashboardEvent::Status { .. } => "status",
            DashboardEvent::Counts { .. } => "counts",
            DashboardEvent::Chart { .. } => "chart",
            DashboardEvent::TimeframeReset { .. } => "timeframe_reset",
            DashboardEvent::CameraHealth(_) => "camera_health",
            DashboardEvent::ServerError(_) => "server_error",
            DashboardEvent::Warning(_) => "warning",
            DashboardEvent::TransportError { .. } => "transport_error",
            DashboardEvent::Fallback { .. } => "fallback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Box<dyn FnMut(&DashboardEvent)>;

/// Observer registry. Listeners run synchronously, in subscription order, on
/// the thread that emits.
#[derive(Default)]
pub struct EventBus {
    listeners: Vec<(ListenerId, Listener)>,
    next_id: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&DashboardEvent) + 'static,
    {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(l, _)| *l != id);
        self.listeners.len() != before
    }

    pub fn emit(&mut self, event: &DashboardEvent) {
        trace!(event = event.name(), listeners = self.listeners.len(), "Emit");
        for (_, listener) in self.listeners.iter_mut() {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_subscribe_emit_unsubscribe() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut bus = EventBus::new();

        let sink = seen.clone();
        let id = bus.subscribe(move |e| sink.borrow_mut().push(e.name()));
        let event = DashboardEvent::Fallback {
            channel: ChannelKey::Shared,
        };

        bus.emit(&event);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(&event);

        assert_eq!(*seen.borrow(), vec!["fallback"]);
        assert!(bus.is_empty());
    }

    #[test]
    fn test_event_serializes_tagged() {
        let event = DashboardEvent::TimeframeReset {
            location_id: Some("gate".into()),
            timeframe: Timeframe::Hourly,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "timeframe_reset");
        assert_eq!(json["timeframe"], "HOURLY");
    }
}
