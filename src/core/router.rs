//! Message router for inbound feed frames
//!
//! Classifies every frame by its discriminator and decides whether it is
//! delivered, dropped (untracked location, stale timeframe, foreign worker) or
//! ignored (unknown kind). Nothing here mutates count or chart state; the
//! caller applies a delivered `Routed` value.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, trace, warn};

use super::chart::RawPoint;
use super::protocol::{
    as_i64, num_field, str_field, Envelope, LocationId, MessageKind, Timeframe,
    AGGREGATE_LOCATION,
};

/// Keys of the aggregate payload that are totals, not location labels.
const RESERVED_AGGREGATE_KEYS: [&str; 4] = ["total_count", "total_all_time", "timeframe", "timestamp"];

/// Field names a raw count may arrive under, in priority order.
const COUNT_FIELDS: [&str; 3] = ["cumulative_count", "live_count", "count"];

/// Maps server-side labels to the location ids the dashboard tracks.
///
/// The server keys the aggregate frame by display label; several labels are
/// known under more than one id. Labels without an entry map to themselves.
#[derive(Debug, Clone, Default)]
pub struct LabelMap {
    labels: HashMap<String, Vec<LocationId>>,
}

impl LabelMap {
    pub fn new(labels: HashMap<String, Vec<LocationId>>) -> Self {
        Self { labels }
    }

    pub fn resolve<'a>(&'a self, label: &'a str) -> Vec<&'a str> {
        match self.labels.get(label) {
            Some(ids) => ids.iter().map(String::as_str).collect(),
            None => vec![label],
        }
    }
}

/// One raw count extracted from a live-count frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationCount {
    pub location_id: LocationId,
    pub timeframe: Timeframe,
    pub count: u64,
}

/// Code and message carried by `error` / `connection_warning` frames.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerNotice {
    pub code: String,
    pub message: String,
    pub severity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraHealth {
    pub location_id: Option<LocationId>,
    pub healthy: u64,
    pub total: u64,
    pub percentage: f64,
}

impl CameraHealth {
    pub fn is_degraded(&self) -> bool {
        self.percentage < 50.0
    }
}

/// A frame that passed every filter, reduced to what its handler needs.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    LiveCounts(Vec<LocationCount>),
    ChartPoint {
        location_id: LocationId,
        timeframe: Timeframe,
        point: RawPoint,
    },
    ChartBatch {
        location_id: LocationId,
        timeframe: Timeframe,
        points: Vec<RawPoint>,
    },
    ProgressiveSample {
        location_id: LocationId,
        timeframe: Timeframe,
        count: u64,
        sample_index: Option<u64>,
        total_samples: Option<u64>,
    },
    ProgressiveComplete {
        location_id: LocationId,
        timeframe: Timeframe,
        final_count: u64,
    },
    TimeframeReset {
        location_id: Option<LocationId>,
        timeframe: Timeframe,
    },
    Ack {
        wire_kind: String,
    },
    Ping,
    Pong,
    CameraHealth(CameraHealth),
    ServerError(ServerNotice),
    Warning(ServerNotice),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    UntrackedLocation(LocationId),
    StaleTimeframe {
        location_id: LocationId,
        got: Timeframe,
        want: Timeframe,
    },
    /// Timeframe field present but not one of the known values
    UnknownTimeframe(String),
    ForeignWorker(String),
    /// Aggregate frame with no entry for any tracked location
    NoTrackedEntries,
    Incomplete(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Deliver(Routed),
    Dropped(DropReason),
    /// Unknown discriminator, kept for forward compatibility
    Ignored(String),
    Malformed(String),
}

/// Which consumer a frame arrived for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteScope<'a> {
    /// Shared connection: any tracked location is acceptable
    Shared,
    /// Dedicated connection: only this location is acceptable
    Location(&'a str),
}

impl RouteScope<'_> {
    fn admits(&self, location_id: &str) -> bool {
        match self {
            RouteScope::Shared => true,
            RouteScope::Location(l) => *l == location_id,
        }
    }
}

pub struct Router {
    /// Currently selected timeframe per tracked location
    selected: HashMap<LocationId, Timeframe>,
    /// Frames addressed to another worker instance are stale
    instance_id: String,
    labels: LabelMap,
}

impl Router {
    pub fn new(instance_id: impl Into<String>, labels: LabelMap) -> Self {
        Self {
            selected: HashMap::new(),
            instance_id: instance_id.into(),
            labels,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Start accepting frames for `location_id` at `timeframe`, or move an
    /// already tracked location to a new timeframe.
    pub fn track(&mut self, location_id: &str, timeframe: Timeframe) {
        let prev = self.selected.insert(location_id.to_string(), timeframe);
        debug!(location = location_id, ?prev, %timeframe, "Tracking location");
    }

    pub fn untrack(&mut self, location_id: &str) {
        if self.selected.remove(location_id).is_some() {
            debug!(location = location_id, "Untracked location");
        }
    }

    pub fn selected_timeframe(&self, location_id: &str) -> Option<Timeframe> {
        self.selected.get(location_id).copied()
    }

    pub fn tracked(&self) -> impl Iterator<Item = (&str, Timeframe)> {
        self.selected.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Classify one text frame.
    pub fn route(&self, msg: &str, scope: RouteScope<'_>) -> Verdict {
        trace!(len = msg.len(), "Routing frame");

        let env = match Envelope::decode(msg) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
                return Verdict::Malformed(e.to_string());
            }
        };

        if let Some(worker) = &env.worker_id {
            if *worker != self.instance_id {
                trace!(worker = %worker, "Frame for another worker instance");
                return Verdict::Dropped(DropReason::ForeignWorker(worker.clone()));
            }
        }

        let verdict = match env.kind {
            MessageKind::LiveCountUpdate => self.route_live_count(&env, scope),
            MessageKind::ChartDataPoint => self.route_chart_point(&env, scope),
            MessageKind::ChartDataBatch => self.route_chart_batch(&env, scope),
            MessageKind::ProgressiveSample => self.route_progressive_sample(&env, scope),
            MessageKind::ProgressiveComplete => self.route_progressive_complete(&env, scope),
            MessageKind::TimeframeReset => self.route_timeframe_reset(&env, scope),
            MessageKind::CameraHealth => self.route_camera_health(&env, scope),
            MessageKind::SubscriptionAck => Verdict::Deliver(Routed::Ack {
                wire_kind: env.wire_kind.clone(),
            }),
            MessageKind::HealthPing => Verdict::Deliver(Routed::Ping),
            MessageKind::HealthPong => Verdict::Deliver(Routed::Pong),
            MessageKind::ServerError => {
                Verdict::Deliver(Routed::ServerError(notice(&env.body, "SERVER_ERROR", None)))
            }
            MessageKind::ConnectionWarning => Verdict::Deliver(Routed::Warning(notice(
                &env.body,
                "CONNECTION_WARNING",
                Some("warning"),
            ))),
            MessageKind::Unknown => {
                debug!(kind = %env.wire_kind, "Ignoring unknown message kind");
                Verdict::Ignored(env.wire_kind.clone())
            }
        };

        if let Verdict::Dropped(reason) = &verdict {
            debug!(kind = %env.wire_kind, ?reason, "Dropped frame");
        }
        verdict
    }

    /// Resolve the frame's location against the tracked set and check that its
    /// timeframe (when present) is the one currently selected there.
    fn admit(
        &self,
        env: &Envelope,
        scope: RouteScope<'_>,
    ) -> Result<(LocationId, Timeframe), DropReason> {
        let location_id = match (&env.location_id, scope) {
            (Some(l), _) => l.clone(),
            (None, RouteScope::Location(l)) => l.to_string(),
            (None, RouteScope::Shared) => return Err(DropReason::Incomplete("location_id")),
        };

        if !scope.admits(&location_id) {
            return Err(DropReason::UntrackedLocation(location_id));
        }
        if let Some(raw) = &env.unknown_timeframe {
            return Err(DropReason::UnknownTimeframe(raw.clone()));
        }
        let want = self
            .selected_timeframe(&location_id)
            .ok_or_else(|| DropReason::UntrackedLocation(location_id.clone()))?;

        match env.timeframe {
            Some(got) if got != want => Err(DropReason::StaleTimeframe {
                location_id,
                got,
                want,
            }),
            _ => Ok((location_id, want)),
        }
    }

    fn route_live_count(&self, env: &Envelope, scope: RouteScope<'_>) -> Verdict {
        if env.is_aggregate() && !matches!(scope, RouteScope::Location(AGGREGATE_LOCATION)) {
            return self.route_aggregate(env, scope);
        }

        let (location_id, timeframe) = match self.admit(env, scope) {
            Ok(admitted) => admitted,
            Err(reason) => return Verdict::Dropped(reason),
        };

        let count = num_field(&env.body, &COUNT_FIELDS).or_else(|| {
            env.body.get("data").and_then(|d| {
                num_field(d, &COUNT_FIELDS)
                    .or_else(|| num_field(d, &["total_count", "live"]))
            })
        });

        match count {
            Some(c) => Verdict::Deliver(Routed::LiveCounts(vec![LocationCount {
                location_id,
                timeframe,
                count: c.max(0) as u64,
            }])),
            None => Verdict::Dropped(DropReason::Incomplete("count")),
        }
    }

    /// Expand the `location_id: "all"` frame into one count per tracked
    /// location, keeping entries whose timeframe is still selected.
    fn route_aggregate(&self, env: &Envelope, scope: RouteScope<'_>) -> Verdict {
        let Some(data) = env.body.get("data").and_then(Value::as_object) else {
            return Verdict::Dropped(DropReason::Incomplete("data"));
        };
        if let Some(raw) = &env.unknown_timeframe {
            return Verdict::Dropped(DropReason::UnknownTimeframe(raw.clone()));
        }

        let mut raw: Vec<(&str, i64)> = Vec::new();
        if let Some(total) = data.get("total_count").and_then(as_i64) {
            raw.push((AGGREGATE_LOCATION, total));
        }
        for (label, entry) in data {
            if RESERVED_AGGREGATE_KEYS.contains(&label.as_str()) {
                continue;
            }
            let Some(live) = entry.get("live").and_then(as_i64) else {
                continue;
            };
            for id in self.labels.resolve(label) {
                raw.push((id, live));
            }
        }

        let mut counts = Vec::new();
        for (id, count) in raw {
            if !scope.admits(id) {
                continue;
            }
            let Some(want) = self.selected_timeframe(id) else {
                continue;
            };
            if env.timeframe.is_some_and(|got| got != want) {
                trace!(location = id, got = ?env.timeframe, %want, "Skipping stale aggregate entry");
                continue;
            }
            counts.push(LocationCount {
                location_id: id.to_string(),
                timeframe: want,
                count: count.max(0) as u64,
            });
        }

        if counts.is_empty() {
            Verdict::Dropped(DropReason::NoTrackedEntries)
        } else {
            Verdict::Deliver(Routed::LiveCounts(counts))
        }
    }

    fn route_chart_point(&self, env: &Envelope, scope: RouteScope<'_>) -> Verdict {
        let (location_id, timeframe) = match self.admit(env, scope) {
            Ok(admitted) => admitted,
            Err(reason) => return Verdict::Dropped(reason),
        };
        let point = env
            .body
            .get("data_point")
            .or_else(|| env.body.get("point"))
            .and_then(|v| RawPoint::from_json(v, 0));

        match point {
            Some(point) => Verdict::Deliver(Routed::ChartPoint {
                location_id,
                timeframe,
                point,
            }),
            None => Verdict::Dropped(DropReason::Incomplete("data_point")),
        }
    }

    fn route_chart_batch(&self, env: &Envelope, scope: RouteScope<'_>) -> Verdict {
        let (location_id, timeframe) = match self.admit(env, scope) {
            Ok(admitted) => admitted,
            Err(reason) => return Verdict::Dropped(reason),
        };
        let array = env
            .body
            .get("chart_data")
            .or_else(|| env.body.get("data").and_then(|d| d.get("chart_data")))
            .and_then(Value::as_array);

        let Some(array) = array else {
            return Verdict::Dropped(DropReason::Incomplete("chart_data"));
        };
        let points = array
            .iter()
            .enumerate()
            .filter_map(|(i, v)| RawPoint::from_json(v, i))
            .collect();

        Verdict::Deliver(Routed::ChartBatch {
            location_id,
            timeframe,
            points,
        })
    }

    fn route_progressive_sample(&self, env: &Envelope, scope: RouteScope<'_>) -> Verdict {
        let (location_id, timeframe) = match self.admit(env, scope) {
            Ok(admitted) => admitted,
            Err(reason) => return Verdict::Dropped(reason),
        };
        let count = num_field(&env.body, &["cumulative_count", "current_count"]).unwrap_or(0);

        Verdict::Deliver(Routed::ProgressiveSample {
            location_id,
            timeframe,
            count: count.max(0) as u64,
            sample_index: num_field(&env.body, &["sample_index"]).map(|i| i.max(0) as u64),
            total_samples: num_field(&env.body, &["total_samples"]).map(|i| i.max(0) as u64),
        })
    }

    fn route_progressive_complete(&self, env: &Envelope, scope: RouteScope<'_>) -> Verdict {
        let (location_id, timeframe) = match self.admit(env, scope) {
            Ok(admitted) => admitted,
            Err(reason) => return Verdict::Dropped(reason),
        };
        let final_count = num_field(&env.body, &["final_count", "cumulative_count"]).unwrap_or(0);

        Verdict::Deliver(Routed::ProgressiveComplete {
            location_id,
            timeframe,
            final_count: final_count.max(0) as u64,
        })
    }

    fn route_timeframe_reset(&self, env: &Envelope, scope: RouteScope<'_>) -> Verdict {
        let Some(timeframe) = env.timeframe else {
            return Verdict::Dropped(match &env.unknown_timeframe {
                Some(raw) => DropReason::UnknownTimeframe(raw.clone()),
                None => DropReason::Incomplete("timeframe"),
            });
        };
        let location_id = match (&env.location_id, scope) {
            (Some(l), _) if l == AGGREGATE_LOCATION => None,
            (Some(l), _) => Some(l.clone()),
            (None, RouteScope::Location(l)) => Some(l.to_string()),
            (None, RouteScope::Shared) => None,
        };

        if let Some(l) = &location_id {
            if !scope.admits(l) || self.selected_timeframe(l).is_none() {
                return Verdict::Dropped(DropReason::UntrackedLocation(l.clone()));
            }
        }

        Verdict::Deliver(Routed::TimeframeReset {
            location_id,
            timeframe,
        })
    }

    fn route_camera_health(&self, env: &Envelope, scope: RouteScope<'_>) -> Verdict {
        if let Some(l) = &env.location_id {
            if !scope.admits(l) || self.selected_timeframe(l).is_none() {
                return Verdict::Dropped(DropReason::UntrackedLocation(l.clone()));
            }
        }
        let body = &env.body;

        Verdict::Deliver(Routed::CameraHealth(CameraHealth {
            location_id: env.location_id.clone(),
            healthy: num_field(body, &["healthy_cameras"]).unwrap_or(0).max(0) as u64,
            total: num_field(body, &["total_cameras"]).unwrap_or(0).max(0) as u64,
            percentage: body
                .get("health_percentage")
                .and_then(Value::as_f64)
                .unwrap_or(100.0),
        }))
    }
}

fn notice(body: &Value, default_code: &str, default_severity: Option<&str>) -> ServerNotice {
    let code = str_field(body, &["code", "warning_code"])
        .or_else(|| num_field(body, &["code"]).map(|c| c.to_string()))
        .unwrap_or_else(|| default_code.to_string());

    ServerNotice {
        code,
        message: str_field(body, &["message"]).unwrap_or_default(),
        severity: str_field(body, &["severity"]).or(default_severity.map(str::to_string)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> Router {
        let mut labels = HashMap::new();
        labels.insert(
            "men_inspection".to_string(),
            vec!["northern-gate".to_string(), "men_region".to_string()],
        );
        let mut r = Router::new("worker-1", LabelMap::new(labels));
        r.track("northern-gate", Timeframe::Hourly);
        r.track("women_region", Timeframe::Hourly);
        r
    }

    #[test]
    fn test_live_count_for_tracked_location() {
        let msg = r#"{"type": "live_count_update", "location_id": "women_region",
                      "timeframe": "HOURLY", "cumulative_count": 42}"#;
        let verdict = router().route(msg, RouteScope::Shared);
        assert_eq!(
            verdict,
            Verdict::Deliver(Routed::LiveCounts(vec![LocationCount {
                location_id: "women_region".into(),
                timeframe: Timeframe::Hourly,
                count: 42,
            }]))
        );
    }

    #[test]
    fn test_drops_stale_timeframe() {
        let msg = r#"{"type": "live_count_update", "location_id": "women_region",
                      "timeframe": "DAILY", "live_count": 7}"#;
        assert!(matches!(
            router().route(msg, RouteScope::Shared),
            Verdict::Dropped(DropReason::StaleTimeframe { got: Timeframe::Daily, .. })
        ));
    }

    #[test]
    fn test_drops_untracked_location_and_foreign_worker() {
        let r = router();
        let untracked = r#"{"type": "live_count_update", "location_id": "east", "live_count": 1}"#;
        assert!(matches!(
            r.route(untracked, RouteScope::Shared),
            Verdict::Dropped(DropReason::UntrackedLocation(_))
        ));

        let foreign = r#"{"type": "live_count_update", "location_id": "women_region",
                          "worker_id": "worker-0", "live_count": 1}"#;
        assert!(matches!(
            r.route(foreign, RouteScope::Shared),
            Verdict::Dropped(DropReason::ForeignWorker(_))
        ));
    }

    #[test]
    fn test_drops_unrecognised_timeframe() {
        let msg = r#"{"type": "live_count_update", "location_id": "women_region",
                      "timeframe": "YEARLY", "live_count": 900}"#;
        assert_eq!(
            router().route(msg, RouteScope::Shared),
            Verdict::Dropped(DropReason::UnknownTimeframe("YEARLY".into()))
        );

        let reset = r#"{"type": "timeframe_reset", "timeframe": "FORTNIGHTLY"}"#;
        assert_eq!(
            router().route(reset, RouteScope::Shared),
            Verdict::Dropped(DropReason::UnknownTimeframe("FORTNIGHTLY".into()))
        );
    }

    #[test]
    fn test_progressive_frames() {
        let r = router();
        let sample = r#"{"type": "progressive_sample", "location_id": "women_region",
                         "timeframe": "HOURLY", "cumulative_count": 14, "current_count": 3,
                         "sample_index": 2, "total_samples": 8}"#;
        assert_eq!(
            r.route(sample, RouteScope::Shared),
            Verdict::Deliver(Routed::ProgressiveSample {
                location_id: "women_region".into(),
                timeframe: Timeframe::Hourly,
                count: 14,
                sample_index: Some(2),
                total_samples: Some(8),
            })
        );

        let current_only = r#"{"type": "progressive_sample", "location_id": "women_region",
                               "current_count": 5}"#;
        assert!(matches!(
            r.route(current_only, RouteScope::Shared),
            Verdict::Deliver(Routed::ProgressiveSample { count: 5, sample_index: None, .. })
        ));

        let done = r#"{"type": "progressive_loading_complete", "location_id": "women_region",
                       "final_count": 20, "cumulative_count": 18}"#;
        assert_eq!(
            r.route(done, RouteScope::Shared),
            Verdict::Deliver(Routed::ProgressiveComplete {
                location_id: "women_region".into(),
                timeframe: Timeframe::Hourly,
                final_count: 20,
            })
        );
        let done_cumulative = r#"{"type": "progressive_loading_complete",
                                  "location_id": "women_region", "cumulative_count": 18}"#;
        assert!(matches!(
            r.route(done_cumulative, RouteScope::Shared),
            Verdict::Deliver(Routed::ProgressiveComplete { final_count: 18, .. })
        ));
    }

    #[test]
    fn test_chart_point_field_fallback() {
        let r = router();
        let data_point = r#"{"type": "chart_data_point", "location_id": "women_region",
                             "data_point": {"timestamp": "10:05", "count": 4}}"#;
        assert_eq!(
            r.route(data_point, RouteScope::Shared),
            Verdict::Deliver(Routed::ChartPoint {
                location_id: "women_region".into(),
                timeframe: Timeframe::Hourly,
                point: RawPoint::new("10:05", 4),
            })
        );

        let point = r#"{"type": "chart_data_point", "location_id": "women_region",
                        "point": {"time": "10:10", "value": 6}}"#;
        assert!(matches!(
            r.route(point, RouteScope::Shared),
            Verdict::Deliver(Routed::ChartPoint { point, .. }) if point == RawPoint::new("10:10", 6)
        ));

        let empty = r#"{"type": "chart_data_point", "location_id": "women_region"}"#;
        assert_eq!(
            r.route(empty, RouteScope::Shared),
            Verdict::Dropped(DropReason::Incomplete("data_point"))
        );
    }

    #[test]
    fn test_timeframe_reset_scope() {
        let r = router();
        let everyone = r#"{"type": "timeframe_reset", "timeframe": "HOURLY"}"#;
        assert_eq!(
            r.route(everyone, RouteScope::Shared),
            Verdict::Deliver(Routed::TimeframeReset {
                location_id: None,
                timeframe: Timeframe::Hourly,
            })
        );

        let aggregate = r#"{"type": "timeframe_reset", "location_id": "all", "timeframe": "DAILY"}"#;
        assert!(matches!(
            r.route(aggregate, RouteScope::Shared),
            Verdict::Deliver(Routed::TimeframeReset { location_id: None, timeframe: Timeframe::Daily })
        ));

        let one = r#"{"type": "timeframe_reset", "timeframe": "HOURLY"}"#;
        assert_eq!(
            r.route(one, RouteScope::Location("northern-gate")),
            Verdict::Deliver(Routed::TimeframeReset {
                location_id: Some("northern-gate".into()),
                timeframe: Timeframe::Hourly,
            })
        );

        let untracked = r#"{"type": "timeframe_reset", "location_id": "east", "timeframe": "HOURLY"}"#;
        assert!(matches!(
            r.route(untracked, RouteScope::Shared),
            Verdict::Dropped(DropReason::UntrackedLocation(_))
        ));
        assert_eq!(
            r.route(r#"{"type": "timeframe_reset"}"#, RouteScope::Shared),
            Verdict::Dropped(DropReason::Incomplete("timeframe"))
        );
    }

    #[test]
    fn test_dedicated_scope_rejects_other_locations() {
        let msg = r#"{"type": "live_count_update", "location_id": "women_region", "live_count": 3}"#;
        assert!(matches!(
            router().route(msg, RouteScope::Location("northern-gate")),
            Verdict::Dropped(DropReason::UntrackedLocation(_))
        ));
    }

    #[test]
    fn test_aggregate_frame_uses_label_map() {
        let mut r = router();
        r.track("all", Timeframe::Hourly);
        let msg = r#"{
            "type": "live_count_update",
            "location_id": "all",
            "timeframe": "HOURLY",
            "data": {
                "total_count": 30,
                "total_all_time": 900,
                "men_inspection": {"live": 12, "total": 400},
                "women_region": {"live": 18, "total": 500}
            }
        }"#;

        let Verdict::Deliver(Routed::LiveCounts(mut counts)) = r.route(msg, RouteScope::Shared)
        else {
            panic!("aggregate frame should deliver");
        };
        counts.sort_by(|a, b| a.location_id.cmp(&b.location_id));
        let got: Vec<(&str, u64)> = counts
            .iter()
            .map(|c| (c.location_id.as_str(), c.count))
            .collect();
        // men_region is mapped but not tracked
        assert_eq!(got, vec![("all", 30), ("northern-gate", 12), ("women_region", 18)]);
    }

    #[test]
    fn test_malformed_and_unknown_frames() {
        let r = router();
        assert!(matches!(r.route("{oops", RouteScope::Shared), Verdict::Malformed(_)));
        assert_eq!(
            r.route(r#"{"type": "brand_new_kind"}"#, RouteScope::Shared),
            Verdict::Ignored("brand_new_kind".into())
        );
    }

    #[test]
    fn test_chart_batch_and_warning() {
        let r = router();
        let batch = r#"{"type": "chart_data_response", "location_id": "women_region",
                        "chart_data": [{"timestamp": "10:00", "count": 3}, 5, {"value": -2}]}"#;
        let Verdict::Deliver(Routed::ChartBatch { points, .. }) = r.route(batch, RouteScope::Shared)
        else {
            panic!("chart batch should deliver");
        };
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].timestamp, "10:00");
        assert_eq!(points[1].value, 5);
        assert_eq!(points[2].value, -2);

        let warning = r#"{"type": "connection_warning", "message": "slow consumer", "warning_code": "LAG"}"#;
        assert_eq!(
            r.route(warning, RouteScope::Shared),
            Verdict::Deliver(Routed::Warning(ServerNotice {
                code: "LAG".into(),
                message: "slow consumer".into(),
                severity: Some("warning".into()),
            }))
        );
    }
}
