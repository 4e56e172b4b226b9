//! Platform-agnostic core module - shared between the browser client and CLI

pub mod chart;
pub mod protocol;
pub mod reconciler;
pub mod router;

pub use chart::{
    ChartSeries, ChartStore, DownsampleStrategy, RawPoint, SeriesPoint, DEFAULT_MAX_POINTS,
    MIN_MAX_POINTS,
};
pub use protocol::{ClientFrame, Envelope, LocationId, MessageKind, Pattern, Timeframe, AGGREGATE_LOCATION};
pub use reconciler::{CountReconciler, CountUpdate, LocationCountState, UpdateSource};
pub use router::{
    CameraHealth, DropReason, LabelMap, LocationCount, RouteScope, Routed, Router, ServerNotice,
    Verdict,
};
