//! Connection manager
//!
//! One `ConnectionManager` is built at startup and owns every channel, the
//! subscription registry, the router, the reconciler, chart state and the
//! update buffer. Drivers feed it socket events and clock ticks; it talks back
//! through the [`Transport`] trait and publishes [`DashboardEvent`]s.
//!
//! Nothing in here blocks or spawns. Drivers for tokio and the browser live in
//! `websocket_native` and `websocket_wasm`; tests drive it with a fake
//! transport and literal timestamps.

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info, trace, warn};

use crate::buffer::UpdateBuffer;
use crate::cache::{CachedCount, CountStore};
use crate::config::{ChannelMode, Settings};
use crate::connection::{Command, Connection, Lifecycle};
use crate::core::{
    ChartSeries, ChartStore, ClientFrame, CountReconciler, CountUpdate, LocationId, Pattern,
    RawPoint, RouteScope, Routed, Router, ServerNotice, Timeframe, UpdateSource, Verdict,
};
use crate::error::{Error, Result};
use crate::events::{DashboardEvent, EventBus, CAMERA_HEALTH_DEGRADED};
use crate::registry::{
    SubscriptionHandle, SubscriptionKey, SubscriptionOptions, SubscriptionRegistry,
};
use crate::time::Millis;
use crate::ws_state::{ChannelKey, ConnectionState, ConnectionStatus, HealthReport, SocketId};

/// Socket operations the manager needs from a platform driver.
///
/// Implementations must not call back into the manager synchronously; results
/// of `open` and inbound traffic arrive later as [`SocketEvent`]s.
pub trait Transport {
    fn open(&mut self, channel: &ChannelKey, socket: SocketId, url: &str) -> Result<()>;

    fn send(&mut self, channel: &ChannelKey, socket: SocketId, text: &str) -> Result<()>;

    fn close(&mut self, channel: &ChannelKey, socket: SocketId);
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketEventKind {
    Opened,
    Message(String),
    Error(String),
    Closed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SocketEvent {
    pub channel: ChannelKey,
    pub socket: SocketId,
    pub kind: SocketEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationSnapshot {
    pub location_id: LocationId,
    pub timeframe: Timeframe,
    pub count: u64,
    pub cumulative_count: u64,
    pub timeframe_count: u64,
    pub has_received_data: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSnapshot {
    pub channel: ChannelKey,
    pub status: ConnectionStatus,
    pub health: HealthReport,
}

/// Read-only view for rendering.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DashboardSnapshot {
    pub locations: Vec<LocationSnapshot>,
    pub channels: Vec<ChannelSnapshot>,
}

struct Channel {
    conn: Connection,
    last_status: Option<ConnectionStatus>,
}

struct Watch {
    timeframe: Timeframe,
    handles: Vec<SubscriptionHandle>,
}

pub struct ConnectionManager<T: Transport> {
    settings: Settings,
    transport: T,
    channels: BTreeMap<ChannelKey, Channel>,
    registry: SubscriptionRegistry,
    router: Router,
    reconciler: CountReconciler,
    charts: ChartStore,
    buffer: UpdateBuffer<CountUpdate>,
    events: EventBus,
    cache: Option<Box<dyn CountStore>>,
    watched: BTreeMap<LocationId, Watch>,
    running: bool,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(settings: Settings, transport: T) -> Self {
        let router = Router::new(new_instance_id(), settings.label_map());
        let charts = ChartStore::new(
            settings.chart.downsample_strategy(),
            settings.chart.raw_history,
        );
        let buffer = UpdateBuffer::new(settings.buffer);

        Self {
            settings,
            transport,
            channels: BTreeMap::new(),
            registry: SubscriptionRegistry::new(),
            router,
            reconciler: CountReconciler::new(),
            charts,
            buffer,
            events: EventBus::new(),
            cache: None,
            watched: BTreeMap::new(),
            running: false,
        }
    }

    /// Attach a count cache. Watched locations are pre-populated from it.
    pub fn with_cache(mut self, store: impl CountStore + 'static) -> Self {
        self.cache = Some(Box::new(store));
        self
    }

    pub fn instance_id(&self) -> &str {
        self.router.instance_id()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn events(&mut self) -> &mut EventBus {
        &mut self.events
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn start(&mut self, now: Millis) {
        if self.running {
            return;
        }
        self.running = true;
        info!(
            url = %self.settings.connection.url,
            mode = ?self.settings.connection.mode,
            instance = self.instance_id(),
            "Starting connection manager"
        );

        if self.settings.connection.mode == ChannelMode::Multiplexed {
            self.ensure_channel(&ChannelKey::Shared, now);
        }
        for key in self.channel_keys() {
            let cmds = match self.channels.get_mut(&key) {
                Some(ch) => ch.conn.connect(now),
                None => continue,
            };
            self.execute(&key, cmds, now);
        }
    }

    /// Close every channel, publish pending updates and persist the cache.
    pub fn stop(&mut self, now: Millis) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        self.running = false;
        info!("Stopping connection manager");

        for key in self.channel_keys() {
            let cmds = match self.channels.get_mut(&key) {
                Some(ch) => ch.conn.disconnect(now),
                None => continue,
            };
            self.execute(&key, cmds, now);
        }
        self.flush(now);

        if let Some(cache) = &self.cache {
            cache.persist()?;
        }
        Ok(())
    }

    /// Manually restart a channel, including one that has fallen back.
    pub fn reconnect(&mut self, channel: &ChannelKey, now: Millis) -> Result<()> {
        let ch = self
            .channels
            .get_mut(channel)
            .ok_or_else(|| Error::UnknownChannel(channel.clone()))?;
        let cmds = ch.conn.reset(now);
        self.execute(channel, cmds, now);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Register one pattern subscription. Idempotent per
    /// (location, timeframe, pattern).
    pub fn subscribe(
        &mut self,
        location_id: &str,
        timeframe: Timeframe,
        pattern: Pattern,
        options: SubscriptionOptions,
        now: Millis,
    ) -> SubscriptionHandle {
        let key = SubscriptionKey::new(location_id, timeframe, pattern);
        let channel = self.channel_for(&key);
        if self.router.selected_timeframe(location_id).is_none() {
            self.router.track(location_id, timeframe);
        }

        let (handle, frame) = self.registry.subscribe(key, options);
        self.ensure_channel(&channel, now);
        if let Some(frame) = frame {
            let cmds = self.send_now(&channel, &frame, now);
            self.execute(&channel, cmds, now);
        }
        handle
    }

    pub fn unsubscribe(&mut self, handle: SubscriptionHandle, now: Millis) -> Result<()> {
        let (key, frame) = self.registry.unsubscribe(handle)?;
        let channel = self.channel_for(&key);
        let cmds = self.send_now(&channel, &frame, now);
        self.execute(&channel, cmds, now);

        for watch in self.watched.values_mut() {
            watch.handles.retain(|h| *h != handle);
        }
        self.release_if_idle(&channel, now);
        Ok(())
    }

    /// Start showing a location: live counts, and charts when configured.
    /// Watching an already watched location at another timeframe switches it.
    pub fn watch_location(
        &mut self,
        location_id: &str,
        timeframe: Timeframe,
        now: Millis,
    ) -> Vec<SubscriptionHandle> {
        if let Some(watch) = self.watched.get(location_id) {
            if watch.timeframe != timeframe {
                self.set_timeframe(location_id, timeframe, now);
            }
            return self
                .watched
                .get(location_id)
                .map(|w| w.handles.clone())
                .unwrap_or_default();
        }

        info!(location = location_id, %timeframe, "Watching location");
        self.router.track(location_id, timeframe);
        self.restore_from_cache(location_id, timeframe, now);
        let handles = self.subscribe_watch(location_id, timeframe, now);
        self.watched.insert(
            location_id.to_string(),
            Watch {
                timeframe,
                handles: handles.clone(),
            },
        );
        handles
    }

    pub fn unwatch_location(&mut self, location_id: &str, now: Millis) -> Result<()> {
        let Some(watch) = self.watched.remove(location_id) else {
            return Ok(());
        };
        for handle in watch.handles {
            self.unsubscribe(handle, now)?;
        }
        self.buffer.discard(location_id);
        self.router.untrack(location_id);
        self.reconciler.forget(location_id);
        self.charts.remove_location(location_id);
        info!(location = location_id, "Stopped watching location");
        Ok(())
    }

    /// Move a watched location to another timeframe: unsubscribe the old
    /// scope, then subscribe the new one.
    pub fn set_timeframe(&mut self, location_id: &str, timeframe: Timeframe, now: Millis) {
        let old = match self.watched.get(location_id) {
            Some(w) if w.timeframe == timeframe => return,
            Some(w) => w.handles.clone(),
            None => {
                self.watch_location(location_id, timeframe, now);
                return;
            }
        };

        info!(location = location_id, %timeframe, "Changing timeframe");
        for handle in old {
            if let Err(e) = self.unsubscribe(handle, now) {
                debug!(error = %e, "Subscription already gone");
            }
        }

        // A pending count belongs to the old timeframe
        self.buffer.discard(location_id);
        self.router.track(location_id, timeframe);
        self.reconciler.switch_timeframe(location_id, timeframe);
        self.events.emit(&DashboardEvent::TimeframeReset {
            location_id: Some(location_id.to_string()),
            timeframe,
        });
        self.restore_from_cache(location_id, timeframe, now);

        let handles = self.subscribe_watch(location_id, timeframe, now);
        self.watched.insert(
            location_id.to_string(),
            Watch { timeframe, handles },
        );
    }

    /// Move every watched location to `timeframe` and tell the shared channel.
    pub fn set_global_timeframe(&mut self, timeframe: Timeframe, now: Millis) {
        self.settings.timeframe = timeframe;
        let locations: Vec<LocationId> = self.watched.keys().cloned().collect();
        for location in locations {
            self.set_timeframe(&location, timeframe, now);
        }

        if self.settings.connection.mode == ChannelMode::Multiplexed {
            let cmds = self.send_now(&ChannelKey::Shared, &ClientFrame::SetTimeframe { timeframe }, now);
            self.execute(&ChannelKey::Shared, cmds, now);
        }
    }

    // ------------------------------------------------------------------
    // Seeding
    // ------------------------------------------------------------------

    /// Pre-populate a count from the query API. Never lowers live state.
    pub fn seed_count(
        &mut self,
        location_id: &str,
        timeframe: Timeframe,
        count: u64,
        now: Millis,
    ) -> CountUpdate {
        let update =
            self.reconciler
                .restore(location_id, timeframe, count, count, now, UpdateSource::Seed);
        self.record_cache(&update);
        self.stage(update.clone(), now);
        update
    }

    pub fn seed_chart(&mut self, location_id: &str, timeframe: Timeframe, points: Vec<RawPoint>) {
        let series = self.charts.replace(location_id, timeframe, points).clone();
        self.emit_chart(location_id, timeframe, series);
    }

    // ------------------------------------------------------------------
    // Driver inputs
    // ------------------------------------------------------------------

    pub fn handle_socket_event(&mut self, event: SocketEvent, now: Millis) -> Result<()> {
        let SocketEvent {
            channel,
            socket,
            kind,
        } = event;
        let ch = self
            .channels
            .get_mut(&channel)
            .ok_or_else(|| Error::UnknownChannel(channel.clone()))?;

        let cmds = match kind {
            SocketEventKind::Opened => ch.conn.on_open(socket, now),
            SocketEventKind::Error(msg) => ch.conn.on_error(socket, &msg, now),
            SocketEventKind::Closed { reason } => ch.conn.on_close(socket, &reason, now),
            SocketEventKind::Message(text) => {
                if !ch.conn.on_frame(socket, now) {
                    trace!(%channel, %socket, "Frame from stale socket");
                    return Ok(());
                }
                self.on_message(&channel, &text, now);
                return Ok(());
            }
        };
        self.execute(&channel, cmds, now);
        Ok(())
    }

    /// Drive heartbeats, reconnect timers and the update buffer.
    pub fn tick(&mut self, now: Millis) {
        for key in self.channel_keys() {
            let cmds = match self.channels.get_mut(&key) {
                Some(ch) => ch.conn.tick(now),
                None => continue,
            };
            self.execute(&key, cmds, now);
        }
        if let Some(batch) = self.buffer.poll(now) {
            self.publish(batch);
        }
    }

    /// Earliest time `tick` has work to do.
    pub fn next_deadline(&self) -> Option<Millis> {
        self.channels
            .values()
            .filter_map(|ch| ch.conn.next_deadline())
            .chain(self.buffer.next_deadline())
            .min()
    }

    /// Publish everything the buffer holds.
    pub fn flush(&mut self, now: Millis) {
        let batch = self.buffer.flush(now);
        self.publish(batch);
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn status(&self, channel: &ChannelKey) -> Option<ConnectionStatus> {
        self.channels.get(channel).map(|ch| ch.conn.status())
    }

    pub fn health(&self, channel: &ChannelKey, now: Millis) -> Result<HealthReport> {
        self.channels
            .get(channel)
            .map(|ch| ch.conn.health(now))
            .ok_or_else(|| Error::UnknownChannel(channel.clone()))
    }

    pub fn display_count(&self, location_id: &str) -> u64 {
        self.reconciler.display_count(location_id)
    }

    pub fn chart(&self, location_id: &str, timeframe: Timeframe) -> Option<&ChartSeries> {
        self.charts.get(location_id, timeframe)
    }

    pub fn channels(&self) -> impl Iterator<Item = &ChannelKey> {
        self.channels.keys()
    }

    pub fn snapshot(&self, now: Millis) -> DashboardSnapshot {
        let locations = self
            .watched
            .iter()
            .map(|(id, watch)| {
                let state = self.reconciler.state(id);
                LocationSnapshot {
                    location_id: id.clone(),
                    timeframe: watch.timeframe,
                    count: state.map_or(0, |s| s.display_count()),
                    cumulative_count: state.map_or(0, |s| s.cumulative_count()),
                    timeframe_count: state.map_or(0, |s| s.timeframe_count(watch.timeframe)),
                    has_received_data: state.is_some_and(|s| s.has_received_data()),
                }
            })
            .collect();

        let channels = self
            .channels
            .iter()
            .map(|(key, ch)| ChannelSnapshot {
                channel: key.clone(),
                status: ch.conn.status(),
                health: ch.conn.health(now),
            })
            .collect();

        DashboardSnapshot {
            locations,
            channels,
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn channel_keys(&self) -> Vec<ChannelKey> {
        self.channels.keys().cloned().collect()
    }

    fn channel_for(&self, key: &SubscriptionKey) -> ChannelKey {
        channel_for(self.settings.connection.mode, key)
    }

    fn subscribe_watch(
        &mut self,
        location_id: &str,
        timeframe: Timeframe,
        now: Millis,
    ) -> Vec<SubscriptionHandle> {
        let subs = self.settings.subscriptions.clone();
        let mut handles = vec![self.subscribe(
            location_id,
            timeframe,
            Pattern::LiveCount,
            subs.live_count,
            now,
        )];
        if subs.request_charts {
            handles.push(self.subscribe(
                location_id,
                timeframe,
                Pattern::ChartData,
                subs.chart_data,
                now,
            ));
        }
        handles
    }

    /// Create a channel on first use, connecting it if the manager runs.
    fn ensure_channel(&mut self, channel: &ChannelKey, now: Millis) {
        if self.channels.contains_key(channel) {
            return;
        }
        debug!(%channel, "Creating channel");
        let mut conn = Connection::new(
            self.settings.connection.backoff,
            self.settings.connection.heartbeat,
        );
        let cmds = if self.running {
            conn.connect(now)
        } else {
            Vec::new()
        };
        self.channels.insert(
            channel.clone(),
            Channel {
                conn,
                last_status: None,
            },
        );
        self.execute(channel, cmds, now);
    }

    /// Per-location channels close once nothing is subscribed on them.
    fn release_if_idle(&mut self, channel: &ChannelKey, now: Millis) {
        if *channel == ChannelKey::Shared {
            return;
        }
        let mode = self.settings.connection.mode;
        if self.registry.keys().any(|k| channel_for(mode, k) == *channel) {
            return;
        }
        if let Some(mut ch) = self.channels.remove(channel) {
            debug!(%channel, "Releasing idle channel");
            for cmd in ch.conn.disconnect(now) {
                if let Command::Close(socket) = cmd {
                    self.transport.close(channel, socket);
                }
            }
        }
    }

    /// Send on the channel's open socket. Frames for a channel that is not
    /// open are dropped here; the registry replays them on the next open.
    fn send_now(&mut self, channel: &ChannelKey, frame: &ClientFrame, now: Millis) -> Vec<Command> {
        let Some(ch) = self.channels.get_mut(channel) else {
            return Vec::new();
        };
        let ConnectionState::Open { socket, .. } = ch.conn.state() else {
            trace!(%channel, "Channel not open, frame deferred");
            return Vec::new();
        };

        let text = match frame.to_text() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to encode frame");
                return Vec::new();
            }
        };
        trace!(%channel, frame = %text, "Send");
        match self.transport.send(channel, socket, &text) {
            Ok(()) => Vec::new(),
            Err(e) => {
                warn!(%channel, error = %e, "Send failed");
                ch.conn.on_error(socket, &e.to_string(), now)
            }
        }
    }

    fn execute(&mut self, channel: &ChannelKey, cmds: Vec<Command>, now: Millis) {
        let mut queue: VecDeque<Command> = cmds.into();
        while let Some(cmd) = queue.pop_front() {
            match cmd {
                Command::Open(socket) => {
                    self.emit_status(channel);
                    let url = self.settings.connection.url.clone();
                    if let Err(e) = self.transport.open(channel, socket, &url) {
                        if let Some(ch) = self.channels.get_mut(channel) {
                            queue.extend(ch.conn.on_error(socket, &e.to_string(), now));
                        }
                    }
                }
                Command::Close(socket) => self.transport.close(channel, socket),
                Command::SendPing => queue.extend(self.send_now(channel, &ClientFrame::Ping, now)),
                Command::Resubscribe => {
                    let mode = self.settings.connection.mode;
                    let frames = self
                        .registry
                        .replay_frames_where(|k| channel_for(mode, k) == *channel);
                    info!(%channel, subscriptions = frames.len(), "Replaying subscriptions");
                    for frame in frames {
                        queue.extend(self.send_now(channel, &frame, now));
                    }
                }
                Command::Emit(lifecycle) => self.on_lifecycle(channel, lifecycle),
            }
        }
    }

    fn on_lifecycle(&mut self, channel: &ChannelKey, lifecycle: Lifecycle) {
        match lifecycle {
            Lifecycle::Connected => info!(%channel, "Channel connected"),
            Lifecycle::Disconnected { reason } => info!(%channel, %reason, "Channel disconnected"),
            Lifecycle::Reconnecting { attempt, delay_ms } => {
                debug!(%channel, attempt, delay_ms, "Channel waiting to reconnect")
            }
            Lifecycle::Error(message) => {
                self.events.emit(&DashboardEvent::TransportError {
                    channel: channel.clone(),
                    message,
                });
            }
            Lifecycle::Fallback => {
                warn!(%channel, "Channel fell back, live data unavailable");
                self.events.emit(&DashboardEvent::Fallback {
                    channel: channel.clone(),
                });
            }
        }
        self.emit_status(channel);
    }

    /// Emit the channel's status if it changed since the last emission.
    fn emit_status(&mut self, channel: &ChannelKey) {
        let Some(ch) = self.channels.get_mut(channel) else {
            return;
        };
        let status = ch.conn.status();
        if ch.last_status == Some(status) {
            return;
        }
        ch.last_status = Some(status);
        self.events.emit(&DashboardEvent::Status {
            channel: channel.clone(),
            status,
        });
    }

    fn on_message(&mut self, channel: &ChannelKey, text: &str, now: Millis) {
        let scope = match channel {
            ChannelKey::Shared => RouteScope::Shared,
            ChannelKey::Location { location_id, .. } => RouteScope::Location(location_id),
        };
        match self.router.route(text, scope) {
            Verdict::Deliver(routed) => self.apply(channel, routed, now),
            Verdict::Dropped(_) | Verdict::Ignored(_) | Verdict::Malformed(_) => {}
        }
    }

    fn apply(&mut self, channel: &ChannelKey, routed: Routed, now: Millis) {
        match routed {
            Routed::LiveCounts(counts) => {
                for c in counts {
                    let update = self.reconciler.apply(&c.location_id, c.timeframe, c.count, now);
                    self.record_cache(&update);
                    self.stage(update, now);
                }
            }
            Routed::ChartPoint {
                location_id,
                timeframe,
                point,
            } => {
                let series = self.charts.push_point(&location_id, timeframe, point).clone();
                self.emit_chart(&location_id, timeframe, series);
            }
            Routed::ChartBatch {
                location_id,
                timeframe,
                points,
            } => {
                let series = self.charts.replace(&location_id, timeframe, points).clone();
                self.emit_chart(&location_id, timeframe, series);
            }
            Routed::ProgressiveSample {
                location_id,
                timeframe,
                count,
                sample_index,
                total_samples,
            } => {
                let update = self.reconciler.apply_progressive(
                    &location_id,
                    timeframe,
                    count,
                    sample_index,
                    total_samples,
                    now,
                );
                self.publish(vec![update]);
            }
            Routed::ProgressiveComplete {
                location_id,
                timeframe,
                final_count,
            } => {
                let update =
                    self.reconciler
                        .complete_progressive(&location_id, timeframe, final_count, now);
                self.record_cache(&update);
                self.publish(vec![update]);
            }
            Routed::TimeframeReset {
                location_id,
                timeframe,
            } => {
                let targets: Vec<LocationId> = match &location_id {
                    Some(l) => vec![l.clone()],
                    None => self
                        .router
                        .tracked()
                        .filter(|(_, tf)| *tf == timeframe)
                        .map(|(l, _)| l.to_string())
                        .collect(),
                };
                for target in &targets {
                    if self.router.selected_timeframe(target) == Some(timeframe) {
                        self.buffer.discard(target);
                    }
                    self.reconciler.reset_epoch(target, timeframe);
                }
                info!(locations = targets.len(), %timeframe, "Timeframe reset by server");
                self.events.emit(&DashboardEvent::TimeframeReset {
                    location_id,
                    timeframe,
                });
            }
            Routed::Ack { wire_kind } => debug!(%channel, kind = %wire_kind, "Subscription acknowledged"),
            Routed::Ping => {
                let cmds = self.send_now(channel, &ClientFrame::Pong, now);
                self.execute(channel, cmds, now);
            }
            Routed::Pong => trace!(%channel, "Pong"),
            Routed::CameraHealth(health) => {
                let degraded = health.is_degraded().then(|| ServerNotice {
                    code: CAMERA_HEALTH_DEGRADED.to_string(),
                    message: format!(
                        "{}/{} cameras healthy ({:.0}%)",
                        health.healthy, health.total, health.percentage
                    ),
                    severity: Some("warning".to_string()),
                });
                self.events.emit(&DashboardEvent::CameraHealth(health));
                if let Some(notice) = degraded {
                    warn!(message = %notice.message, "Camera health degraded");
                    self.events.emit(&DashboardEvent::Warning(notice));
                }
            }
            Routed::ServerError(notice) => {
                warn!(code = %notice.code, message = %notice.message, "Server error");
                self.events.emit(&DashboardEvent::ServerError(notice));
            }
            Routed::Warning(notice) => {
                warn!(code = %notice.code, message = %notice.message, "Server warning");
                self.events.emit(&DashboardEvent::Warning(notice));
            }
        }
    }

    fn stage(&mut self, update: CountUpdate, now: Millis) {
        let key = update.location_id.clone();
        if let Some(batch) = self.buffer.push(&key, update, now) {
            self.publish(batch);
        }
    }

    fn publish(&mut self, updates: Vec<CountUpdate>) {
        if updates.is_empty() {
            return;
        }
        self.events.emit(&DashboardEvent::Counts { updates });
    }

    fn emit_chart(&mut self, location_id: &str, timeframe: Timeframe, series: ChartSeries) {
        self.events.emit(&DashboardEvent::Chart {
            location_id: location_id.to_string(),
            timeframe,
            series,
        });
    }

    fn record_cache(&mut self, update: &CountUpdate) {
        if let Some(cache) = self.cache.as_mut() {
            cache.record(&update.location_id, update.timeframe, CachedCount::from(update));
        }
    }

    fn restore_from_cache(&mut self, location_id: &str, timeframe: Timeframe, now: Millis) {
        let Some(entry) = self
            .cache
            .as_ref()
            .and_then(|c| c.latest(location_id, timeframe))
        else {
            return;
        };
        debug!(location = location_id, %timeframe, count = entry.cumulative_count, "Restored from cache");
        let update = self.reconciler.restore(
            location_id,
            timeframe,
            entry.cumulative_count,
            entry.timeframe_count,
            now,
            UpdateSource::Restored,
        );
        self.stage(update, now);
    }
}

fn channel_for(mode: ChannelMode, key: &SubscriptionKey) -> ChannelKey {
    match mode {
        ChannelMode::Multiplexed => ChannelKey::Shared,
        ChannelMode::PerLocation => ChannelKey::Location {
            location_id: key.location_id.clone(),
            timeframe: key.timeframe,
        },
    }
}

/// Random id distinguishing this manager from stale instances on the server.
fn new_instance_id() -> String {
    let mut bytes = [0u8; 6];
    match getrandom::getrandom(&mut bytes) {
        Ok(()) => {
            let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
            format!("worker-{hex}")
        }
        Err(e) => {
            warn!(error = %e, "No entropy for instance id, using clock");
            format!("worker-{}", crate::time::now_millis())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCountStore;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Clone, PartialEq)]
    enum Op {
        Open(ChannelKey, SocketId),
        Send(ChannelKey, String),
        Close(ChannelKey, SocketId),
    }

    #[derive(Default, Clone)]
    struct FakeTransport {
        ops: Rc<RefCell<Vec<Op>>>,
    }

    impl FakeTransport {
        fn take(&self) -> Vec<Op> {
            self.ops.borrow_mut().drain(..).collect()
        }

        fn sent(&self) -> Vec<serde_json::Value> {
            self.take()
                .into_iter()
                .filter_map(|op| match op {
                    Op::Send(_, text) => serde_json::from_str(&text).ok(),
                    _ => None,
                })
                .collect()
        }
    }

    impl Transport for FakeTransport {
        fn open(&mut self, channel: &ChannelKey, socket: SocketId, _url: &str) -> Result<()> {
            self.ops.borrow_mut().push(Op::Open(channel.clone(), socket));
            Ok(())
        }

        fn send(&mut self, channel: &ChannelKey, _socket: SocketId, text: &str) -> Result<()> {
            self.ops.borrow_mut().push(Op::Send(channel.clone(), text.to_string()));
            Ok(())
        }

        fn close(&mut self, channel: &ChannelKey, socket: SocketId) {
            self.ops.borrow_mut().push(Op::Close(channel.clone(), socket));
        }
    }

    fn settings(mode: ChannelMode) -> Settings {
        let mut s = Settings::default();
        s.connection.mode = mode;
        s.subscriptions.request_charts = false;
        s.buffer.enabled = false;
        s
    }

    fn open_all(m: &mut ConnectionManager<FakeTransport>, fake: &FakeTransport, now: Millis) {
        for op in fake.take() {
            if let Op::Open(channel, socket) = op {
                let event = SocketEvent {
                    channel,
                    socket,
                    kind: SocketEventKind::Opened,
                };
                m.handle_socket_event(event, now).unwrap();
            }
        }
    }

    fn message(channel: ChannelKey, text: &str) -> SocketEvent {
        SocketEvent {
            channel,
            socket: SocketId(1),
            kind: SocketEventKind::Message(text.to_string()),
        }
    }

    #[test]
    fn test_per_location_channels_follow_timeframe() {
        let fake = FakeTransport::default();
        let mut m = ConnectionManager::new(settings(ChannelMode::PerLocation), fake.clone());
        m.start(0);
        m.watch_location("gate", Timeframe::Hourly, 0);
        open_all(&mut m, &fake, 1);

        let hourly = ChannelKey::Location {
            location_id: "gate".into(),
            timeframe: Timeframe::Hourly,
        };
        assert_eq!(m.status(&hourly), Some(ConnectionStatus::Connected));
        let sent = fake.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["timeframe"], "HOURLY");

        m.set_timeframe("gate", Timeframe::Daily, 2);
        let ops = fake.take();
        assert!(matches!(&ops[0], Op::Send(c, t) if *c == hourly && t.contains("unsubscribe_pattern")));
        assert!(ops.contains(&Op::Close(hourly.clone(), SocketId(1))));
        assert!(ops.iter().any(|op| matches!(op, Op::Open(ChannelKey::Location { timeframe: Timeframe::Daily, .. }, _))));
        assert_eq!(m.status(&hourly), None);
    }

    #[test]
    fn test_server_ping_answered_with_pong() {
        let fake = FakeTransport::default();
        let mut m = ConnectionManager::new(settings(ChannelMode::Multiplexed), fake.clone());
        m.start(0);
        open_all(&mut m, &fake, 1);

        m.handle_socket_event(message(ChannelKey::Shared, r#"{"type": "ping"}"#), 2)
            .unwrap();
        assert_eq!(fake.sent(), vec![serde_json::json!({"action": "pong"})]);
    }

    #[test]
    fn test_camera_health_degraded_emits_warning() {
        let fake = FakeTransport::default();
        let mut m = ConnectionManager::new(settings(ChannelMode::Multiplexed), fake.clone());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        m.events().subscribe(move |e| {
            if let DashboardEvent::Warning(n) = e {
                sink.borrow_mut().push(n.code.clone());
            }
        });
        m.start(0);
        m.watch_location("gate", Timeframe::Daily, 0);
        open_all(&mut m, &fake, 1);

        let frame = r#"{"type": "camera_health_update", "location_id": "gate",
                        "healthy_cameras": 1, "total_cameras": 4, "health_percentage": 25.0}"#;
        m.handle_socket_event(message(ChannelKey::Shared, frame), 2).unwrap();
        assert_eq!(*seen.borrow(), vec![CAMERA_HEALTH_DEGRADED.to_string()]);
    }

    #[test]
    fn test_cache_restores_on_watch() {
        let mut store = MemoryCountStore::default();
        store.record(
            "gate",
            Timeframe::Daily,
            CachedCount {
                count: 12,
                cumulative_count: 12,
                timeframe_count: 12,
                timestamp: 0,
            },
        );
        let mut m = ConnectionManager::new(settings(ChannelMode::Multiplexed), FakeTransport::default())
            .with_cache(store);

        m.watch_location("gate", Timeframe::Daily, 5);
        assert_eq!(m.display_count("gate"), 12);

        // Live data below the cached value does not pull the display down
        m.start(6);
        let fake = m.transport().clone();
        open_all(&mut m, &fake, 7);
        let frame = r#"{"type": "live_count_update", "location_id": "gate", "timeframe": "DAILY", "live_count": 3}"#;
        m.handle_socket_event(message(ChannelKey::Shared, frame), 8).unwrap();
        assert_eq!(m.display_count("gate"), 12);
    }

    #[test]
    fn test_global_timeframe_sends_set_timeframe() {
        let fake = FakeTransport::default();
        let mut m = ConnectionManager::new(settings(ChannelMode::Multiplexed), fake.clone());
        m.start(0);
        m.watch_location("gate", Timeframe::Daily, 0);
        open_all(&mut m, &fake, 1);
        fake.take();

        m.set_global_timeframe(Timeframe::Weekly, 2);
        let actions: Vec<String> = fake
            .sent()
            .iter()
            .map(|f| f["action"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(
            actions,
            vec!["unsubscribe_pattern", "subscribe_pattern", "set_timeframe"]
        );
        assert_eq!(m.snapshot(3).locations[0].timeframe, Timeframe::Weekly);
    }

    #[test]
    fn test_unknown_channel_is_an_error() {
        let mut m = ConnectionManager::new(settings(ChannelMode::Multiplexed), FakeTransport::default());
        let err = m
            .handle_socket_event(message(ChannelKey::Shared, "{}"), 0)
            .unwrap_err();
        assert!(matches!(err, Error::UnknownChannel(ChannelKey::Shared)));
        assert!(m.instance_id().starts_with("worker-"));
    }
}
