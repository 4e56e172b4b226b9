//! Connection lifecycle state machine
//!
//! Owns the reconnect/backoff/heartbeat policy of one channel without touching
//! a socket. Every input (`connect`, socket events, `tick`) takes the current
//! time and returns the [`Command`]s a driver must perform, so the whole
//! lifecycle is testable with literal timestamps and a fake transport.
//!
//! States: `Idle -> Connecting -> Open -> Backoff -> Connecting ... -> Failed`.
//! Each physical socket gets a fresh [`SocketId`]; events from an older socket
//! are ignored, which keeps a late `close` from tearing down its replacement.

use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::time::{elapsed, Millis};
use crate::ws_state::{ConnectionState, ConnectionStatus, HealthLevel, HealthReport, SocketId};

/// Reconnect delay after failed attempt `n` (0-based) is
/// `min(floor * factor^n, cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub floor_ms: Millis,
    pub factor: f64,
    pub cap_ms: Millis,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            floor_ms: 1_000,
            factor: 2.0,
            cap_ms: 30_000,
            max_attempts: 10,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for(&self, attempt: u32) -> Millis {
        let raw = self.floor_ms as f64 * self.factor.powi(attempt.min(i32::MAX as u32) as i32);
        if raw.is_finite() && raw < self.cap_ms as f64 {
            raw as Millis
        } else {
            self.cap_ms
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HeartbeatPolicy {
    /// Ping period while open
    pub interval_ms: Millis,
    /// Silence after which an open socket is considered stalled
    pub timeout_ms: Millis,
    /// Limit for a socket stuck in `Connecting`
    pub connect_timeout_ms: Millis,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            timeout_ms: 45_000,
            connect_timeout_ms: 10_000,
        }
    }
}

/// Lifecycle notifications for consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum Lifecycle {
    Connected,
    Disconnected { reason: String },
    Error(String),
    Reconnecting { attempt: u32, delay_ms: Millis },
    /// Retries exhausted. Emitted once per failure episode.
    Fallback,
}

/// Work the driver must do on behalf of the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Open(SocketId),
    Close(SocketId),
    SendPing,
    /// Replay every registered subscription on the fresh socket
    Resubscribe,
    Emit(Lifecycle),
}

#[derive(Debug)]
pub struct Connection {
    state: ConnectionState,
    backoff: BackoffPolicy,
    heartbeat: HeartbeatPolicy,
    /// Failed attempts since the last successful open
    attempts: u32,
    /// Failed attempts that preceded the current open socket
    retries_before_open: u32,
    next_socket: u64,
    last_activity: Millis,
    last_frame: Option<Millis>,
    last_ping: Millis,
    fallback_sent: bool,
}

impl Connection {
    pub fn new(backoff: BackoffPolicy, heartbeat: HeartbeatPolicy) -> Self {
        Self {
            state: ConnectionState::Idle,
            backoff,
            heartbeat,
            attempts: 0,
            retries_before_open: 0,
            next_socket: 0,
            last_activity: 0,
            last_frame: None,
            last_ping: 0,
            fallback_sent: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from(&self.state)
    }

    pub fn is_open(&self) -> bool {
        self.state.is_open()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Open a socket unless one is already open or connecting. A pending
    /// backoff is cut short. Does nothing once `Failed`; call [`reset`] first.
    ///
    /// [`reset`]: Connection::reset
    pub fn connect(&mut self, now: Millis) -> Vec<Command> {
        match self.state {
            ConnectionState::Connecting { .. } | ConnectionState::Open { .. } => Vec::new(),
            ConnectionState::Failed => {
                debug!("Connect ignored, connection has failed");
                Vec::new()
            }
            ConnectionState::Idle | ConnectionState::Backoff { .. } => self.open_socket(now),
        }
    }

    /// Leave `Failed` (or any state) and start over with a fresh retry budget.
    pub fn reset(&mut self, now: Millis) -> Vec<Command> {
        let mut cmds = self.disconnect(now);
        self.fallback_sent = false;
        cmds.extend(self.open_socket(now));
        cmds
    }

    /// Explicit close. Cancels any scheduled reconnect.
    pub fn disconnect(&mut self, _now: Millis) -> Vec<Command> {
        let mut cmds = Vec::new();
        if let Some(socket) = self.state.socket() {
            cmds.push(Command::Close(socket));
        }
        if self.state.is_open() {
            cmds.push(Command::Emit(Lifecycle::Disconnected {
                reason: "closed by client".into(),
            }));
        }
        self.state = ConnectionState::Idle;
        self.attempts = 0;
        cmds
    }

    pub fn on_open(&mut self, socket: SocketId, now: Millis) -> Vec<Command> {
        match self.state {
            ConnectionState::Connecting { socket: current, .. } if current == socket => {}
            _ => {
                debug!(%socket, "Ignoring open from stale socket");
                return vec![Command::Close(socket)];
            }
        }

        info!(%socket, retries = self.attempts, "Connection open");
        self.state = ConnectionState::Open { socket, since: now };
        self.retries_before_open = self.attempts;
        self.attempts = 0;
        self.fallback_sent = false;
        self.last_activity = now;
        self.last_ping = now;
        self.last_frame = None;

        vec![Command::Resubscribe, Command::Emit(Lifecycle::Connected)]
    }

    /// Record inbound traffic. Returns false when the frame belongs to a stale
    /// socket and must be discarded.
    pub fn on_frame(&mut self, socket: SocketId, now: Millis) -> bool {
        match self.state {
            ConnectionState::Open { socket: current, .. } if current == socket => {
                self.last_activity = now;
                self.last_frame = Some(now);
                true
            }
            _ => false,
        }
    }

    pub fn on_error(&mut self, socket: SocketId, message: &str, now: Millis) -> Vec<Command> {
        if self.state.socket() != Some(socket) {
            return Vec::new();
        }
        error!(%socket, error = message, "Socket error");
        let mut cmds = vec![Command::Emit(Lifecycle::Error(message.to_string()))];
        cmds.extend(self.fail(now, message));
        cmds
    }

    pub fn on_close(&mut self, socket: SocketId, reason: &str, now: Millis) -> Vec<Command> {
        if self.state.socket() != Some(socket) {
            return Vec::new();
        }
        warn!(%socket, reason, "Socket closed");
        self.fail(now, reason)
    }

    /// Drive timers: connect timeout, heartbeat ping and stall detection,
    /// scheduled reconnects.
    pub fn tick(&mut self, now: Millis) -> Vec<Command> {
        match self.state {
            ConnectionState::Connecting { since, .. }
                if elapsed(now, since) >= self.heartbeat.connect_timeout_ms =>
            {
                self.fail(now, "connect timeout")
            }
            ConnectionState::Open { .. }
                if elapsed(now, self.last_activity) > self.heartbeat.timeout_ms =>
            {
                warn!(
                    silent_ms = elapsed(now, self.last_activity),
                    "Heartbeat timeout, forcing reconnect"
                );
                self.fail(now, "heartbeat timeout")
            }
            ConnectionState::Open { .. }
                if elapsed(now, self.last_ping) >= self.heartbeat.interval_ms =>
            {
                self.last_ping = now;
                vec![Command::SendPing]
            }
            ConnectionState::Backoff { retry_at, attempt } if now >= retry_at => {
                info!(attempt, "Reconnecting");
                self.open_socket(now)
            }
            _ => Vec::new(),
        }
    }

    /// Earliest time `tick` has work to do.
    pub fn next_deadline(&self) -> Option<Millis> {
        match self.state {
            ConnectionState::Connecting { since, .. } => {
                Some(since + self.heartbeat.connect_timeout_ms)
            }
            ConnectionState::Open { .. } => Some(
                (self.last_ping + self.heartbeat.interval_ms)
                    .min(self.last_activity + self.heartbeat.timeout_ms + 1),
            ),
            ConnectionState::Backoff { retry_at, .. } => Some(retry_at),
            ConnectionState::Idle | ConnectionState::Failed => None,
        }
    }

    pub fn health(&self, now: Millis) -> HealthReport {
        let since_last_frame = self.last_frame.map(|t| elapsed(now, t));
        let (level, score) = match self.state {
            ConnectionState::Open { since, .. }
                if self.retries_before_open > 0
                    && elapsed(now, since) < self.heartbeat.interval_ms =>
            {
                let penalty = self.retries_before_open.saturating_mul(10).min(50) as u8;
                (HealthLevel::Degraded, 50 - penalty)
            }
            ConnectionState::Open { .. } => {
                let half = self.heartbeat.interval_ms / 2;
                match since_last_frame {
                    None => (HealthLevel::Healthy, 100),
                    Some(s) if s < half => (HealthLevel::Healthy, 100),
                    Some(s) if s < self.heartbeat.interval_ms => (HealthLevel::Warning, 75),
                    Some(_) => (HealthLevel::Critical, 25),
                }
            }
            _ => (HealthLevel::Disconnected, 0),
        };

        HealthReport {
            level,
            score,
            since_last_frame,
            reconnect_attempts: self.attempts,
            max_reconnect_attempts: self.backoff.max_attempts,
        }
    }

    fn open_socket(&mut self, now: Millis) -> Vec<Command> {
        self.next_socket += 1;
        let socket = SocketId(self.next_socket);
        debug!(%socket, attempt = self.attempts, "Opening socket");
        self.state = ConnectionState::Connecting { socket, since: now };
        vec![Command::Open(socket)]
    }

    fn fail(&mut self, now: Millis, reason: &str) -> Vec<Command> {
        let mut cmds = Vec::new();
        if let Some(socket) = self.state.socket() {
            cmds.push(Command::Close(socket));
        }
        if self.state.is_open() {
            cmds.push(Command::Emit(Lifecycle::Disconnected {
                reason: reason.to_string(),
            }));
        }

        if self.attempts < self.backoff.max_attempts {
            let delay_ms = self.backoff.delay_for(self.attempts);
            self.attempts += 1;
            info!(attempt = self.attempts, delay_ms, reason, "Scheduling reconnect");
            self.state = ConnectionState::Backoff {
                attempt: self.attempts,
                retry_at: now + delay_ms,
            };
            cmds.push(Command::Emit(Lifecycle::Reconnecting {
                attempt: self.attempts,
                delay_ms,
            }));
        } else {
            self.state = ConnectionState::Failed;
            if !self.fallback_sent {
                self.fallback_sent = true;
                error!(attempts = self.attempts, "Reconnect attempts exhausted, falling back");
                cmds.push(Command::Emit(Lifecycle::Fallback));
            }
        }
        cmds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        Connection::new(BackoffPolicy::default(), HeartbeatPolicy::default())
    }

    fn opened_socket(cmds: &[Command]) -> SocketId {
        cmds.iter()
            .find_map(|c| match c {
                Command::Open(s) => Some(*s),
                _ => None,
            })
            .expect("expected an Open command")
    }

    #[test]
    fn test_backoff_delays() {
        let policy = BackoffPolicy::default();
        let delays: Vec<Millis> = (0..7).map(|n| policy.delay_for(n)).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);

        let slow = BackoffPolicy {
            factor: 1.5,
            ..BackoffPolicy::default()
        };
        assert_eq!(slow.delay_for(2), 2250);
        assert_eq!(policy.delay_for(u32::MAX), 30000);
    }

    #[test]
    fn test_open_resubscribes_then_reports_connected() {
        let mut c = conn();
        let socket = opened_socket(&c.connect(0));
        assert_eq!(c.status(), ConnectionStatus::Connecting);
        assert!(c.connect(5).is_empty());

        let cmds = c.on_open(socket, 10);
        assert_eq!(
            cmds,
            vec![Command::Resubscribe, Command::Emit(Lifecycle::Connected)]
        );
        assert!(c.is_open());
        assert!(c.connect(20).is_empty());
    }

    #[test]
    fn test_retries_until_fallback_once() {
        let policy = BackoffPolicy::default();
        let mut c = conn();
        let mut now = 0;
        let mut socket = opened_socket(&c.connect(now));
        let mut fallbacks = 0;

        for n in 0..policy.max_attempts {
            let cmds = c.on_close(socket, "refused", now);
            assert!(cmds.contains(&Command::Emit(Lifecycle::Reconnecting {
                attempt: n + 1,
                delay_ms: policy.delay_for(n),
            })));
            let ConnectionState::Backoff { retry_at, .. } = c.state() else {
                panic!("expected backoff");
            };
            assert_eq!(retry_at, now + policy.delay_for(n));

            // Not before the deadline
            assert!(c.tick(retry_at - 1).is_empty());
            now = retry_at;
            socket = opened_socket(&c.tick(now));
        }

        let cmds = c.on_close(socket, "refused", now);
        fallbacks += cmds
            .iter()
            .filter(|c| **c == Command::Emit(Lifecycle::Fallback))
            .count();
        assert_eq!(c.state(), ConnectionState::Failed);

        // Terminal: no further attempts without reset
        assert!(c.tick(now + 1_000_000).is_empty());
        assert!(c.connect(now + 1_000_000).is_empty());
        assert!(c.on_close(socket, "again", now).is_empty());
        assert_eq!(fallbacks, 1);

        assert!(matches!(c.reset(now)[..], [Command::Open(_)]));
        assert_eq!(c.attempts(), 0);
    }

    #[test]
    fn test_stale_socket_events_are_ignored() {
        let mut c = conn();
        let first = opened_socket(&c.connect(0));
        c.on_close(first, "dropped", 5);
        let second = opened_socket(&c.tick(1005));
        assert_ne!(first, second);

        assert!(c.on_close(first, "late close", 1006).is_empty());
        assert_eq!(c.on_open(first, 1007), vec![Command::Close(first)]);
        assert!(!c.on_frame(first, 1008));

        c.on_open(second, 1010);
        assert!(c.on_frame(second, 1011));
        assert_eq!(c.attempts(), 0);
    }

    #[test]
    fn test_heartbeat_ping_and_timeout() {
        let mut c = conn();
        let socket = opened_socket(&c.connect(0));
        c.on_open(socket, 0);

        assert!(c.tick(29_999).is_empty());
        assert_eq!(c.tick(30_000), vec![Command::SendPing]);
        assert!(c.tick(30_001).is_empty());

        // Traffic keeps the socket alive
        c.on_frame(socket, 40_000);
        assert_eq!(c.tick(60_000), vec![Command::SendPing]);

        let cmds = c.tick(85_001);
        assert_eq!(cmds[0], Command::Close(socket));
        assert!(cmds.contains(&Command::Emit(Lifecycle::Disconnected {
            reason: "heartbeat timeout".into()
        })));
        assert!(matches!(c.state(), ConnectionState::Backoff { attempt: 1, .. }));
    }

    #[test]
    fn test_connect_timeout_aborts_stuck_socket() {
        let mut c = conn();
        let socket = opened_socket(&c.connect(0));
        assert!(c.tick(9_999).is_empty());
        let cmds = c.tick(10_000);
        assert_eq!(cmds[0], Command::Close(socket));
        assert_eq!(c.next_deadline(), Some(11_000));
    }

    #[test]
    fn test_disconnect_cancels_reconnect() {
        let mut c = conn();
        let socket = opened_socket(&c.connect(0));
        c.on_error(socket, "boom", 1);
        assert!(matches!(c.state(), ConnectionState::Backoff { .. }));

        assert!(c.disconnect(2).is_empty());
        assert_eq!(c.state(), ConnectionState::Idle);
        assert!(c.tick(100_000).is_empty());
    }

    #[test]
    fn test_health_levels() {
        let mut c = conn();
        assert_eq!(c.health(0).level, HealthLevel::Disconnected);

        let first = opened_socket(&c.connect(0));
        c.on_close(first, "refused", 0);
        c.tick(1_000);
        let second = c.state().socket().unwrap();
        c.on_open(second, 1_000);

        let report = c.health(2_000);
        assert_eq!((report.level, report.score), (HealthLevel::Degraded, 40));

        c.on_frame(second, 40_000);
        assert_eq!(c.health(41_000).level, HealthLevel::Healthy);
        assert_eq!(c.health(60_000).score, 75);
        assert_eq!(c.health(71_000).level, HealthLevel::Critical);
    }
}
