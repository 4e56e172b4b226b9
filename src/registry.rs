//! Pattern subscription registry
//!
//! The registry is the record of what should currently be flowing on one
//! channel. Entries keep insertion order so a reconnect replays them exactly
//! as they were registered.

use serde::Deserialize;
use std::fmt;
use tracing::debug;

use crate::core::{ClientFrame, LocationId, Pattern, Timeframe};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub location_id: LocationId,
    pub timeframe: Timeframe,
    pub pattern: Pattern,
}

impl SubscriptionKey {
    pub fn new(location_id: impl Into<LocationId>, timeframe: Timeframe, pattern: Pattern) -> Self {
        Self {
            location_id: location_id.into(),
            timeframe,
            pattern,
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.pattern, self.location_id, self.timeframe)
    }
}

/// Push cadence requested from the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SubscriptionOptions {
    /// Seconds between server pushes
    pub interval: u32,
    /// Point limit, chart_data only
    #[serde(default)]
    pub limit: Option<u32>,
}

impl SubscriptionOptions {
    pub fn every(interval: u32) -> Self {
        Self {
            interval,
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(pub u64);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    handle: SubscriptionHandle,
    key: SubscriptionKey,
    options: SubscriptionOptions,
}

impl Entry {
    fn subscribe_frame(&self) -> ClientFrame {
        let scoped = self.key.pattern.is_scoped();
        ClientFrame::SubscribePattern {
            pattern: self.key.pattern,
            location_id: scoped.then(|| self.key.location_id.clone()),
            timeframe: scoped.then_some(self.key.timeframe),
            interval: self.options.interval,
            limit: self.options.limit,
        }
    }

    fn unsubscribe_frame(&self) -> ClientFrame {
        let scoped = self.key.pattern.is_scoped();
        ClientFrame::UnsubscribePattern {
            pattern: self.key.pattern,
            location_id: scoped.then(|| self.key.location_id.clone()),
            timeframe: scoped.then_some(self.key.timeframe),
        }
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Vec<Entry>,
    next_handle: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `key`. Returns its handle and, only when the key is new, the
    /// frame to send if the channel is open. Re-registering an existing key is
    /// a no-op that returns the original handle.
    pub fn subscribe(
        &mut self,
        key: SubscriptionKey,
        options: SubscriptionOptions,
    ) -> (SubscriptionHandle, Option<ClientFrame>) {
        if let Some(entry) = self.entries.iter().find(|e| e.key == key) {
            debug!(%key, handle = %entry.handle, "Already subscribed");
            return (entry.handle, None);
        }

        self.next_handle += 1;
        let handle = SubscriptionHandle(self.next_handle);
        let entry = Entry {
            handle,
            key,
            options,
        };
        let frame = entry.subscribe_frame();
        debug!(key = %entry.key, %handle, "Subscription registered");
        self.entries.push(entry);
        (handle, Some(frame))
    }

    /// Remove a registration, returning its key and unsubscribe frame.
    pub fn unsubscribe(
        &mut self,
        handle: SubscriptionHandle,
    ) -> Result<(SubscriptionKey, ClientFrame)> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.handle == handle)
            .ok_or(Error::UnknownHandle(handle.0))?;
        let entry = self.entries.remove(idx);
        debug!(key = %entry.key, %handle, "Subscription removed");
        let frame = entry.unsubscribe_frame();
        Ok((entry.key, frame))
    }

    /// Subscribe frames for every entry, in registration order.
    pub fn replay_frames(&self) -> Vec<ClientFrame> {
        self.replay_frames_where(|_| true)
    }

    /// Subscribe frames for the entries `keep` accepts, in registration order.
    pub fn replay_frames_where(
        &self,
        mut keep: impl FnMut(&SubscriptionKey) -> bool,
    ) -> Vec<ClientFrame> {
        self.entries
            .iter()
            .filter(|e| keep(&e.key))
            .map(Entry::subscribe_frame)
            .collect()
    }

    pub fn find(&self, key: &SubscriptionKey) -> Option<SubscriptionHandle> {
        self.entries.iter().find(|e| e.key == *key).map(|e| e.handle)
    }

    pub fn key(&self, handle: SubscriptionHandle) -> Option<&SubscriptionKey> {
        self.entries.iter().find(|e| e.handle == handle).map(|e| &e.key)
    }

    /// Handles registered for `location_id`, in registration order.
    pub fn handles_for(&self, location_id: &str) -> Vec<SubscriptionHandle> {
        self.entries
            .iter()
            .filter(|e| e.key.location_id == location_id)
            .map(|e| e.handle)
            .collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &SubscriptionKey> {
        self.entries.iter().map(|e| &e.key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live(location: &str, tf: Timeframe) -> SubscriptionKey {
        SubscriptionKey::new(location, tf, Pattern::LiveCount)
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let mut reg = SubscriptionRegistry::new();
        let (h1, frame) = reg.subscribe(live("gate", Timeframe::Hourly), SubscriptionOptions::every(5));
        assert!(frame.is_some());

        let (h2, again) =
            reg.subscribe(live("gate", Timeframe::Hourly), SubscriptionOptions::every(60));
        assert_eq!(h1, h2);
        assert!(again.is_none());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_replay_matches_registration_order_and_frames() {
        let mut reg = SubscriptionRegistry::new();
        let mut originals = Vec::new();
        for key in [
            live("gate", Timeframe::Hourly),
            SubscriptionKey::new("gate", Timeframe::Hourly, Pattern::ChartData),
            live("women_region", Timeframe::Daily),
        ] {
            let options = if key.pattern == Pattern::ChartData {
                SubscriptionOptions::every(10).with_limit(15)
            } else {
                SubscriptionOptions::every(5)
            };
            let (_, frame) = reg.subscribe(key, options);
            originals.push(frame.unwrap());
        }

        assert_eq!(reg.replay_frames(), originals);
        // Replay is repeatable
        assert_eq!(reg.replay_frames(), originals);
    }

    #[test]
    fn test_unsubscribe_returns_frame_and_rejects_unknown() {
        let mut reg = SubscriptionRegistry::new();
        let (h, _) = reg.subscribe(live("gate", Timeframe::Weekly), SubscriptionOptions::every(5));

        let (key, frame) = reg.unsubscribe(h).unwrap();
        assert_eq!(key, live("gate", Timeframe::Weekly));
        assert_eq!(
            frame,
            ClientFrame::UnsubscribePattern {
                pattern: Pattern::LiveCount,
                location_id: Some("gate".into()),
                timeframe: Some(Timeframe::Weekly),
            }
        );
        assert!(reg.is_empty());
        assert!(matches!(reg.unsubscribe(h), Err(Error::UnknownHandle(_))));
    }

    #[test]
    fn test_timeframe_change_is_remove_then_add() {
        let mut reg = SubscriptionRegistry::new();
        let (old, _) = reg.subscribe(live("gate", Timeframe::Hourly), SubscriptionOptions::every(5));
        reg.subscribe(live("east", Timeframe::Hourly), SubscriptionOptions::every(5));

        reg.unsubscribe(old).unwrap();
        let (new, frame) = reg.subscribe(live("gate", Timeframe::Daily), SubscriptionOptions::every(5));
        assert_ne!(old, new);
        assert!(frame.is_some());

        let keys: Vec<String> = reg.keys().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["live_count:east/HOURLY", "live_count:gate/DAILY"]);
    }

    #[test]
    fn test_ping_pong_frame_is_unscoped() {
        let mut reg = SubscriptionRegistry::new();
        let (_, frame) = reg.subscribe(
            SubscriptionKey::new("all", Timeframe::Daily, Pattern::PingPong),
            SubscriptionOptions::every(30),
        );
        assert_eq!(
            frame.unwrap().to_text().unwrap(),
            r#"{"action":"subscribe_pattern","pattern":"ping_pong","interval":30}"#
        );
    }
}
