//! Update buffer
//!
//! Coalesces bursts of per-location updates into one flush. A burst collapses
//! into a single flush `flush_delay` after its last update, and no pending
//! update waits longer than `immediacy_threshold` after the previous flush.

use serde::Deserialize;
use tracing::trace;

use crate::time::{elapsed, Millis};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BufferPolicy {
    /// When false every push flushes immediately
    pub enabled: bool,
    pub flush_delay_ms: Millis,
    pub immediacy_threshold_ms: Millis,
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_delay_ms: 10_000,
            immediacy_threshold_ms: 15_000,
        }
    }
}

#[derive(Debug)]
pub struct UpdateBuffer<T> {
    policy: BufferPolicy,
    /// Latest value per key, in first-seen order
    pending: Vec<(String, T)>,
    deadline: Option<Millis>,
    last_flush: Option<Millis>,
}

impl<T> UpdateBuffer<T> {
    pub fn new(policy: BufferPolicy) -> Self {
        Self {
            policy,
            pending: Vec::new(),
            deadline: None,
            last_flush: None,
        }
    }

    /// Stage `value` for `key`, replacing any pending value for it. Returns the
    /// flushed batch when the push triggers an immediate flush.
    pub fn push(&mut self, key: &str, value: T, now: Millis) -> Option<Vec<T>> {
        match self.pending.iter_mut().find(|(k, _)| k == key) {
            Some((_, slot)) => *slot = value,
            None => self.pending.push((key.to_string(), value)),
        }

        let overdue = self
            .last_flush
            .map_or(true, |t| elapsed(now, t) >= self.policy.immediacy_threshold_ms);
        if !self.policy.enabled || overdue {
            return Some(self.flush(now));
        }

        let mut deadline = now + self.policy.flush_delay_ms;
        if let Some(t) = self.last_flush {
            deadline = deadline.min(t + self.policy.immediacy_threshold_ms);
        }
        self.deadline = Some(deadline);
        trace!(key, pending = self.pending.len(), deadline, "Update buffered");
        None
    }

    /// Flush if the timer has expired.
    pub fn poll(&mut self, now: Millis) -> Option<Vec<T>> {
        match self.deadline {
            Some(d) if now >= d => Some(self.flush(now)),
            _ => None,
        }
    }

    /// Drain everything pending as one batch.
    pub fn flush(&mut self, now: Millis) -> Vec<T> {
        self.deadline = None;
        self.last_flush = Some(now);
        let batch: Vec<T> = self.pending.drain(..).map(|(_, v)| v).collect();
        trace!(count = batch.len(), "Update buffer flushed");
        batch
    }

    /// Drop the pending value for `key` without publishing it.
    pub fn discard(&mut self, key: &str) -> Option<T> {
        let idx = self.pending.iter().position(|(k, _)| k == key)?;
        let (_, value) = self.pending.remove(idx);
        if self.pending.is_empty() {
            self.deadline = None;
        }
        trace!(key, "Pending update discarded");
        Some(value)
    }

    pub fn next_deadline(&self) -> Option<Millis> {
        self.deadline
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_update_flushes_immediately() {
        let mut buf = UpdateBuffer::new(BufferPolicy::default());
        assert_eq!(buf.push("gate", 1, 0), Some(vec![1]));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_burst_coalesces_latest_wins() {
        let mut buf = UpdateBuffer::new(BufferPolicy::default());
        buf.push("gate", 0, 0);

        assert_eq!(buf.push("gate", 3, 1_000), None);
        assert_eq!(buf.push("east", 7, 1_500), None);
        assert_eq!(buf.push("gate", 4, 2_000), None);
        assert_eq!(buf.pending_len(), 2);

        // Timer restarted by the last push
        assert_eq!(buf.poll(11_999), None);
        assert_eq!(buf.poll(12_000), Some(vec![4, 7]));
        assert_eq!(buf.poll(30_000), None);
    }

    #[test]
    fn test_continuous_updates_still_flush() {
        let policy = BufferPolicy::default();
        let mut buf = UpdateBuffer::new(policy);
        let mut flushes = Vec::new();

        for now in (0..120_000).step_by(250) {
            if buf.push("gate", now, now).is_some() {
                flushes.push(now);
            }
            if buf.poll(now).is_some() {
                flushes.push(now);
            }
        }

        assert!(flushes.len() > 1);
        assert!(flushes
            .windows(2)
            .all(|w| w[1] - w[0] <= policy.immediacy_threshold_ms));
    }

    #[test]
    fn test_discard_drops_only_that_key() {
        let mut buf = UpdateBuffer::new(BufferPolicy::default());
        buf.push("gate", 0, 0);
        buf.push("gate", 45, 1_000);
        buf.push("east", 7, 1_500);

        assert_eq!(buf.discard("gate"), Some(45));
        assert_eq!(buf.discard("gate"), None);
        assert_eq!(buf.poll(11_500), Some(vec![7]));

        buf.push("gate", 3, 20_000);
        buf.push("gate", 4, 21_000);
        buf.discard("gate");
        assert_eq!(buf.next_deadline(), None);
    }

    #[test]
    fn test_disabled_passes_through() {
        let mut buf = UpdateBuffer::new(BufferPolicy {
            enabled: false,
            ..BufferPolicy::default()
        });
        buf.push("gate", 1, 0);
        assert_eq!(buf.push("gate", 2, 1), Some(vec![2]));
    }
}
