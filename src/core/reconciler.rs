//! Per-location count reconciliation
//!
//! Upstream counters may resend old values, report transient zeros, or restart
//! a sub-window. The reconciler folds every raw reading into a running maximum
//! so the displayed count never goes backwards and, once data has been seen,
//! never shows zero.
//!
//! The floor of 1 is applied to the displayed value only; the accumulator
//! keeps the true maximum so later comparisons are not inflated.

use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, trace};

use super::protocol::{LocationId, Timeframe};
use crate::time::Millis;

/// Where a count update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateSource {
    Realtime,
    Progressive {
        sample_index: Option<u64>,
        total_samples: Option<u64>,
    },
    ProgressiveComplete,
    /// Pre-populated from the local cache
    Restored,
    /// Seeded from the query API
    Seed,
}

/// The display-ready result of folding one reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountUpdate {
    pub location_id: LocationId,
    /// Value to render
    pub count: u64,
    pub cumulative_count: u64,
    pub timeframe_count: u64,
    pub timeframe: Timeframe,
    pub timestamp: Millis,
    pub source: UpdateSource,
}

/// Count state of one location.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationCountState {
    cumulative_count: u64,
    last_known_count: u64,
    has_received_data: bool,
    counts_by_timeframe: HashMap<Timeframe, u64>,
    progress_complete: bool,
    last_update: Millis,
}

impl LocationCountState {
    /// Zero until data arrives, then at least 1.
    pub fn display_count(&self) -> u64 {
        if self.has_received_data {
            self.cumulative_count.max(1)
        } else {
            0
        }
    }

    pub fn cumulative_count(&self) -> u64 {
        self.cumulative_count
    }

    pub fn last_known_count(&self) -> u64 {
        self.last_known_count
    }

    pub fn has_received_data(&self) -> bool {
        self.has_received_data
    }

    pub fn timeframe_count(&self, timeframe: Timeframe) -> u64 {
        self.counts_by_timeframe.get(&timeframe).copied().unwrap_or(0)
    }

    pub fn is_progress_complete(&self) -> bool {
        self.progress_complete
    }

    pub fn last_update(&self) -> Millis {
        self.last_update
    }

    fn fold(&mut self, timeframe: Timeframe, raw: u64, now: Millis) {
        let tf = self.counts_by_timeframe.entry(timeframe).or_insert(0);
        *tf = (*tf).max(raw);

        if raw > 0 || !self.has_received_data {
            self.cumulative_count = self.cumulative_count.max(raw);
            self.last_known_count = self.cumulative_count;
            self.has_received_data = true;
        }
        self.last_update = now;
    }
}

#[derive(Debug, Default)]
pub struct CountReconciler {
    states: HashMap<LocationId, LocationCountState>,
}

impl CountReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a realtime reading.
    pub fn apply(
        &mut self,
        location_id: &str,
        timeframe: Timeframe,
        raw: u64,
        now: Millis,
    ) -> CountUpdate {
        self.fold(location_id, timeframe, raw, now, UpdateSource::Realtime)
    }

    /// Fold one sample of a progressive-loading sequence.
    pub fn apply_progressive(
        &mut self,
        location_id: &str,
        timeframe: Timeframe,
        raw: u64,
        sample_index: Option<u64>,
        total_samples: Option<u64>,
        now: Millis,
    ) -> CountUpdate {
        let source = UpdateSource::Progressive {
            sample_index,
            total_samples,
        };
        self.fold(location_id, timeframe, raw, now, source)
    }

    /// Finish a progressive-loading sequence at `final_count`.
    pub fn complete_progressive(
        &mut self,
        location_id: &str,
        timeframe: Timeframe,
        final_count: u64,
        now: Millis,
    ) -> CountUpdate {
        let state = self.states.entry(location_id.to_string()).or_default();
        state.fold(timeframe, final_count, now);
        state.last_known_count = state.cumulative_count;
        state.has_received_data = true;
        state.progress_complete = true;

        debug!(
            location = location_id,
            final_count,
            cumulative = state.cumulative_count,
            "Progressive loading complete"
        );
        Self::update(location_id, timeframe, state, now, UpdateSource::ProgressiveComplete)
    }

    /// Pre-populate from a cached or seeded value. Never lowers existing state.
    pub fn restore(
        &mut self,
        location_id: &str,
        timeframe: Timeframe,
        cumulative_count: u64,
        timeframe_count: u64,
        now: Millis,
        source: UpdateSource,
    ) -> CountUpdate {
        let state = self.states.entry(location_id.to_string()).or_default();
        let tf = state.counts_by_timeframe.entry(timeframe).or_insert(0);
        *tf = (*tf).max(timeframe_count);
        if cumulative_count > 0 {
            state.cumulative_count = state.cumulative_count.max(cumulative_count);
            state.last_known_count = state.cumulative_count;
            state.has_received_data = true;
        }
        state.last_update = now;
        Self::update(location_id, timeframe, state, now, source)
    }

    /// Start a new counting epoch for `timeframe` at one location. Other
    /// timeframes' accumulators are kept.
    pub fn reset_epoch(&mut self, location_id: &str, timeframe: Timeframe) {
        if let Some(state) = self.states.get_mut(location_id) {
            state.counts_by_timeframe.insert(timeframe, 0);
            state.cumulative_count = 0;
            state.last_known_count = 0;
            state.has_received_data = false;
            state.progress_complete = false;
            debug!(location = location_id, %timeframe, "Count epoch reset");
        }
    }

    /// Begin showing `timeframe` at one location. The displayed count restarts
    /// from that timeframe's own accumulator.
    pub fn switch_timeframe(&mut self, location_id: &str, timeframe: Timeframe) {
        if let Some(state) = self.states.get_mut(location_id) {
            let known = state.timeframe_count(timeframe);
            state.cumulative_count = known;
            state.last_known_count = known;
            state.has_received_data = known > 0;
            state.progress_complete = false;
            debug!(location = location_id, %timeframe, known, "Switched timeframe");
        }
    }

    pub fn forget(&mut self, location_id: &str) {
        self.states.remove(location_id);
    }

    pub fn state(&self, location_id: &str) -> Option<&LocationCountState> {
        self.states.get(location_id)
    }

    pub fn display_count(&self, location_id: &str) -> u64 {
        self.state(location_id).map_or(0, LocationCountState::display_count)
    }

    pub fn locations(&self) -> impl Iterator<Item = (&str, &LocationCountState)> {
        self.states.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn fold(
        &mut self,
        location_id: &str,
        timeframe: Timeframe,
        raw: u64,
        now: Millis,
        source: UpdateSource,
    ) -> CountUpdate {
        let state = self.states.entry(location_id.to_string()).or_default();
        state.fold(timeframe, raw, now);

        trace!(
            location = location_id,
            %timeframe,
            raw,
            cumulative = state.cumulative_count,
            display = state.display_count(),
            "Count folded"
        );
        Self::update(location_id, timeframe, state, now, source)
    }

    fn update(
        location_id: &str,
        timeframe: Timeframe,
        state: &LocationCountState,
        now: Millis,
        source: UpdateSource,
    ) -> CountUpdate {
        CountUpdate {
            location_id: location_id.to_string(),
            count: state.display_count(),
            cumulative_count: state.cumulative_count,
            timeframe_count: state.timeframe_count(timeframe),
            timeframe,
            timestamp: now,
            source,
        }
    }
}
