//! Platform-agnostic clock helpers
//!
//! Every state machine in the crate takes `now` as an argument instead of
//! reading a clock, so drivers call these once per event and tests pass
//! literal millisecond values.

use std::time::Duration;

/// Milliseconds on a monotonic, app-relative clock.
pub type Millis = u64;

#[cfg(target_arch = "wasm32")]
pub fn now_millis() -> Millis {
    web_sys::window()
        .and_then(|w| w.performance())
        .map(|p| p.now() as Millis)
        .unwrap_or(0)
}

#[cfg(not(target_arch = "wasm32"))]
pub fn now_millis() -> Millis {
    use std::sync::OnceLock;
    use std::time::Instant;

    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as Millis
}

/// Convert a configured duration to clock units, saturating.
pub fn as_millis(d: Duration) -> Millis {
    d.as_millis().min(Millis::MAX as u128) as Millis
}

/// Milliseconds elapsed from `since` to `now`, zero if the clock went backwards.
pub fn elapsed(now: Millis, since: Millis) -> Millis {
    now.saturating_sub(since)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_never_underflows() {
        assert_eq!(elapsed(10, 25), 0);
        assert_eq!(elapsed(25, 10), 15);
    }

    #[test]
    fn test_as_millis() {
        assert_eq!(as_millis(Duration::from_secs(30)), 30_000);
    }
}
