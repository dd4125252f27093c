//! Global time source.
//!
//! The device has no battery-backed clock; wall time comes from the cellular
//! network (`AT+CIPGSMLOC`) once the bearer is up. Until then timestamps run
//! on the host clock. [`set_time`] stores an offset so later reads track the
//! network-supplied epoch.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

static ADJUST_SECS: AtomicI64 = AtomicI64::new(0);
static BOOT: OnceLock<Instant> = OnceLock::new();

fn host_secs() -> i64 {
    #[allow(clippy::cast_possible_wrap)]
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    secs
}

/// Rebase the clock so that [`now`] returns `unix_secs` at this instant.
pub fn set_time(unix_secs: i64) {
    ADJUST_SECS.store(unix_secs - host_secs(), Ordering::SeqCst);
}

/// Current epoch seconds, adjusted by the last [`set_time`] call.
pub fn now() -> i64 {
    host_secs() + ADJUST_SECS.load(Ordering::SeqCst)
}

/// Milliseconds since process start. Stands in for the low-frequency
/// hardware tick counter.
pub fn ticks_ms() -> i64 {
    let boot = BOOT.get_or_init(Instant::now);
    #[allow(clippy::cast_possible_wrap)]
    let ms = boot.elapsed().as_millis() as i64;
    ms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_time_rebases_now() {
        set_time(1_700_000_000);
        let t = now();
        assert!((1_700_000_000..1_700_000_005).contains(&t));
        // restore a zero offset so other tests see the host clock
        set_time(host_secs());
    }

    #[test]
    fn test_ticks_monotonic() {
        let a = ticks_ms();
        let b = ticks_ms();
        assert!(b >= a);
    }
}
