//! Process-wide monotonic timestamps used as entry unique ids.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static LAST: AtomicI64 = AtomicI64::new(0);

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Nanosecond wall-clock timestamp, strictly increasing within the process.
pub fn next_unique_id() -> i64 {
    let now = now_nanos();
    let mut last = LAST.load(Ordering::Relaxed);
    loop {
        let candidate = if now > last { now } else { last + 1 };
        match LAST.compare_exchange_weak(last, candidate, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return candidate,
            Err(actual) => last = actual,
        }
    }
}

/// Milliseconds since the epoch for a nanosecond unique id.
pub fn nanos_to_millis(nanos: i64) -> u64 {
    (nanos.max(0) / 1_000_000) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_strictly_increase() {
        let mut prev = next_unique_id();
        for _ in 0..10_000 {
            let id = next_unique_id();
            assert!(id > prev);
            prev = id;
        }
    }
}
