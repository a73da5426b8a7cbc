//! Age-based replay filter.
//!
//! Stale inbound traffic (long-delayed datagrams, retained broker messages
//! replayed on reconnect) is rejected before any further processing. The
//! policy is uniform across transports.

/// Whether a message timestamp is too old to process.
///
/// `max_age_minutes <= 0` disables filtering entirely. Timestamps are
/// trusted as sent; there is no cross-device clock correction.
pub fn is_too_old(timestamp_millis: i64, now_millis: i64, max_age_minutes: i64) -> bool {
    if max_age_minutes <= 0 {
        return false;
    }
    (now_millis - timestamp_millis) > max_age_minutes * 60_000
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_AGE: i64 = 360;

    #[test]
    fn boundary_is_exclusive() {
        let now = 1_700_000_000_000;
        let limit = MAX_AGE * 60_000;

        assert!(!is_too_old(now - (limit - 1), now, MAX_AGE));
        assert!(!is_too_old(now - limit, now, MAX_AGE));
        assert!(is_too_old(now - (limit + 1), now, MAX_AGE));
        assert!(is_too_old(now - MAX_AGE * 60_001, now, MAX_AGE));
    }

    #[test]
    fn zero_or_negative_max_age_disables_filtering() {
        let now = 1_700_000_000_000;
        assert!(!is_too_old(0, now, 0));
        assert!(!is_too_old(0, now, -5));
    }

    #[test]
    fn future_timestamps_are_accepted() {
        let now = 1_700_000_000_000;
        assert!(!is_too_old(now + 10_000, now, MAX_AGE));
    }
}
