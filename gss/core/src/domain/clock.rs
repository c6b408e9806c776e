// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Saturating conversions between monotonic durations and wall-clock deadlines.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// `from + after`, clamped to the largest representable time.
pub fn deadline(from: DateTime<Utc>, after: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(after)
        .ok()
        .and_then(|delta| from.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Time left until `at`, zero if it already passed.
pub fn remaining(now: DateTime<Utc>, at: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_saturates() {
        let now = Utc::now();
        assert_eq!(deadline(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(
            deadline(now, Duration::from_secs(20)),
            now + chrono::Duration::seconds(20)
        );
    }

    #[test]
    fn test_remaining_never_negative() {
        let now = Utc::now();
        assert_eq!(remaining(now, now - chrono::Duration::seconds(5)), Duration::ZERO);
        assert_eq!(
            remaining(now, now + chrono::Duration::seconds(5)),
            Duration::from_secs(5)
        );
    }
}
