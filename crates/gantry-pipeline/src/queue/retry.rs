// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry backoff for failed jobs.

use std::time::Duration;

/// Delay before the first retry.
pub const BASE_DELAY: Duration = Duration::from_secs(10);

/// Upper bound for any retry delay.
pub const MAX_DELAY: Duration = Duration::from_secs(600);

/// Delay before retrying a job whose attempt number `attempt` (1-based) failed.
///
/// Doubles from [`BASE_DELAY`] and saturates at [`MAX_DELAY`].
pub fn backoff(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    BASE_DELAY
        .checked_mul(1u32 << exponent)
        .map_or(MAX_DELAY, |delay| delay.min(MAX_DELAY))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_then_caps() {
        assert_eq!(backoff(1), Duration::from_secs(10));
        assert_eq!(backoff(2), Duration::from_secs(20));
        assert_eq!(backoff(3), Duration::from_secs(40));
        assert_eq!(backoff(6), Duration::from_secs(320));
        assert_eq!(backoff(7), MAX_DELAY);
        assert_eq!(backoff(u32::MAX), MAX_DELAY);
    }

    #[test]
    fn test_attempt_zero_uses_base() {
        assert_eq!(backoff(0), BASE_DELAY);
    }
}
