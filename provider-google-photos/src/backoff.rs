//! Exponential backoff with full jitter.

use rand::Rng;
use std::time::Duration;

/// Delay before retry number `retry` (0-based).
///
/// Without a server hint the delay is drawn uniformly from
/// `[0, min(cap, base * 2^retry)]`. A `Retry-After` hint replaces the draw
/// but is still clamped to `cap`.
pub fn delay_for(
    retry: u32,
    base: Duration,
    cap: Duration,
    retry_after: Option<Duration>,
) -> Duration {
    if let Some(hint) = retry_after {
        return hint.min(cap);
    }

    let ceiling = ceiling_for(retry, base, cap);
    let ceiling_ms = ceiling.as_millis() as u64;
    if ceiling_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling_ms))
}

fn ceiling_for(retry: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

/// Parse a `Retry-After` header given in delta-seconds.
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
