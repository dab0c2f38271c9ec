use std::time::Duration;

use rand::Rng;

/// Exponential backoff with ±25% jitter, shared by the reconciler retry path
/// and the outbox dispatcher.
pub fn exponential(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
    let mut backoff = base.saturating_mul(exp);
    if backoff > cap {
        backoff = cap;
    }
    let jitter_span = (backoff.as_millis() / 4).max(1) as i64;
    let jitter_ms: i64 = rand::rng().random_range(-jitter_span..=jitter_span);
    let millis = (backoff.as_millis() as i64 + jitter_ms).max(1);
    Duration::from_millis(millis as u64)
}
