use std::time::Duration;

use rand::Rng;

/// Retry delay after the given number of failed attempts: base doubled per
/// attempt, multiplied by ±50% jitter, capped. The jitter keeps a burst of
/// failures from synchronizing their retries.
pub fn retry_delay(attempts: u32, base: Duration, cap: Duration) -> Duration {
    let exponent = attempts.min(20);
    let uncapped = base.saturating_mul(1u32 << exponent.min(31));
    let capped = uncapped.min(cap);
    let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
    let millis = (capped.as_millis() as f64 * jitter) as u64;
    Duration::from_millis(millis.max(1)).min(cap)
}
