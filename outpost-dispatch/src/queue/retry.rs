//! Retry logic with exponential backoff

use std::time::Duration;

use rand::Rng;

/// Calculate the delay before the next attempt using exponential backoff
/// with jitter
///
/// # Formula
/// `delay = min(base * 2^(attempt - 1), max_delay) * (1 ± jitter)`
///
/// # Arguments
/// * `attempt` - The attempt number (1-indexed)
/// * `base_delay_secs` - Base delay in seconds (e.g., 60 for 1 minute)
/// * `max_delay_secs` - Maximum delay in seconds (e.g., 86400 for 24 hours)
/// * `jitter_factor` - Jitter factor (e.g., 0.2 for ±20%)
pub fn calculate_retry_delay(
    attempt: u32,
    base_delay_secs: u64,
    max_delay_secs: u64,
    jitter_factor: f64,
) -> Duration {
    // Use saturating operations to prevent overflow
    let exponent = attempt.saturating_sub(1);
    let delay = if exponent >= 63 {
        max_delay_secs
    } else {
        let multiplier = 1u64 << exponent;
        base_delay_secs
            .saturating_mul(multiplier)
            .min(max_delay_secs)
    };

    if jitter_factor <= 0.0 || delay == 0 {
        return Duration::from_secs(delay);
    }

    // Intentional precision loss and casting for randomization
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let jittered_delay = {
        let jitter_range = (delay as f64) * jitter_factor;
        let mut rng = rand::rng();
        let jitter: f64 = rng.random_range(-jitter_range..=jitter_range);
        ((delay as f64) + jitter).max(0.0) as u64
    };

    Duration::from_secs(jittered_delay)
}
