//! Retry delays

/// Upper bound of the random jitter, as a fraction of the delay
pub const JITTER_FRACTION: f64 = 0.2;

/// `base * 2^(attempt - 1)`, capped at `cap`
pub fn exponential(attempt: u32, base_ms: u64, cap_ms: u64) -> u64 {
    let shift = attempt.saturating_sub(1).min(32);
    base_ms.saturating_mul(1u64 << shift).min(cap_ms)
}

/// Exponential delay plus jitter; `unit` in `[0, 1)` picks the jitter share
pub fn delay_with(attempt: u32, base_ms: u64, cap_ms: u64, unit: f64) -> u64 {
    let delay = exponential(attempt, base_ms, cap_ms);
    let jitter = (delay as f64 * JITTER_FRACTION * unit.clamp(0.0, 1.0)) as u64;
    delay + jitter
}

/// Delay before retry number `attempt` (1-based) of a failed send
pub fn retry_delay(attempt: u32, base_ms: u64, cap_ms: u64) -> u64 {
    delay_with(attempt, base_ms, cap_ms, rand::random::<f64>())
}
