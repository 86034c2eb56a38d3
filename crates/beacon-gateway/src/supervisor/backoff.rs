use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Delay before retry number `failures` (1-based): `base * 2^(failures-1)`,
/// capped at `max`, then spread by `jitter` in both directions.
pub fn delay(config: &BackoffConfig, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(31);
    let raw = config.base.saturating_mul(1u32 << exponent).min(config.max);

    let jitter = config.jitter.clamp(0.0, 1.0);
    if jitter == 0.0 || raw.is_zero() {
        return raw;
    }
    let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
    raw.mul_f64(factor).min(config.max)
}
