//! Poll interval computation.

use std::time::Duration;

use farm_core::Tuning;

/// Time to wait before the next exchange.
///
/// The heartbeat is multiplied by `error_scale` once per consecutive
/// failure and capped at `hibernation`; `arrhythmia * jitter` is added on
/// top, with `jitter` drawn from `[0, 1)`.
pub fn poll_interval(tuning: &Tuning, failures: u32, jitter: f64) -> Duration {
    let mut secs = tuning.heartbeat;
    if failures > 0 {
        let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
        secs = (secs * tuning.error_scale.powi(exponent)).min(tuning.hibernation);
    }
    secs += tuning.arrhythmia * jitter;

    if !secs.is_finite() {
        return Duration::from_secs_f64(Tuning::default().heartbeat);
    }
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::ZERO)
}
