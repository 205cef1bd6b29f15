//! Decayed capability frequency estimates.
//!
//! Each identity announcement decays every estimate by `shrink` and adds
//! `1 - shrink` to the capabilities it mentions, so an estimate tracks the
//! fraction of recent announcements that offered the capability. Jobs that
//! need a rare capability get their weight divided by that small fraction,
//! which keeps them competitive on the few nodes able to run them.

use std::collections::HashMap;

/// Smallest rate used as a divisor.
const RATE_FLOOR: f64 = 1e-6;

#[derive(Debug, Clone)]
pub struct CapabilityRates {
    shrink: f64,
    /// Starting value for a capability seen for the first time; decays with
    /// every announcement so late newcomers do not start at full rate.
    init: f64,
    rates: HashMap<String, f64>,
}

impl CapabilityRates {
    /// `half_life` is the number of announcements after which an estimate
    /// that is no longer reinforced has halved.
    pub fn new(half_life: f64) -> Self {
        let half_life = if half_life > 0.0 { half_life } else { 1.0 };
        Self {
            shrink: 0.5_f64.powf(1.0 / half_life),
            init: 1.0,
            rates: HashMap::new(),
        }
    }

    /// Fold one announcement into the estimates.
    pub fn report<I, S>(&mut self, provides: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let add = 1.0 - self.shrink;
        self.init *= self.shrink;
        for rate in self.rates.values_mut() {
            *rate *= self.shrink;
        }
        for cap in provides {
            let rate = self
                .rates
                .entry(cap.as_ref().to_string())
                .or_insert(self.init);
            *rate += add;
        }
    }

    /// Current estimate, if the capability has ever been announced.
    pub fn get(&self, capability: &str) -> Option<f64> {
        self.rates.get(capability).copied()
    }

    /// Estimate used as a weight divisor. Unknown capabilities count as a
    /// brand new one would.
    pub fn divisor(&self, capability: &str) -> f64 {
        self.get(capability).unwrap_or(self.init).max(RATE_FLOOR)
    }

    pub fn shrink(&self) -> f64 {
        self.shrink
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shrink_halves_after_half_life() {
        let rates = CapabilityRates::new(64.0);
        assert!((rates.shrink().powi(64) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn announced_rate_converges_to_one_and_silent_to_zero() {
        let mut rates = CapabilityRates::new(16.0);
        rates.report(["gpu", "rare"]);
        for _ in 0..2000 {
            rates.report(["gpu"]);
        }
        let gpu = rates.get("gpu").unwrap();
        let rare = rates.get("rare").unwrap();
        assert!((gpu - 1.0).abs() < 1e-6, "gpu = {gpu}");
        assert!(rare < 1e-6, "rare = {rare}");
    }

    #[test]
    fn half_the_fleet_converges_to_a_half() {
        let mut rates = CapabilityRates::new(32.0);
        for i in 0..4000 {
            if i % 2 == 0 {
                rates.report(["cuda"]);
            } else {
                rates.report(Vec::<String>::new());
            }
        }
        let cuda = rates.get("cuda").unwrap();
        assert!((cuda - 0.5).abs() < 0.05, "cuda = {cuda}");
    }

    #[test]
    fn unknown_capability_divisor_is_positive() {
        let mut rates = CapabilityRates::new(4.0);
        for _ in 0..10_000 {
            rates.report(["a"]);
        }
        assert!(rates.divisor("never") > 0.0);
        assert!(rates.divisor("never") < 1.0);
    }
}
