//! Rack risk scoring
//!
//! A rack's 0-100 risk score is a weighted combination of three sub-scores,
//! each normalized to 0-100:
//!
//! - thermal: how close the inlet temperature is to the thermal ceiling, on a
//!   knee curve so the last stretch of headroom carries most of the risk
//! - power: rack draw as a fraction of its PDU's rated capacity
//! - volatility: recent variance of inlet temperature and power draw
//!
//! The scorer is pure; the rolling sample window lives with the rack state.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uponline_core::config::ScoringConfig;
use uponline_core::{RiskLevel, Trend};

/// Sub-score that contributes most to a rack's score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoreFactor {
    Thermal,
    Power,
    Volatility,
}

/// Inputs to one scoring pass. A missing reading contributes a zero
/// sub-score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreInputs {
    pub inlet_c: Option<f64>,
    pub power_kw: Option<f64>,
    pub pdu_capacity_kw: f64,
    /// Volatility sub-score already computed from the rolling window
    pub volatility: f64,
}

/// Result of scoring a rack, with the sub-scores that produced it
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub thermal: f64,
    pub power: f64,
    pub volatility: f64,
    pub dominant: ScoreFactor,
    pub score: u8,
    /// `None` until the rack has reported an inlet temperature
    pub thermal_margin_pct: Option<f64>,
    pub above_ceiling: bool,
}

/// Piecewise-linear knee curve mapping a used fraction in [0,1] to 0-100.
/// Reaches `knee_score` at `knee_fraction` and 100 at 1.0; input outside
/// [0,1] is clamped.
pub fn knee_curve(fraction: f64, knee_fraction: f64, knee_score: f64) -> f64 {
    let u = if fraction.is_nan() {
        0.0
    } else {
        fraction.clamp(0.0, 1.0)
    };
    if u <= knee_fraction {
        knee_score * u / knee_fraction
    } else {
        knee_score + (100.0 - knee_score) * (u - knee_fraction) / (1.0 - knee_fraction)
    }
}

/// Stateless rack scorer bound to one scoring configuration
#[derive(Debug, Clone)]
pub struct RackScorer {
    config: ScoringConfig,
}

impl RackScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub fn thermal_subscore(&self, inlet_c: f64) -> f64 {
        let span = self.config.thermal_ceiling_c - self.config.thermal_floor_c;
        let fraction = (inlet_c - self.config.thermal_floor_c) / span;
        knee_curve(fraction, self.config.knee_fraction, self.config.knee_score)
    }

    pub fn power_subscore(&self, power_kw: f64, capacity_kw: f64) -> f64 {
        if capacity_kw <= 0.0 {
            return 100.0;
        }
        (100.0 * power_kw / capacity_kw).clamp(0.0, 100.0)
    }

    /// Volatility over the window: the larger of inlet std-dev and power
    /// coefficient of variation, each against its full-scale value
    pub fn volatility_subscore(&self, window: &RollingWindow) -> f64 {
        let temp = stddev(&window.inlet).map(|sd| sd / self.config.temp_stddev_full_scale);
        let power = coefficient_of_variation(&window.power)
            .map(|cv| cv / self.config.power_cv_full_scale);

        let ratio = match (temp, power) {
            (Some(t), Some(p)) => t.max(p),
            (Some(t), None) => t,
            (None, Some(p)) => p,
            (None, None) => 0.0,
        };
        (ratio * 100.0).clamp(0.0, 100.0)
    }

    pub fn thermal_margin_pct(&self, inlet_c: f64) -> f64 {
        100.0 * (self.config.thermal_ceiling_c - inlet_c) / self.config.thermal_ceiling_c
    }

    pub fn score(&self, inputs: &ScoreInputs) -> ScoreBreakdown {
        let weights = &self.config.weights;
        let thermal = inputs
            .inlet_c
            .map(|c| self.thermal_subscore(c))
            .unwrap_or(0.0);
        let power = inputs
            .power_kw
            .map(|kw| self.power_subscore(kw, inputs.pdu_capacity_kw))
            .unwrap_or(0.0);
        let volatility = inputs.volatility.clamp(0.0, 100.0);

        let weighted = [
            (ScoreFactor::Thermal, weights.thermal * thermal),
            (ScoreFactor::Power, weights.power * power),
            (ScoreFactor::Volatility, weights.volatility * volatility),
        ];
        let total: f64 = weighted.iter().map(|(_, w)| w).sum();
        let dominant = weighted
            .iter()
            .fold((ScoreFactor::Thermal, f64::MIN), |best, &(factor, w)| {
                if w > best.1 {
                    (factor, w)
                } else {
                    best
                }
            })
            .0;

        let above_ceiling = inputs
            .inlet_c
            .is_some_and(|c| c > self.config.thermal_ceiling_c);
        let mut score = total.clamp(0.0, 100.0).round() as u8;
        if above_ceiling {
            score = score.max(self.config.ceiling_breach_floor);
        }

        ScoreBreakdown {
            thermal,
            power,
            volatility,
            dominant,
            score,
            thermal_margin_pct: inputs.inlet_c.map(|c| self.thermal_margin_pct(c)),
            above_ceiling,
        }
    }

    pub fn level(&self, score: u8) -> RiskLevel {
        RiskLevel::from_score(score, &self.config.buckets)
    }

    pub fn trend(&self, previous: Option<u8>, current: u8) -> Trend {
        previous
            .map(|p| Trend::between(p, current, self.config.trend_epsilon))
            .unwrap_or(Trend::Stable)
    }
}

/// Last N accepted inlet and power readings of one rack
#[derive(Debug, Clone, Default)]
pub struct RollingWindow {
    capacity: usize,
    inlet: VecDeque<f64>,
    power: VecDeque<f64>,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inlet: VecDeque::with_capacity(capacity),
            power: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push_inlet(&mut self, value: f64) {
        push_bounded(&mut self.inlet, value, self.capacity);
    }

    pub fn push_power(&mut self, value: f64) {
        push_bounded(&mut self.power, value, self.capacity);
    }

    pub fn inlet_len(&self) -> usize {
        self.inlet.len()
    }

    pub fn power_len(&self) -> usize {
        self.power.len()
    }
}

fn push_bounded(window: &mut VecDeque<f64>, value: f64, capacity: usize) {
    if window.len() == capacity {
        window.pop_front();
    }
    window.push_back(value);
}

fn mean(values: &VecDeque<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

fn stddev(values: &VecDeque<f64>) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    Some(variance.sqrt())
}

fn coefficient_of_variation(values: &VecDeque<f64>) -> Option<f64> {
    let m = mean(values)?;
    if m <= f64::EPSILON {
        return None;
    }
    stddev(values).map(|sd| sd / m)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scorer() -> RackScorer {
        RackScorer::new(ScoringConfig::default())
    }

    fn inputs(inlet_c: f64, power_kw: f64, volatility: f64) -> ScoreInputs {
        ScoreInputs {
            inlet_c: Some(inlet_c),
            power_kw: Some(power_kw),
            pdu_capacity_kw: 20.0,
            volatility,
        }
    }

    #[test]
    fn test_knee_curve_shape() {
        assert_eq!(knee_curve(0.0, 0.8, 40.0), 0.0);
        assert!((knee_curve(0.4, 0.8, 40.0) - 20.0).abs() < 1e-9);
        assert!((knee_curve(0.8, 0.8, 40.0) - 40.0).abs() < 1e-9);
        assert!((knee_curve(0.9, 0.8, 40.0) - 70.0).abs() < 1e-9);
        assert_eq!(knee_curve(1.5, 0.8, 40.0), 100.0);
        assert_eq!(knee_curve(-1.0, 0.8, 40.0), 0.0);
    }

    #[test]
    fn test_hot_rack_near_pdu_limit_scores_high() {
        let breakdown = scorer().score(&inputs(38.4, 19.8, 11.0));
        assert!(breakdown.above_ceiling);
        assert!((78..=86).contains(&breakdown.score), "score {}", breakdown.score);
        assert_eq!(scorer().level(breakdown.score), RiskLevel::High);
        assert!(breakdown.thermal_margin_pct.unwrap() < 0.0);
    }

    #[test]
    fn test_cool_lightly_loaded_rack_scores_low() {
        let breakdown = scorer().score(&inputs(22.0, 8.0, 0.0));
        assert!(breakdown.score < 30, "score {}", breakdown.score);
        assert_eq!(breakdown.dominant, ScoreFactor::Power);
    }

    #[test]
    fn test_missing_power_reading_counts_as_zero_draw() {
        let scorer = scorer();
        let mut partial = inputs(30.0, 0.0, 0.0);
        partial.power_kw = None;
        assert_eq!(scorer.score(&partial).power, 0.0);
        assert_eq!(scorer.score(&partial).score, scorer.score(&inputs(30.0, 0.0, 0.0)).score);
    }

    #[test]
    fn test_power_only_rack_is_scored_on_power() {
        let scorer = scorer();
        let mut power_only = inputs(0.0, 19.9, 0.0);
        power_only.inlet_c = None;

        let breakdown = scorer.score(&power_only);
        assert_eq!(breakdown.thermal, 0.0);
        assert_eq!(breakdown.dominant, ScoreFactor::Power);
        assert_eq!(breakdown.thermal_margin_pct, None);
        assert!(!breakdown.above_ceiling);
        assert_eq!(breakdown.score, 30);
        assert_eq!(scorer.level(breakdown.score), RiskLevel::Medium);
    }

    #[test]
    fn test_volatility_from_window() {
        let scorer = scorer();
        let mut window = RollingWindow::new(12);
        assert_eq!(scorer.volatility_subscore(&window), 0.0);

        for _ in 0..12 {
            window.push_inlet(25.0);
            window.push_power(10.0);
        }
        assert_eq!(scorer.volatility_subscore(&window), 0.0);

        // alternating +/-1 °C around the mean gives a 1 °C std-dev, half of full scale
        for i in 0..12 {
            window.push_inlet(if i % 2 == 0 { 24.0 } else { 26.0 });
        }
        assert!((scorer.volatility_subscore(&window) - 50.0).abs() < 1e-6);
        assert_eq!(window.inlet_len(), 12);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut window = RollingWindow::new(3);
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            window.push_power(v);
        }
        assert_eq!(window.power_len(), 3);
        assert_eq!(window.power.iter().copied().collect::<Vec<_>>(), vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_trend() {
        let scorer = scorer();
        assert_eq!(scorer.trend(None, 50), Trend::Stable);
        assert_eq!(scorer.trend(Some(40), 50), Trend::Up);
        assert_eq!(scorer.trend(Some(50), 49), Trend::Stable);
    }

    proptest! {
        #[test]
        fn prop_score_in_range(
            inlet in -10.0f64..80.0,
            power in 0.0f64..200.0,
            volatility in 0.0f64..100.0,
        ) {
            let breakdown = scorer().score(&inputs(inlet, power, volatility));
            prop_assert!(breakdown.score <= 100);
        }

        #[test]
        fn prop_score_monotonic_in_inlet(
            a in 0.0f64..60.0,
            b in 0.0f64..60.0,
            power in 0.0f64..25.0,
            volatility in 0.0f64..100.0,
        ) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let scorer = scorer();
            let low = scorer.score(&inputs(lo, power, volatility)).score;
            let high = scorer.score(&inputs(hi, power, volatility)).score;
            prop_assert!(low <= high, "{} at {} vs {} at {}", low, lo, high, hi);
        }

        #[test]
        fn prop_above_ceiling_is_high_risk(
            inlet in 38.01f64..80.0,
            power in 0.0f64..200.0,
            volatility in 0.0f64..100.0,
        ) {
            let scorer = scorer();
            let breakdown = scorer.score(&inputs(inlet, power, volatility));
            prop_assert!(breakdown.score >= 60);
            prop_assert_eq!(scorer.level(breakdown.score), RiskLevel::High);
        }
    }
}
