//! Safer-window search over hour-of-day load baselines

use crate::change::ScheduledWindow;
use crate::checks::{CheckContext, CheckOutcome, ConstraintCheck};
use crate::Result;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;
use uponline_core::config::ValidatorConfig;

/// Load expected during `window` as a fraction of current load: the highest
/// hourly baseline the window touches
pub fn load_factor(config: &ValidatorConfig, window: &ScheduledWindow) -> f64 {
    let hours = window.hours();
    if hours.is_empty() {
        return 1.0;
    }
    hours
        .into_iter()
        .map(|h| config.baseline_for_hour(h))
        .fold(0.0, f64::max)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSuggestion {
    pub window: ScheduledWindow,
    pub load_factor: f64,
    /// Smallest headroom or margin among the load-bound checks
    pub min_headroom_pct: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowScan {
    pub suggestion: Option<WindowSuggestion>,
    pub candidates_scanned: u32,
    /// The time budget ran out before the lookahead was covered
    pub partial: bool,
}

#[derive(Debug, Clone)]
pub struct WindowScanner {
    checks: Vec<Arc<dyn ConstraintCheck>>,
    lookahead_hours: u32,
}

impl WindowScanner {
    /// Scanner that requires every one of `checks` to pass. Callers pass the
    /// load-bound checks and the scheduling-conflict check.
    pub fn new(checks: Vec<Arc<dyn ConstraintCheck>>, lookahead_hours: u32) -> Self {
        Self {
            checks,
            lookahead_hours,
        }
    }

    /// First window after the requested one, stepping hourly, in which every
    /// check passes at the baseline load of that window
    pub fn scan(&self, base: &CheckContext<'_>, deadline: Instant) -> Result<WindowScan> {
        let mut scan = WindowScan::default();
        for step in 1..=self.lookahead_hours {
            if Instant::now() >= deadline {
                scan.partial = true;
                debug!(
                    scanned = scan.candidates_scanned,
                    "Safer-window scan ran out of time"
                );
                break;
            }

            let candidate = base
                .window
                .moved_to(base.window.start + Duration::hours(i64::from(step)));
            let factor = load_factor(base.config, &candidate);
            let ctx = CheckContext {
                window: candidate,
                load_factor: factor,
                ..*base
            };
            scan.candidates_scanned += 1;

            let mut min_headroom: Option<f64> = None;
            let mut clear = true;
            for check in &self.checks {
                let result = check.evaluate(&ctx)?;
                if result.outcome != CheckOutcome::Pass {
                    clear = false;
                    break;
                }
                if let Some(h) = result.headroom_pct {
                    min_headroom = Some(min_headroom.map_or(h, |m: f64| m.min(h)));
                }
            }

            if clear {
                scan.suggestion = Some(WindowSuggestion {
                    window: candidate,
                    load_factor: factor,
                    min_headroom_pct: min_headroom,
                });
                break;
            }
        }
        Ok(scan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_load_factor_uses_busiest_hour() {
        let config = ValidatorConfig::default();
        let night = ScheduledWindow::new(
            Utc.with_ymd_and_hms(2026, 3, 14, 2, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 14, 4, 0, 0).unwrap(),
        )
        .unwrap();
        assert!((load_factor(&config, &night) - 0.82).abs() < 1e-9);

        let into_morning = night.moved_to(Utc.with_ymd_and_hms(2026, 3, 14, 5, 30, 0).unwrap());
        assert!((load_factor(&config, &into_morning) - 0.92).abs() < 1e-9);

        let noon = night.moved_to(Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap());
        assert_eq!(load_factor(&config, &noon), 1.0);
    }
}
