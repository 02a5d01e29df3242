//! Stateless exceedance rules
//!
//! Maps a reading value and its window average onto a raw [`Severity`]:
//!
//! | condition | level |
//! |---|---|
//! | `value >= limit * critical_ratio` | CRITICAL |
//! | `value >= limit * warning_ratio` | WARNING |
//! | `window_avg >= limit * watch_ratio` | WATCH |
//! | otherwise | OK |
//!
//! Boundaries resolve to the higher level.

use outfall_core::{PermitRule, Severity};

/// Raw level for one observation; `None` rule always yields OK
pub fn evaluate(value: f64, window_avg: f64, rule: Option<&PermitRule>) -> Severity {
    let Some(rule) = rule else {
        return Severity::Ok;
    };

    if value >= rule.critical_threshold() {
        Severity::Critical
    } else if value >= rule.warning_threshold() {
        Severity::Warning
    } else if window_avg >= rule.watch_threshold() {
        Severity::Watch
    } else {
        Severity::Ok
    }
}

/// Concentration boundary associated with a level
///
/// OK reports the permit limit itself.
pub fn threshold_for(severity: Severity, rule: &PermitRule) -> f64 {
    match severity {
        Severity::Critical => rule.critical_threshold(),
        Severity::Warning => rule.warning_threshold(),
        Severity::Watch => rule.watch_threshold(),
        Severity::Ok => rule.limit,
    }
}
