//! Hysteresis alert state machine
//!
//! Converts the raw per-observation level from [`crate::rules`] into
//! edge-triggered [`AlertEvent`]s:
//!
//! - a more severe level must be seen `escalate_n` times in a row before the
//!   species moves to it (levels may be skipped on the way up)
//! - a less severe level must be seen `deescalate_n` times in a row, and then
//!   the species steps down exactly one level
//! - an observation equal to the current level clears both counters
//!
//! Events are only produced when the severity actually changes.

use crate::rules::threshold_for;
use outfall_core::permit::{DEFAULT_DEESCALATE_N, DEFAULT_ESCALATE_N};
use outfall_core::{AlertEvent, Permit, Reading, Severity};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Alert state for one species
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AlertState {
    pub severity: Severity,
    pub consecutive_exceed: u32,
    pub consecutive_ok: u32,
    pub last_emitted: Option<Severity>,
}

/// Per-species alert state, owned by a single shard
pub struct AlertStateMachine {
    permit: Arc<Permit>,
    states: HashMap<String, AlertState>,
}

impl AlertStateMachine {
    pub fn new(permit: Arc<Permit>) -> Self {
        Self {
            permit,
            states: HashMap::new(),
        }
    }

    /// Feed one observation; returns an event iff the severity changed
    pub fn transition(
        &mut self,
        reading: &Reading,
        level: Severity,
        window_avg: f64,
    ) -> Option<AlertEvent> {
        let rule = self.permit.get(reading.species());
        let (escalate_n, deescalate_n) = rule
            .map(|r| (r.escalate_n, r.deescalate_n))
            .unwrap_or((DEFAULT_ESCALATE_N, DEFAULT_DEESCALATE_N));

        let state = self
            .states
            .entry(reading.species().to_string())
            .or_default();
        let previous = state.severity;

        if level > state.severity {
            state.consecutive_exceed += 1;
            state.consecutive_ok = 0;
            if state.consecutive_exceed < escalate_n {
                return None;
            }
            state.severity = level;
        } else if level < state.severity {
            state.consecutive_ok += 1;
            state.consecutive_exceed = 0;
            if state.consecutive_ok < deescalate_n {
                return None;
            }
            state.severity = state.severity.step_down();
        } else {
            state.consecutive_exceed = 0;
            state.consecutive_ok = 0;
            return None;
        }

        state.consecutive_exceed = 0;
        state.consecutive_ok = 0;
        if state.severity == previous {
            return None;
        }
        state.last_emitted = Some(state.severity);

        debug!(
            species = reading.species(),
            from = %previous,
            to = %state.severity,
            value = reading.value(),
            "Alert transition"
        );

        Some(AlertEvent {
            species: reading.species().to_string(),
            severity: state.severity,
            previous,
            value: reading.value(),
            threshold: rule
                .map(|r| threshold_for(state.severity, r))
                .unwrap_or(0.0),
            window_avg,
            triggered_at: reading.timestamp(),
            action: rule.and_then(|r| r.action.clone()),
        })
    }

    /// Current state; OK with zeroed counters for unseen species
    pub fn state(&self, species: &str) -> AlertState {
        self.states.get(species).copied().unwrap_or_default()
    }

    /// Return a species to OK with zeroed counters
    pub fn reset(&mut self, species: &str) -> bool {
        self.states.remove(species).is_some()
    }

    pub fn states(&self) -> impl Iterator<Item = (&str, &AlertState)> {
        self.states.iter().map(|(k, v)| (k.as_str(), v))
    }
}
