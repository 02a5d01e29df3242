//! Regulatory permit definitions
//!
//! A [`Permit`] maps each monitored species to a [`PermitRule`]. It is loaded
//! once at startup and shared read-only by every shard.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Consecutive exceeding observations required to escalate
pub const DEFAULT_ESCALATE_N: u32 = 3;
/// Consecutive calmer observations required to step down one level
pub const DEFAULT_DEESCALATE_N: u32 = 3;
/// Fraction of the limit at which the window average raises WATCH
pub const DEFAULT_WATCH_RATIO: f64 = 0.9;
/// Fraction of the limit at which a single value raises WARNING
pub const DEFAULT_WARNING_RATIO: f64 = 1.0;
/// Fraction of the limit at which a single value raises CRITICAL
pub const DEFAULT_CRITICAL_RATIO: f64 = 1.5;

fn default_escalate_n() -> u32 {
    DEFAULT_ESCALATE_N
}

fn default_deescalate_n() -> u32 {
    DEFAULT_DEESCALATE_N
}

fn default_watch_ratio() -> f64 {
    DEFAULT_WATCH_RATIO
}

fn default_warning_ratio() -> f64 {
    DEFAULT_WARNING_RATIO
}

fn default_critical_ratio() -> f64 {
    DEFAULT_CRITICAL_RATIO
}

/// Compliance rule for one species
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermitRule {
    /// Permitted concentration
    pub limit: f64,
    /// Rolling window length in seconds
    pub window_seconds: f64,
    #[serde(default = "default_escalate_n")]
    pub escalate_n: u32,
    #[serde(default = "default_deescalate_n")]
    pub deescalate_n: u32,
    /// Remediation text attached to alert events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default = "default_watch_ratio")]
    pub watch_ratio: f64,
    #[serde(default = "default_warning_ratio")]
    pub warning_ratio: f64,
    #[serde(default = "default_critical_ratio")]
    pub critical_ratio: f64,
}

impl PermitRule {
    /// Rule with default hysteresis and ratios
    pub fn new(limit: f64, window_seconds: f64) -> Self {
        Self {
            limit,
            window_seconds,
            escalate_n: DEFAULT_ESCALATE_N,
            deescalate_n: DEFAULT_DEESCALATE_N,
            action: None,
            watch_ratio: DEFAULT_WATCH_RATIO,
            warning_ratio: DEFAULT_WARNING_RATIO,
            critical_ratio: DEFAULT_CRITICAL_RATIO,
        }
    }

    pub fn with_hysteresis(mut self, escalate_n: u32, deescalate_n: u32) -> Self {
        self.escalate_n = escalate_n;
        self.deescalate_n = deescalate_n;
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_ratios(mut self, watch: f64, warning: f64, critical: f64) -> Self {
        self.watch_ratio = watch;
        self.warning_ratio = warning;
        self.critical_ratio = critical;
        self
    }

    /// Concentration at which a single value is WARNING
    pub fn warning_threshold(&self) -> f64 {
        self.limit * self.warning_ratio
    }

    /// Concentration at which a single value is CRITICAL
    pub fn critical_threshold(&self) -> f64 {
        self.limit * self.critical_ratio
    }

    /// Window average at which the species is on WATCH
    pub fn watch_threshold(&self) -> f64 {
        self.limit * self.watch_ratio
    }

    /// Check the rule is usable
    pub fn validate(&self, species: &str) -> Result<(), PipelineError> {
        let invalid = |what: &str| {
            Err(PipelineError::Configuration(format!(
                "permit for '{species}': {what}"
            )))
        };

        if !self.limit.is_finite() || self.limit <= 0.0 {
            return invalid("limit must be a positive number");
        }
        if !self.window_seconds.is_finite() || self.window_seconds <= 0.0 {
            return invalid("window_seconds must be a positive number");
        }
        if self.escalate_n == 0 || self.deescalate_n == 0 {
            return invalid("escalate_n and deescalate_n must be at least 1");
        }
        let ratios = [self.watch_ratio, self.warning_ratio, self.critical_ratio];
        if ratios.iter().any(|r| !r.is_finite() || *r <= 0.0) {
            return invalid("ratios must be positive numbers");
        }
        if self.watch_ratio > self.warning_ratio || self.warning_ratio > self.critical_ratio {
            return invalid("ratios must satisfy watch <= warning <= critical");
        }
        Ok(())
    }
}

/// Species to rule mapping
///
/// Serialized as a plain JSON object keyed by species:
///
/// ```
/// use outfall_core::Permit;
///
/// let permit = Permit::from_json(r#"{"SO4": {"limit": 250.0, "window_seconds": 300}}"#).unwrap();
/// assert_eq!(permit.get("SO4").unwrap().escalate_n, 3);
/// assert!(permit.get("Cu").is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permit {
    rules: BTreeMap<String, PermitRule>,
}

impl Permit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule (builder style)
    pub fn with_rule(mut self, species: impl Into<String>, rule: PermitRule) -> Self {
        self.insert(species, rule);
        self
    }

    pub fn insert(&mut self, species: impl Into<String>, rule: PermitRule) {
        self.rules.insert(species.into(), rule);
    }

    pub fn get(&self, species: &str) -> Option<&PermitRule> {
        self.rules.get(species)
    }

    pub fn species(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Validate every rule; an empty permit is a configuration error
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.rules.is_empty() {
            return Err(PipelineError::Configuration(
                "permit defines no species".to_string(),
            ));
        }
        for (species, rule) in &self.rules {
            if species.trim().is_empty() {
                return Err(PipelineError::Configuration(
                    "permit contains an empty species name".to_string(),
                ));
            }
            rule.validate(species)?;
        }
        Ok(())
    }

    /// Parse and validate a permit document
    pub fn from_json(json: &str) -> Result<Self, PipelineError> {
        let permit: Permit = serde_json::from_str(json)
            .map_err(|e| PipelineError::Configuration(format!("invalid permit document: {e}")))?;
        permit.validate()?;
        Ok(permit)
    }

    /// Built-in permit used when no permit file is configured
    ///
    /// Limits in mg/L over a five minute window.
    pub fn default_effluent() -> Self {
        Permit::new()
            .with_rule(
                "SO4",
                PermitRule::new(250.0, 300.0).with_action(
                    "Increase lime dosing; verify gypsum precipitation; reduce discharge rate.",
                ),
            )
            .with_rule(
                "As",
                PermitRule::new(0.01, 300.0).with_action(
                    "Adjust pH to 7-8; add ferric coagulant; check filter performance.",
                ),
            )
            .with_rule(
                "Ni",
                PermitRule::new(0.1, 300.0).with_action(
                    "Increase ion exchange cycle; ensure resin regeneration; check chelation dosing.",
                ),
            )
    }
}
