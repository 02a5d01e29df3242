//! Effluent readings and raw feed records

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};

/// A single concentration measurement for one species
///
/// Fields are private so a `Reading` can only exist in validated form:
/// non-empty species, finite timestamp (seconds) and finite value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    species: String,
    timestamp: f64,
    value: f64,
}

impl Reading {
    /// Create a validated reading
    pub fn new(
        species: impl Into<String>,
        timestamp: f64,
        value: f64,
    ) -> Result<Self, PipelineError> {
        let species = species.into();
        let species = species.trim();
        if species.is_empty() {
            return Err(PipelineError::Validation("species is empty".to_string()));
        }
        if !timestamp.is_finite() {
            return Err(PipelineError::Validation(format!(
                "timestamp for '{species}' is not finite"
            )));
        }
        if !value.is_finite() {
            return Err(PipelineError::Validation(format!(
                "concentration for '{species}' is not finite"
            )));
        }

        Ok(Self {
            species: species.to_string(),
            timestamp,
            value,
        })
    }

    pub fn species(&self) -> &str {
        &self.species
    }

    /// Seconds on the feed's timeline
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

/// Record shape delivered by external feed adapters
///
/// Accepts both `timestamp`/`time` and `concentration`/`value` spellings.
/// Every field is optional so incomplete records deserialize and are then
/// rejected by [`Reading::try_from`] with a [`PipelineError::Validation`].
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawRecord {
    #[serde(default, alias = "time")]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub species: Option<String>,
    #[serde(default, alias = "value")]
    pub concentration: Option<f64>,
}

impl TryFrom<RawRecord> for Reading {
    type Error = PipelineError;

    fn try_from(raw: RawRecord) -> Result<Self, Self::Error> {
        let species = raw
            .species
            .ok_or_else(|| PipelineError::Validation("missing species".to_string()))?;
        let timestamp = raw.timestamp.ok_or_else(|| {
            PipelineError::Validation(format!("missing timestamp for '{species}'"))
        })?;
        let value = raw.concentration.ok_or_else(|| {
            PipelineError::Validation(format!("missing concentration for '{species}'"))
        })?;
        Reading::new(species, timestamp, value)
    }
}
