//! Alert events and the wire envelope

use crate::reading::Reading;
use crate::severity::Severity;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Emitted once per alert state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub species: String,
    pub severity: Severity,
    pub previous: Severity,
    /// Value of the reading that completed the transition
    pub value: f64,
    /// Threshold of the new severity (limit for OK)
    pub threshold: f64,
    pub window_avg: f64,
    /// Timestamp of the reading that completed the transition
    pub triggered_at: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl AlertEvent {
    pub fn is_escalation(&self) -> bool {
        self.severity > self.previous
    }
}

/// Envelope kind, doubling as the subscription topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    #[serde(alias = "readings")]
    Reading,
    #[serde(alias = "alerts")]
    Alert,
}

impl Topic {
    pub const ALL: [Topic; 2] = [Topic::Reading, Topic::Alert];

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Reading => "reading",
            Topic::Alert => "alert",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server to subscriber message
///
/// ```
/// use outfall_core::{Envelope, Reading, Topic};
///
/// let reading = Reading::new("SO4", 12.0, 180.5).unwrap();
/// let env = Envelope::reading(&reading);
/// assert_eq!(env.kind, Topic::Reading);
/// let json = serde_json::to_string(&env).unwrap();
/// assert!(json.starts_with(r#"{"type":"reading""#));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: Topic,
    pub species: String,
    pub timestamp: f64,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_avg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl Envelope {
    pub fn reading(reading: &Reading) -> Self {
        Self {
            kind: Topic::Reading,
            species: reading.species().to_string(),
            timestamp: reading.timestamp(),
            value: reading.value(),
            severity: None,
            threshold: None,
            window_avg: None,
            previous: None,
            action: None,
        }
    }

    pub fn alert(event: &AlertEvent) -> Self {
        Self {
            kind: Topic::Alert,
            species: event.species.clone(),
            timestamp: event.triggered_at,
            value: event.value,
            severity: Some(event.severity),
            threshold: Some(event.threshold),
            window_avg: Some(event.window_avg),
            previous: Some(event.previous),
            action: event.action.clone(),
        }
    }

    pub fn topic(&self) -> Topic {
        self.kind
    }

    /// CRITICAL alerts are never evicted by backpressure
    pub fn is_critical(&self) -> bool {
        self.kind == Topic::Alert && self.severity.is_some_and(Severity::is_critical)
    }
}

/// Envelope relayed between cooperating instances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanOutMessage {
    pub origin_instance_id: String,
    pub event_id: String,
    pub payload: Envelope,
}
