//! Alert severity levels

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed, ordered set of alert levels
///
/// The derived ordering is the escalation order: `Ok < Watch < Warning < Critical`.
/// Escalation may jump levels; de-escalation only ever moves one step via
/// [`Severity::step_down`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Ok,
    Watch,
    Warning,
    Critical,
}

impl Severity {
    /// Every level, least severe first
    pub const ALL: [Severity; 4] = [
        Severity::Ok,
        Severity::Watch,
        Severity::Warning,
        Severity::Critical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Ok => "ok",
            Severity::Watch => "watch",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    /// The next lower level (`Ok` stays `Ok`)
    pub fn step_down(self) -> Severity {
        match self {
            Severity::Critical => Severity::Warning,
            Severity::Warning => Severity::Watch,
            Severity::Watch | Severity::Ok => Severity::Ok,
        }
    }

    pub fn is_critical(self) -> bool {
        self == Severity::Critical
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ok" => Ok(Severity::Ok),
            "watch" => Ok(Severity::Watch),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}
