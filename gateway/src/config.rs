//! Configuration loaded from `OUTFALL_*` environment variables

use crate::error::{GatewayError, Result};
use outfall_core::Permit;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(GatewayError::Config(format!(
                "OUTFALL_LOG_FORMAT: unknown format '{other}'"
            ))),
        }
    }
}

/// Gateway configuration
///
/// | Variable | Default |
/// |---|---|
/// | `OUTFALL_LISTEN_ADDR` | `0.0.0.0:8080` |
/// | `OUTFALL_METRICS_ADDR` | `0.0.0.0:9090` |
/// | `OUTFALL_LOG_LEVEL` | `info` |
/// | `OUTFALL_LOG_FORMAT` | `pretty` |
/// | `OUTFALL_PERMIT_FILE` | built-in permit |
/// | `OUTFALL_SHARDS` | `4` |
/// | `OUTFALL_CHANNEL_CAPACITY` | `1024` |
/// | `OUTFALL_QUEUE_CAPACITY` | `256` |
/// | `OUTFALL_SLOW_CONSUMER_GRACE_MS` | `5000` |
/// | `OUTFALL_RATE_PER_SEC` | `20` |
/// | `OUTFALL_RATE_BURST` | `40` |
/// | `OUTFALL_MAX_INBOUND_BYTES` | `4096` |
/// | `OUTFALL_MAX_OUTBOUND_BYTES` | `65536` |
/// | `OUTFALL_API_TOKEN` | unset (open) |
/// | `OUTFALL_METRICS_TOKEN` | `OUTFALL_API_TOKEN` |
/// | `OUTFALL_PROTECT_METRICS` | `false` |
/// | `OUTFALL_API_RATE_PER_SEC` | `10` (0 = unlimited) |
/// | `OUTFALL_RELAY_CHANNEL` | unset (no fan-out) |
/// | `OUTFALL_INSTANCE_ID` | `outfall-<pid>` |
/// | `OUTFALL_DEDUP_WINDOW_SECS` | `60` |
/// | `OUTFALL_OUT_OF_ORDER_TOLERANCE` | `0` |
/// | `OUTFALL_HEARTBEAT_SECS` | `15` |
/// | `OUTFALL_IDLE_TIMEOUT_SECS` | `60` |
/// | `OUTFALL_RECENT_CAPACITY` | `1024` |
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub metrics_addr: SocketAddr,
    pub log_level: String,
    pub log_format: LogFormat,
    pub permit_file: Option<PathBuf>,
    pub shards: usize,
    pub channel_capacity: usize,
    /// Per-connection outbound queue size (K)
    pub queue_capacity: usize,
    pub slow_consumer_grace: Duration,
    pub rate_per_sec: f64,
    pub rate_burst: u32,
    pub max_inbound_bytes: usize,
    pub max_outbound_bytes: usize,
    pub api_token: Option<String>,
    /// Separate secret for `/metrics`; falls back to `api_token`
    pub metrics_token: Option<String>,
    pub protect_metrics: bool,
    /// Status API requests per second per client and path
    pub api_rate_per_sec: u32,
    pub relay_channel: Option<String>,
    pub instance_id: String,
    pub dedup_window: Duration,
    /// Seconds a reading may lag the species' latest timestamp
    pub out_of_order_tolerance: f64,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub recent_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            permit_file: None,
            shards: 4,
            channel_capacity: 1024,
            queue_capacity: 256,
            slow_consumer_grace: Duration::from_secs(5),
            rate_per_sec: 20.0,
            rate_burst: 40,
            max_inbound_bytes: 4096,
            max_outbound_bytes: 65536,
            api_token: None,
            metrics_token: None,
            protect_metrics: false,
            api_rate_per_sec: 10,
            relay_channel: None,
            instance_id: format!("outfall-{}", std::process::id()),
            dedup_window: Duration::from_secs(60),
            out_of_order_tolerance: 0.0,
            heartbeat_interval: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(60),
            recent_capacity: 1024,
        }
    }
}

impl Config {
    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("OUTFALL_LISTEN_ADDR") {
            config.listen_addr = parse("OUTFALL_LISTEN_ADDR", &v)?;
        }
        if let Some(v) = get("OUTFALL_METRICS_ADDR") {
            config.metrics_addr = parse("OUTFALL_METRICS_ADDR", &v)?;
        }
        if let Some(v) = get("OUTFALL_LOG_LEVEL") {
            config.log_level = v;
        }
        if let Some(v) = get("OUTFALL_LOG_FORMAT") {
            config.log_format = v.parse()?;
        }
        config.permit_file = get("OUTFALL_PERMIT_FILE").map(PathBuf::from);
        if let Some(v) = get("OUTFALL_SHARDS") {
            config.shards = parse("OUTFALL_SHARDS", &v)?;
        }
        if let Some(v) = get("OUTFALL_CHANNEL_CAPACITY") {
            config.channel_capacity = parse("OUTFALL_CHANNEL_CAPACITY", &v)?;
        }
        if let Some(v) = get("OUTFALL_QUEUE_CAPACITY") {
            config.queue_capacity = parse("OUTFALL_QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = get("OUTFALL_SLOW_CONSUMER_GRACE_MS") {
            config.slow_consumer_grace =
                Duration::from_millis(parse("OUTFALL_SLOW_CONSUMER_GRACE_MS", &v)?);
        }
        if let Some(v) = get("OUTFALL_RATE_PER_SEC") {
            config.rate_per_sec = parse("OUTFALL_RATE_PER_SEC", &v)?;
        }
        if let Some(v) = get("OUTFALL_RATE_BURST") {
            config.rate_burst = parse("OUTFALL_RATE_BURST", &v)?;
        }
        if let Some(v) = get("OUTFALL_MAX_INBOUND_BYTES") {
            config.max_inbound_bytes = parse("OUTFALL_MAX_INBOUND_BYTES", &v)?;
        }
        if let Some(v) = get("OUTFALL_MAX_OUTBOUND_BYTES") {
            config.max_outbound_bytes = parse("OUTFALL_MAX_OUTBOUND_BYTES", &v)?;
        }
        config.api_token = get("OUTFALL_API_TOKEN");
        config.metrics_token = get("OUTFALL_METRICS_TOKEN");
        if let Some(v) = get("OUTFALL_PROTECT_METRICS") {
            config.protect_metrics = parse_bool("OUTFALL_PROTECT_METRICS", &v)?;
        }
        if let Some(v) = get("OUTFALL_API_RATE_PER_SEC") {
            config.api_rate_per_sec = parse("OUTFALL_API_RATE_PER_SEC", &v)?;
        }
        config.relay_channel = get("OUTFALL_RELAY_CHANNEL");
        if let Some(v) = get("OUTFALL_INSTANCE_ID") {
            config.instance_id = v;
        }
        if let Some(v) = get("OUTFALL_DEDUP_WINDOW_SECS") {
            config.dedup_window = Duration::from_secs(parse("OUTFALL_DEDUP_WINDOW_SECS", &v)?);
        }
        if let Some(v) = get("OUTFALL_OUT_OF_ORDER_TOLERANCE") {
            config.out_of_order_tolerance = parse("OUTFALL_OUT_OF_ORDER_TOLERANCE", &v)?;
        }
        if let Some(v) = get("OUTFALL_HEARTBEAT_SECS") {
            config.heartbeat_interval = Duration::from_secs(parse("OUTFALL_HEARTBEAT_SECS", &v)?);
        }
        if let Some(v) = get("OUTFALL_IDLE_TIMEOUT_SECS") {
            config.idle_timeout = Duration::from_secs(parse("OUTFALL_IDLE_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("OUTFALL_RECENT_CAPACITY") {
            config.recent_capacity = parse("OUTFALL_RECENT_CAPACITY", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("OUTFALL_SHARDS", self.shards),
            ("OUTFALL_CHANNEL_CAPACITY", self.channel_capacity),
            ("OUTFALL_QUEUE_CAPACITY", self.queue_capacity),
            ("OUTFALL_MAX_INBOUND_BYTES", self.max_inbound_bytes),
            ("OUTFALL_MAX_OUTBOUND_BYTES", self.max_outbound_bytes),
            ("OUTFALL_RECENT_CAPACITY", self.recent_capacity),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(GatewayError::Config(format!("{key} must be greater than 0")));
            }
        }
        if !self.rate_per_sec.is_finite() || self.rate_per_sec <= 0.0 {
            return Err(GatewayError::Config(
                "OUTFALL_RATE_PER_SEC must be a positive number".to_string(),
            ));
        }
        if self.rate_burst == 0 {
            return Err(GatewayError::Config(
                "OUTFALL_RATE_BURST must be greater than 0".to_string(),
            ));
        }
        if !self.out_of_order_tolerance.is_finite() || self.out_of_order_tolerance < 0.0 {
            return Err(GatewayError::Config(
                "OUTFALL_OUT_OF_ORDER_TOLERANCE must be a non-negative number".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() || self.idle_timeout <= self.heartbeat_interval {
            return Err(GatewayError::Config(
                "OUTFALL_IDLE_TIMEOUT_SECS must exceed a non-zero OUTFALL_HEARTBEAT_SECS"
                    .to_string(),
            ));
        }
        if self.protect_metrics && self.effective_metrics_token().is_none() {
            return Err(GatewayError::Config(
                "OUTFALL_PROTECT_METRICS requires OUTFALL_METRICS_TOKEN or OUTFALL_API_TOKEN"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Secret guarding `/metrics` when protection is on
    pub fn effective_metrics_token(&self) -> Option<&str> {
        self.metrics_token.as_deref().or(self.api_token.as_deref())
    }

    /// Load the configured permit file, or the built-in permit when none is set
    ///
    /// A configured file that is missing or invalid is fatal.
    pub fn load_permit(&self) -> Result<Permit> {
        match &self.permit_file {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    GatewayError::Config(format!("permit file {}: {e}", path.display()))
                })?;
                Ok(Permit::from_json(&raw)?)
            }
            None => Ok(Permit::default_effluent()),
        }
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| GatewayError::Config(format!("{key}: invalid value '{value}': {e}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(GatewayError::Config(format!(
            "{key}: expected a boolean, got '{other}'"
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.queue_capacity, 256);
        assert_eq!(config.dedup_window, Duration::from_secs(60));
        assert_eq!(config.out_of_order_tolerance, 0.0);
        assert!(config.relay_channel.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("OUTFALL_LISTEN_ADDR", "127.0.0.1:7000"),
            ("OUTFALL_LOG_FORMAT", "json"),
            ("OUTFALL_QUEUE_CAPACITY", "10"),
            ("OUTFALL_SLOW_CONSUMER_GRACE_MS", "250"),
            ("OUTFALL_RELAY_CHANNEL", "effluent"),
            ("OUTFALL_INSTANCE_ID", "plant-a"),
            ("OUTFALL_API_TOKEN", "s3cret"),
            ("OUTFALL_PROTECT_METRICS", "yes"),
        ]))
        .unwrap();
        assert_eq!(config.listen_addr.port(), 7000);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.queue_capacity, 10);
        assert_eq!(config.slow_consumer_grace, Duration::from_millis(250));
        assert_eq!(config.relay_channel.as_deref(), Some("effluent"));
        assert_eq!(config.instance_id, "plant-a");
        assert!(config.protect_metrics);
    }

    #[test]
    fn test_invalid_number_is_config_error() {
        let err = Config::from_lookup(lookup(&[("OUTFALL_SHARDS", "many")])).unwrap_err();
        assert!(matches!(err, GatewayError::Config(msg) if msg.contains("OUTFALL_SHARDS")));
    }

    #[test]
    fn test_api_rate_setting() {
        assert_eq!(Config::from_lookup(lookup(&[])).unwrap().api_rate_per_sec, 10);
        let config =
            Config::from_lookup(lookup(&[("OUTFALL_API_RATE_PER_SEC", "0")])).unwrap();
        assert_eq!(config.api_rate_per_sec, 0);
        assert!(Config::from_lookup(lookup(&[("OUTFALL_API_RATE_PER_SEC", "-1")])).is_err());
    }

    #[test]
    fn test_zero_queue_rejected() {
        assert!(Config::from_lookup(lookup(&[("OUTFALL_QUEUE_CAPACITY", "0")])).is_err());
    }

    #[test]
    fn test_protect_metrics_needs_token() {
        assert!(Config::from_lookup(lookup(&[("OUTFALL_PROTECT_METRICS", "true")])).is_err());
    }

    #[test]
    fn test_metrics_token_overrides_api_token() {
        let config = Config::from_lookup(lookup(&[
            ("OUTFALL_API_TOKEN", "api"),
            ("OUTFALL_METRICS_TOKEN", "scrape"),
            ("OUTFALL_PROTECT_METRICS", "1"),
        ]))
        .unwrap();
        assert_eq!(config.effective_metrics_token(), Some("scrape"));

        let fallback = Config::from_lookup(lookup(&[("OUTFALL_API_TOKEN", "api")])).unwrap();
        assert_eq!(fallback.effective_metrics_token(), Some("api"));
    }

    #[test]
    fn test_blank_values_are_ignored() {
        let config = Config::from_lookup(lookup(&[("OUTFALL_API_TOKEN", "  ")])).unwrap();
        assert!(config.api_token.is_none());
    }

    #[test]
    fn test_default_permit_when_unset() {
        let permit = Config::default().load_permit().unwrap();
        assert!(permit.get("SO4").is_some());
    }

    #[test]
    fn test_missing_permit_file_is_fatal() {
        let config = Config {
            permit_file: Some(PathBuf::from("/nonexistent/outfall-permit.json")),
            ..Config::default()
        };
        assert!(matches!(
            config.load_permit(),
            Err(GatewayError::Config(_))
        ));
    }
}
