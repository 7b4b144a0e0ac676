//! Service configuration
//!
//! Everything tunable lives here, read from the environment with
//! sensible defaults. `from_env_map` exists so tests can feed a plain
//! map instead of mutating process env.

use std::collections::HashMap;
use std::net::SocketAddr;

use thiserror::Error;

use crate::heat::{HeatConfig, HeatThresholds, HeatWeights};
use crate::protocol::ReconnectPolicy;
use crate::session::SessionConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// Geohash precision for all cell resolution.
    pub cell_precision: u8,
    /// Recently-seen event ids remembered for ingest dedup.
    pub dedup_window: usize,
    /// Events retained per cell for ribbon reads.
    pub backlog_capacity: usize,
    pub heat: HeatConfig,
    pub session: SessionConfig,
    /// Advertised to clients in the `connected` handshake.
    pub reconnect: ReconnectPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            cell_precision: 6,
            dedup_window: 10_000,
            backlog_capacity: 50,
            heat: HeatConfig::default(),
            session: SessionConfig::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.clone(),
        }),
        None => Ok(default),
    }
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(&std::env::vars().collect())
    }

    pub fn from_env_map(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let cell_precision = parse_var(vars, "FEED_CELL_PRECISION", defaults.cell_precision)?;

        let heat = HeatConfig {
            window_hours: parse_var(vars, "FEED_WINDOW_HOURS", defaults.heat.window_hours)?,
            weights: HeatWeights {
                save: parse_var(vars, "FEED_SAVE_WEIGHT", defaults.heat.weights.save)?,
                message: parse_var(vars, "FEED_MESSAGE_WEIGHT", defaults.heat.weights.message)?,
                listing: parse_var(vars, "FEED_LISTING_WEIGHT", defaults.heat.weights.listing)?,
                volume: parse_var(vars, "FEED_VOLUME_WEIGHT", defaults.heat.weights.volume)?,
            },
            thresholds: HeatThresholds {
                warm: parse_var(vars, "FEED_WARM_THRESHOLD", defaults.heat.thresholds.warm)?,
                hot: parse_var(vars, "FEED_HOT_THRESHOLD", defaults.heat.thresholds.hot)?,
                fire: parse_var(vars, "FEED_FIRE_THRESHOLD", defaults.heat.thresholds.fire)?,
            },
            trending_top_k: parse_var(vars, "FEED_TRENDING_TOP_K", defaults.heat.trending_top_k)?,
        };

        let session = SessionConfig {
            sweep_interval_secs: parse_var(
                vars,
                "FEED_SWEEP_INTERVAL_SECS",
                defaults.session.sweep_interval_secs,
            )?,
            stale_timeout_secs: parse_var(
                vars,
                "FEED_STALE_TIMEOUT_SECS",
                defaults.session.stale_timeout_secs,
            )?,
            queue_capacity: parse_var(
                vars,
                "FEED_QUEUE_CAPACITY",
                defaults.session.queue_capacity,
            )?,
            strike_limit: parse_var(vars, "FEED_STRIKE_LIMIT", defaults.session.strike_limit)?,
            default_radius_miles: parse_var(
                vars,
                "FEED_DEFAULT_RADIUS_MILES",
                defaults.session.default_radius_miles,
            )?,
            min_radius_miles: parse_var(
                vars,
                "FEED_MIN_RADIUS_MILES",
                defaults.session.min_radius_miles,
            )?,
            max_radius_miles: parse_var(
                vars,
                "FEED_MAX_RADIUS_MILES",
                defaults.session.max_radius_miles,
            )?,
            cell_precision,
        };

        Ok(Config {
            bind_addr: parse_var(vars, "FEED_BIND_ADDR", defaults.bind_addr)?,
            cell_precision,
            dedup_window: parse_var(vars, "FEED_DEDUP_WINDOW", defaults.dedup_window)?,
            backlog_capacity: parse_var(
                vars,
                "FEED_BACKLOG_CAPACITY",
                defaults.backlog_capacity,
            )?,
            heat,
            session,
            reconnect: ReconnectPolicy {
                max_attempts: parse_var(
                    vars,
                    "FEED_RECONNECT_MAX_ATTEMPTS",
                    defaults.reconnect.max_attempts,
                )?,
                initial_delay_ms: parse_var(
                    vars,
                    "FEED_RECONNECT_INITIAL_DELAY_MS",
                    defaults.reconnect.initial_delay_ms,
                )?,
                backoff_factor: parse_var(
                    vars,
                    "FEED_RECONNECT_BACKOFF_FACTOR",
                    defaults.reconnect.backoff_factor,
                )?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_env() {
        let config = Config::from_env_map(&HashMap::new()).unwrap();
        assert_eq!(config.cell_precision, 6);
        assert_eq!(config.backlog_capacity, 50);
        assert_eq!(config.heat.window_hours, 24);
        assert_eq!(config.heat.weights.save, 25.0);
        assert_eq!(config.session.stale_timeout_secs, 90);
        assert_eq!(config.bind_addr.port(), 8080);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<String, String> = [
            ("FEED_CELL_PRECISION", "5"),
            ("FEED_WINDOW_HOURS", "6"),
            ("FEED_BIND_ADDR", "127.0.0.1:9000"),
            ("FEED_STRIKE_LIMIT", "2"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let config = Config::from_env_map(&vars).unwrap();
        assert_eq!(config.cell_precision, 5);
        assert_eq!(config.heat.window_hours, 6);
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.session.strike_limit, 2);
        // precision flows into session coverage resolution
        assert_eq!(config.session.cell_precision, 5);
    }

    #[test]
    fn test_invalid_value_is_rejected() {
        let vars: HashMap<String, String> =
            [("FEED_WINDOW_HOURS".to_string(), "soon".to_string())]
                .into_iter()
                .collect();
        let err = Config::from_env_map(&vars).unwrap_err();
        assert!(err.to_string().contains("FEED_WINDOW_HOURS"));
    }
}
