//! Process configuration: listen port, upstream URL, asset table, rate
//! limits and logging, loaded once at startup.

use std::collections::HashMap;

use anyhow::{Context, Result};
use rustc_hash::FxHashMap;
use serde::Deserialize;

/// One row of the asset-name → id table (loaded from YAML at startup).
#[derive(Debug, Clone, Deserialize)]
pub struct AssetRow {
    pub name: String,
    pub id: u32,
}

/// Per-event-class rate limit.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitRow {
    pub interval_ms: u64,
    pub max_per_window: u32,
}

/// Logging configuration, same shape the rest of this kind of service uses:
/// level, destination directory, rotation policy, and text/JSON framing.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_log_file")]
    pub log_file: String,
    /// "hourly" | "daily" | "never"
    #[serde(default = "default_rotation")]
    pub rotation: String,
    #[serde(default)]
    pub use_json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_log_file() -> String {
    "proxy.log".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_dir: default_log_dir(),
            log_file: default_log_file(),
            rotation: default_rotation(),
            use_json: false,
        }
    }
}

/// Raw on-disk config file shape.
#[derive(Debug, Clone, Deserialize, Default)]
struct ConfigFile {
    assets: Vec<AssetRow>,
    #[serde(default)]
    rate_limits: HashMap<String, RateLimitRow>,
    #[serde(default)]
    logging: LoggingConfig,
}

/// Fully resolved process configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub upstream_url: String,
    pub assets: Vec<AssetRow>,
    pub rate_limits: FxHashMap<String, RateLimitRow>,
    pub logging: LoggingConfig,
}

/// Default rate limits for the high-frequency event classes, used when
/// the config file doesn't override them.
fn default_rate_limits() -> FxHashMap<String, RateLimitRow> {
    let window = RateLimitRow {
        interval_ms: 100,
        max_per_window: 1,
    };
    [
        "candles".to_string(),
        "positions".to_string(),
        "balance-changed".to_string(),
        "pressure".to_string(),
    ]
    .into_iter()
    .map(|name| (name, window))
    .collect()
}

impl AppConfig {
    /// Load configuration from environment variables (`PORT`,
    /// `UPSTREAM_URL`, `ASSETS_CONFIG`) plus the YAML file they point at.
    pub fn load() -> Result<Self> {
        let port: u16 = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);

        let upstream_url = std::env::var("UPSTREAM_URL")
            .unwrap_or_else(|_| "wss://ws.example-upstream.com/echo/websocket".to_string());

        let config_path =
            std::env::var("ASSETS_CONFIG").unwrap_or_else(|_| "config/assets.yaml".to_string());

        let file: ConfigFile = match std::fs::read_to_string(&config_path) {
            Ok(raw) => serde_yaml::from_str(&raw)
                .with_context(|| format!("parsing asset config at {config_path}"))?,
            Err(_) => ConfigFile {
                assets: default_asset_table(),
                ..Default::default()
            },
        };

        let mut rate_limits = default_rate_limits();
        rate_limits.extend(file.rate_limits);

        Ok(Self {
            port,
            upstream_url,
            assets: file.assets,
            rate_limits,
            logging: file.logging,
        })
    }

    pub fn rate_limit_for(&self, event_class: &str) -> RateLimitRow {
        self.rate_limits
            .get(event_class)
            .copied()
            .unwrap_or(RateLimitRow {
                interval_ms: 100,
                max_per_window: 5,
            })
    }
}

/// Built-in fallback table so the proxy boots without a config file present
/// (dev/test convenience). Mirrors the handful of instruments the startup
/// handshake burst subscribes to by default.
fn default_asset_table() -> Vec<AssetRow> {
    vec![
        AssetRow {
            name: "EURUSD-OTC".to_string(),
            id: 76,
        },
        AssetRow {
            name: "GBPUSD-OTC".to_string(),
            id: 77,
        },
        AssetRow {
            name: "AUDCAD-OTC".to_string(),
            id: 96,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_config_file_deserializes() {
        let yaml = r#"
assets:
  - name: "EURUSD-OTC"
    id: 76
  - name: "GBPUSD-OTC"
    id: 77
rate_limits:
  candles:
    interval_ms: 80
    max_per_window: 1
logging:
  log_level: "debug"
"#;
        let file: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(file.assets.len(), 2);
        assert_eq!(file.assets[0].id, 76);
        assert_eq!(file.rate_limits["candles"].interval_ms, 80);
        assert_eq!(file.logging.log_level, "debug");
        assert_eq!(file.logging.log_dir, "logs");
    }

    #[test]
    fn default_rate_limits_cover_high_frequency_classes() {
        let limits = default_rate_limits();
        for class in ["candles", "positions", "balance-changed", "pressure"] {
            assert!(limits.contains_key(class));
        }
    }

    #[test]
    fn rate_limit_for_unknown_class_falls_back() {
        let config = AppConfig {
            port: 8080,
            upstream_url: "wss://example".to_string(),
            assets: vec![],
            rate_limits: FxHashMap::default(),
            logging: LoggingConfig::default(),
        };
        let row = config.rate_limit_for("unheard-of-class");
        assert_eq!(row.max_per_window, 5);
    }
}

