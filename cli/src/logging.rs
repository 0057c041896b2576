//! Logging setup for the `blockgraph` binary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log levels, optionally per component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default level: "trace" | "debug" | "info" | "warn" | "error"
    #[serde(default = "default_level")]
    pub level: String,
    /// Per-component overrides, e.g. `blockgraph-pipeline` → `debug`.
    #[serde(default)]
    pub components: BTreeMap<String, String>,
    /// JSON lines instead of human-readable text.
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: BTreeMap::new(),
            json: false,
        }
    }
}

impl LogConfig {
    /// Read `BLOCKGRAPH_LOG` (`"warn,blockgraph-storage=debug"` or a JSON
    /// `LogConfig`) and `BLOCKGRAPH_LOG_JSON`.
    pub fn from_env() -> Self {
        let mut config = match std::env::var("BLOCKGRAPH_LOG") {
            Ok(raw) => Self::parse(&raw),
            Err(_) => Self::default(),
        };
        if let Ok(json) = std::env::var("BLOCKGRAPH_LOG_JSON") {
            config.json = matches!(json.as_str(), "1" | "true" | "yes");
        }
        config
    }

    fn parse(raw: &str) -> Self {
        if raw.trim_start().starts_with('{') {
            if let Ok(config) = serde_json::from_str(raw) {
                return config;
            }
        }
        let mut config = Self::default();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.split_once('=') {
                Some((component, level)) => {
                    config.components.insert(component.to_string(), level.to_string());
                }
                None => config.level = part.to_string(),
            }
        }
        config
    }

    /// Filter directives, e.g. `info,blockgraph_pipeline=debug`.
    pub fn directives(&self) -> String {
        let mut directives = self.level.clone();
        for (component, level) in &self.components {
            directives.push_str(&format!(",{}={}", component.replace('-', "_"), level));
        }
        directives
    }
}

/// Install the global subscriber. Call once at startup.
pub fn init_tracing(config: &LogConfig) {
    let filter = EnvFilter::try_new(config.directives()).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
