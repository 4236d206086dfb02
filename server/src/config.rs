//! Server configuration loaded from a TOML file.
//!
//! Every field has a default, so an empty file (or no file at all) yields
//! a runnable configuration. Unknown fields are rejected.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Server name; used in connection names and thread names.
    #[serde(default = "default_name")]
    pub name: String,

    /// Listen address.
    #[serde(default = "default_address")]
    pub address: SocketAddr,

    /// Number of io loop threads. Zero serves connections on the base
    /// loop.
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Seconds of silence before a connection is force-closed. Zero
    /// disables the idle timer.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Enable `SO_REUSEPORT` on the listening socket.
    #[serde(default)]
    pub reuse_port: bool,

    /// Disable Nagle on accepted connections.
    #[serde(default = "default_true")]
    pub tcp_no_delay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            address: default_address(),
            threads: default_threads(),
            idle_timeout_secs: default_idle_timeout(),
            reuse_port: false,
            tcp_no_delay: true,
        }
    }
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        if self.idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.idle_timeout_secs))
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level filter; overridden by `RUST_LOG` when set.
    #[serde(default = "default_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Include timestamps in output.
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include thread names in output.
    #[serde(default = "default_true")]
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
            timestamps: true,
            thread_names: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// The default configuration, annotated, for `--print-config`.
    pub fn default_toml() -> &'static str {
        r#"[server]
name = "girder"
address = "0.0.0.0:8080"
# io loop threads; 0 serves connections on the base loop
threads = 4
# seconds of silence before a connection is closed; 0 disables
idle_timeout_secs = 60
reuse_port = false
tcp_no_delay = true

[logging]
# trace | debug | info | warn | error (RUST_LOG overrides)
level = "info"
# pretty | compact | json
format = "pretty"
timestamps = true
thread_names = true
"#
    }
}

fn default_name() -> String {
    "girder".to_string()
}

fn default_address() -> SocketAddr {
    "0.0.0.0:8080".parse().expect("default address is valid")
}

fn default_threads() -> usize {
    4
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}
