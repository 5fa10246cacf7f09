use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};

fn default_port() -> u16 {
    8080
}

fn default_max_connections() -> usize {
    2000
}

fn default_max_header_size() -> usize {
    8192
}

fn default_max_entry_size() -> u64 {
    10 * 1024 * 1024 // 10 MiB
}

fn default_cache_capacity() -> u64 {
    100 * 1024 * 1024 // 100 MiB
}

fn default_client_timeout() -> u64 {
    30
}

fn default_upstream_connect_timeout() -> u64 {
    30
}

fn default_tunnel_idle_timeout() -> u64 {
    120
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_max_entry_size")]
    pub max_entry_size: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect_timeout: u64,
    #[serde(default = "default_tunnel_idle_timeout")]
    pub tunnel_idle_timeout: u64,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = resolve_config_path(cli) {
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("STASHPROXY")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        if let Some(port) = cli.parsed_port() {
            settings.port = port;
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port))
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout)
    }

    pub fn tunnel_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.tunnel_idle_timeout)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_connections > 0,
            "max_connections must be at least 1 (got {})",
            self.max_connections
        );
        ensure!(
            self.max_header_size > 0,
            "max_header_size must be greater than 0 (got {})",
            self.max_header_size
        );
        ensure!(
            self.max_entry_size > 0,
            "max_entry_size must be greater than 0 (got {})",
            self.max_entry_size
        );
        ensure!(
            self.cache_capacity >= self.max_entry_size,
            "cache_capacity must be at least max_entry_size ({} < {})",
            self.cache_capacity,
            self.max_entry_size
        );
        ensure!(
            self.client_timeout > 0,
            "client_timeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        ensure!(
            self.upstream_connect_timeout > 0,
            "upstream_connect_timeout must be greater than 0 seconds (got {})",
            self.upstream_connect_timeout
        );
        ensure!(
            self.tunnel_idle_timeout > 0,
            "tunnel_idle_timeout must be greater than 0 seconds (got {})",
            self.tunnel_idle_timeout
        );
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: default_port(),
            max_connections: default_max_connections(),
            max_header_size: default_max_header_size(),
            max_entry_size: default_max_entry_size(),
            cache_capacity: default_cache_capacity(),
            client_timeout: default_client_timeout(),
            upstream_connect_timeout: default_upstream_connect_timeout(),
            tunnel_idle_timeout: default_tunnel_idle_timeout(),
            log: default_log_format(),
        }
    }
}

impl Cli {
    /// The listening port requested on the command line, if it parses as a
    /// decimal port in [1, 65535]. Anything else falls back to the
    /// configured default.
    pub fn parsed_port(&self) -> Option<u16> {
        self.port
            .as_deref()
            .map(str::trim)
            .filter(|raw| !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|raw| raw.parse::<u16>().ok())
            .filter(|port| *port != 0)
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

fn resolve_config_path(cli: &Cli) -> Option<PathBuf> {
    if let Some(path) = cli.config.as_deref() {
        return Some(path.to_path_buf());
    }

    default_config_candidates()
        .into_iter()
        .find(|candidate| candidate.exists())
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("stashproxy.toml"),
        PathBuf::from("/etc/stashproxy/stashproxy.toml"),
    ]
}
