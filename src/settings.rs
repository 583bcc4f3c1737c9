use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, ensure, Result};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_client_timeout() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    30
}

fn default_upstream_connect_timeout() -> u64 {
    5
}

fn default_upstream_timeout() -> u64 {
    60
}

fn default_max_header_size() -> usize {
    32 * 1024
}

fn default_max_response_header_size() -> usize {
    32 * 1024
}

fn default_event_buffer_capacity() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Data-plane listener terminating tenant traffic.
    pub listen: SocketAddr,
    /// Admin-plane listener for the configuration API.
    pub api_listen: SocketAddr,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
    /// Directory holding the per-tenant SQLite databases.
    pub data_dir: PathBuf,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    /// Whole-request deadline enforced at every suspension point.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect_timeout: u64,
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout: u64,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_max_response_header_size")]
    pub max_response_header_size: usize,
    #[serde(default = "default_event_buffer_capacity")]
    pub event_buffer_capacity: usize,
    /// Service-origin bindings: service name → base URL.
    #[serde(default)]
    pub service_bindings: HashMap<String, String>,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli)?;

        builder = builder.add_source(File::from(config_path.clone()).required(true));
        builder = builder.add_source(
            Environment::with_prefix("HOSTGUARD")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.apply_base_dir(&config_path);
        settings.validate()?;
        Ok(settings)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        self.data_dir = absolutize(&self.data_dir, base_dir);
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.client_timeout > 0,
            "client_timeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        ensure!(
            self.request_timeout > 0,
            "request_timeout must be greater than 0 seconds (got {})",
            self.request_timeout
        );
        ensure!(
            self.upstream_connect_timeout > 0,
            "upstream_connect_timeout must be greater than 0 seconds (got {})",
            self.upstream_connect_timeout
        );
        ensure!(
            self.upstream_timeout > 0,
            "upstream_timeout must be greater than 0 seconds (got {})",
            self.upstream_timeout
        );
        ensure!(
            self.max_header_size > 0,
            "max_header_size must be greater than 0 (got {})",
            self.max_header_size
        );
        ensure!(
            self.max_response_header_size > 0,
            "max_response_header_size must be greater than 0 (got {})",
            self.max_response_header_size
        );
        ensure!(
            self.event_buffer_capacity > 0,
            "event_buffer_capacity must be greater than 0 (got {})",
            self.event_buffer_capacity
        );
        for (name, url) in &self.service_bindings {
            ensure!(
                url.starts_with("http://"),
                "service binding '{name}' must be a plain http URL (got '{url}')"
            );
        }
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = cli.config.as_deref() {
        return Ok(path.to_path_buf());
    }

    for candidate in default_config_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "no configuration file provided via --config and none found in default locations: {}",
        default_config_candidates()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/hostguard/hostguard.toml"),
        PathBuf::from("hostguard.toml"),
    ]
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::settings_for_tests;

    #[test]
    fn baseline_settings_validate() {
        assert!(settings_for_tests().validate().is_ok());
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let mut settings = settings_for_tests();
        settings.request_timeout = 0;
        assert!(settings.validate().is_err());

        let mut settings = settings_for_tests();
        settings.client_timeout = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn non_http_service_binding_is_rejected() {
        let mut settings = settings_for_tests();
        settings
            .service_bindings
            .insert("billing".into(), "https://billing.internal".into());
        assert!(settings.validate().is_err());
    }
}
