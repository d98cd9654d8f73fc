use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, ensure};
use config::{Config, ConfigError, Environment, File};
use http::StatusCode;
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};

fn default_listen() -> SocketAddr {
    "0.0.0.0:8092".parse().expect("static listen address")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_exclude() -> String {
    String::new()
}

fn default_allowed_errors() -> String {
    "404".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_origin_connect_timeout() -> u64 {
    10
}

fn default_client_write_timeout() -> u64 {
    30
}

fn default_max_header_size() -> usize {
    32 * 1024
}

fn default_max_request_body_size() -> usize {
    64 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Base directory for published cache entries, partitioned by namespace.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Comma-separated query parameter names excluded from fingerprinting
    /// (still forwarded to the origin).
    #[serde(default = "default_exclude")]
    pub exclude: String,
    /// Comma-separated non-200 status codes that are still cached.
    #[serde(default = "default_allowed_errors")]
    pub allowed_errors: String,
    /// Treat the store as scratch space only; nothing survives a request.
    #[serde(default)]
    pub passthrough: bool,
    /// Expose the in-flight registry via /status.
    #[serde(default)]
    pub expose_status: bool,
    #[serde(default)]
    pub proxy_host: Option<String>,
    #[serde(default)]
    pub proxy_port: Option<u16>,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_origin_connect_timeout")]
    pub origin_connect_timeout: u64,
    #[serde(default = "default_client_write_timeout")]
    pub client_write_timeout: u64,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_max_request_body_size")]
    pub max_request_body_size: usize,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli);

        if let Some(path) = &config_path {
            builder = builder.add_source(File::from(path.clone()).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("RECACHE")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        if let Some(path) = &config_path {
            settings.apply_base_dir(path);
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn exclusions(&self) -> Vec<String> {
        self.exclude
            .split(',')
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect()
    }

    pub fn allowed_error_statuses(&self) -> Vec<StatusCode> {
        self.allowed_errors
            .split(',')
            .filter_map(|code| code.trim().parse::<u16>().ok())
            .filter_map(|code| StatusCode::from_u16(code).ok())
            .collect()
    }

    pub fn forward_proxy(&self) -> Option<(&str, u16)> {
        match (&self.proxy_host, self.proxy_port) {
            (Some(host), Some(port)) => Some((host.as_str(), port)),
            _ => None,
        }
    }

    pub fn origin_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.origin_connect_timeout)
    }

    pub fn client_write_timeout(&self) -> Duration {
        Duration::from_secs(self.client_write_timeout)
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
            self.max_header_size > 0,
            "max_header_size must be greater than 0 (got {})",
            self.max_header_size
        );
        ensure!(
            self.max_request_body_size > 0,
            "max_request_body_size must be greater than 0 (got {})",
            self.max_request_body_size
        );
        ensure!(
            self.origin_connect_timeout > 0,
            "origin_connect_timeout must be greater than 0 seconds (got {})",
            self.origin_connect_timeout
        );
        ensure!(
            self.client_write_timeout > 0,
            "client_write_timeout must be greater than 0 seconds (got {})",
            self.client_write_timeout
        );
        ensure!(
            self.proxy_host.is_some() == self.proxy_port.is_some(),
            "proxy_host and proxy_port must both be set or both be absent"
        );
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

fn resolve_config_path(cli: &Cli) -> Option<PathBuf> {
    if let Some(path) = &cli.config {
        return Some(path.clone());
    }
    let candidate = PathBuf::from("recache.toml");
    candidate.exists().then_some(candidate)
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
    use super::*;

    pub(crate) fn test_settings() -> Settings {
        Settings {
            listen: "127.0.0.1:0".parse().unwrap(),
            data_dir: PathBuf::from("data"),
            exclude: String::new(),
            allowed_errors: "404".to_string(),
            passthrough: false,
            expose_status: false,
            proxy_host: None,
            proxy_port: None,
            log: LogFormat::Text,
            origin_connect_timeout: 5,
            client_write_timeout: 5,
            max_header_size: 32 * 1024,
            max_request_body_size: 1024 * 1024,
        }
    }

    #[test]
    fn validation_accepts_defaults() {
        assert!(test_settings().validate().is_ok());
    }

    #[test]
    fn validation_rejects_half_configured_forward_proxy() {
        let mut settings = test_settings();
        settings.proxy_host = Some("proxy.internal".to_string());
        assert!(settings.validate().is_err());

        settings.proxy_port = Some(3128);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn exclusions_trim_and_skip_empty() {
        let mut settings = test_settings();
        settings.exclude = "rand, cache-buster,,_ ".to_string();
        assert_eq!(settings.exclusions(), vec!["rand", "cache-buster", "_"]);
    }

    #[test]
    fn allowed_errors_ignore_invalid_codes() {
        let mut settings = test_settings();
        settings.allowed_errors = "404,418,nope,99999".to_string();
        let statuses = settings.allowed_error_statuses();
        assert_eq!(
            statuses,
            vec![StatusCode::NOT_FOUND, StatusCode::IM_A_TEAPOT]
        );
    }
}
