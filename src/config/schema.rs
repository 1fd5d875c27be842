use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ConfigError, Result};

/// Settings for the capture proxy.
///
/// Built once from defaults plus overrides and frozen before the server
/// starts. Every field has a default so partial config files are fine.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Address the proxy listens on. Port 0 requests an ephemeral port.
    pub listen_addr: String,

    /// Terminate TLS on CONNECT and capture the decrypted traffic
    pub intercept_https: bool,

    pub ca_cert_path: PathBuf,
    pub ca_key_path: PathBuf,

    /// Generate a fresh CA when loading from disk fails
    pub auto_generate_ca: bool,

    /// Cap, in bytes, on captured bodies and on inbound request bodies
    pub max_body_size: usize,

    /// Ring buffer capacity; zero is clamped to one
    pub buffer_size: usize,

    /// When non-empty only matching hosts are captured
    pub include_hosts: Vec<String>,
    pub exclude_hosts: Vec<String>,

    /// Response content-type prefixes whose bodies are not kept
    pub exclude_content_types: Vec<String>,

    pub verbose: bool,

    pub upstream_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,

    /// Extra PEM trust root for upstream TLS, on top of the web PKI roots
    pub upstream_ca_cert_path: Option<PathBuf>,
}

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;
pub const DEFAULT_BUFFER_SIZE: usize = 1000;

fn default_ca_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tapwire")
}

fn default_exclude_content_types() -> Vec<String> {
    ["image/", "video/", "audio/", "font/"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        let ca_dir = default_ca_dir();
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            intercept_https: false,
            ca_cert_path: ca_dir.join("ca.crt"),
            ca_key_path: ca_dir.join("ca.key"),
            auto_generate_ca: true,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            include_hosts: Vec::new(),
            exclude_hosts: Vec::new(),
            exclude_content_types: default_exclude_content_types(),
            verbose: false,
            upstream_timeout_ms: 30_000,
            read_timeout_ms: 60_000,
            shutdown_timeout_ms: 5_000,
            upstream_ca_cert_path: None,
        }
    }
}

impl Config {
    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    pub fn with_intercept_https(mut self, enabled: bool) -> Self {
        self.intercept_https = enabled;
        self
    }

    pub fn with_ca_paths(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = cert.into();
        self.ca_key_path = key.into();
        self
    }

    pub fn with_auto_generate_ca(mut self, enabled: bool) -> Self {
        self.auto_generate_ca = enabled;
        self
    }

    pub fn with_max_body_size(mut self, bytes: usize) -> Self {
        self.max_body_size = bytes;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_include_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_exclude_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_exclude_content_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_content_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_upstream_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.upstream_ca_cert_path = Some(path.into());
        self
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Ring buffer capacity actually used by the capture store
    pub fn effective_buffer_size(&self) -> usize {
        self.buffer_size.max(1)
    }

    pub fn validate(&self) -> Result<()> {
        let port_ok = self
            .listen_addr
            .rsplit_once(':')
            .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
            .unwrap_or(false);
        if !port_ok {
            return Err(ConfigError::Validation(format!(
                "listen_addr must be host:port, got '{}'",
                self.listen_addr
            ))
            .into());
        }

        if self.max_body_size == 0 {
            return Err(
                ConfigError::Validation("max_body_size must be greater than 0".into()).into(),
            );
        }

        for (name, value) in [
            ("upstream_timeout_ms", self.upstream_timeout_ms),
            ("read_timeout_ms", self.read_timeout_ms),
            ("shutdown_timeout_ms", self.shutdown_timeout_ms),
        ] {
            if value == 0 {
                return Err(
                    ConfigError::Validation(format!("{name} must be greater than 0")).into(),
                );
            }
        }

        Ok(())
    }
}
