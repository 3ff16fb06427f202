// src/config/models.rs
use anyhow::{bail, Result};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// Rotation order is the order listed here.
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            bail!("at least one backend must be configured");
        }
        if self.proxy.request_timeout_secs == Some(0) {
            bail!("proxy.request_timeout_secs must be greater than zero");
        }

        let hc = &self.health_check;
        if hc.enabled {
            if hc.interval_secs == 0 || hc.timeout_secs == 0 {
                bail!("health_check interval and timeout must be greater than zero");
            }
            if hc.healthy_threshold == 0 || hc.unhealthy_threshold == 0 {
                bail!("health_check thresholds must be greater than zero");
            }
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn metrics_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.metrics.port)
    }

    pub fn backend_addresses(&self) -> impl Iterator<Item = &str> {
        self.backends.iter().map(|b| b.url.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Kept as the raw string; parsing happens when the backend is built.
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_health_path")]
    pub path: String,
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_interval_secs(),
            timeout_secs: default_timeout_secs(),
            path: default_health_path(),
            healthy_threshold: default_healthy_threshold(),
            unhealthy_threshold: default_unhealthy_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
            path: default_metrics_path(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_interval_secs() -> u64 {
    10
}

fn default_timeout_secs() -> u64 {
    2
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_healthy_threshold() -> u32 {
    2
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}
