// src/health/checker.rs
use crate::config::HealthCheckConfig;
use crate::metrics::MetricsCollector;
use crate::proxy::{join_paths, Backend, HttpBackend};
use anyhow::Result;
use reqwest::Client;
use std::sync::Arc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use url::Url;

/// Periodically probes every backend and flips its liveness once a
/// success or failure streak reaches the configured threshold.
pub struct HealthChecker {
    config: HealthCheckConfig,
    backends: Vec<Arc<HttpBackend>>,
    client: Client,
    metrics: Option<Arc<MetricsCollector>>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct HealthCheckResult {
    pub backend: String,
    pub healthy: bool,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

impl HealthChecker {
    pub fn new(
        config: HealthCheckConfig,
        backends: Vec<Arc<HttpBackend>>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        Ok(Self {
            config,
            backends,
            client,
            metrics,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub async fn start(self: Arc<Self>) {
        let mut ticker = interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown_rx.clone();

        info!(
            "Starting health checker with interval: {:?}",
            self.config.interval()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.clone().check_all_backends().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Health checker shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn check_all_backends(self: Arc<Self>) -> Vec<HealthCheckResult> {
        let tasks: Vec<_> = self
            .backends
            .iter()
            .cloned()
            .map(|backend| {
                let checker = self.clone();
                tokio::spawn(async move { checker.check_backend(&backend).await })
            })
            .collect();

        let mut results = Vec::with_capacity(tasks.len());
        for joined in futures::future::join_all(tasks).await {
            match joined {
                Ok(Ok(result)) => {
                    if result.healthy {
                        debug!(
                            "Backend {} probe ok in {}ms",
                            result.backend, result.response_time_ms
                        );
                    } else {
                        debug!(
                            "Backend {} probe failed after {}ms: {:?}",
                            result.backend, result.response_time_ms, result.error
                        );
                    }
                    results.push(result);
                }
                Ok(Err(e)) => error!("Health check error: {}", e),
                Err(e) => error!("Task join error: {}", e),
            }
        }

        let alive = self.backends.iter().filter(|b| b.is_alive()).count();
        if let Some(metrics) = &self.metrics {
            metrics.update_backend_counts(alive, self.backends.len());
        }
        debug!(
            "Health check complete: {}/{} backends alive",
            alive,
            self.backends.len()
        );

        results
    }

    async fn check_backend(&self, backend: &HttpBackend) -> Result<HealthCheckResult> {
        let start = std::time::Instant::now();
        let url = probe_url(backend.url(), &self.config.path);

        let result = timeout(self.config.timeout(), self.client.get(url).send()).await;
        let response_time_ms = start.elapsed().as_millis() as u64;

        let (healthy, error) = match result {
            Ok(Ok(response)) => {
                let status = response.status();
                if status.is_success() {
                    (true, None)
                } else {
                    (false, Some(format!("HTTP {}", status)))
                }
            }
            Ok(Err(e)) => (false, Some(e.to_string())),
            Err(_) => (false, Some("Request timeout".to_string())),
        };

        let was_alive = backend.is_alive();
        let streak = backend.record_probe(healthy);

        if healthy && !was_alive && streak >= self.config.healthy_threshold as usize {
            backend.set_alive(true);
            info!(
                "Backend {} is now healthy after {} consecutive successes",
                backend.address(),
                streak
            );
        } else if !healthy && was_alive && streak >= self.config.unhealthy_threshold as usize {
            backend.set_alive(false);
            warn!(
                "Backend {} is now unhealthy after {} consecutive failures: {:?}",
                backend.address(),
                streak,
                error
            );
        }

        if let Some(metrics) = &self.metrics {
            metrics.update_backend_health(backend.address(), backend.is_alive());
        }

        Ok(HealthCheckResult {
            backend: backend.address().to_string(),
            healthy,
            response_time_ms,
            error,
        })
    }
}

/// The probe path hangs off the backend's own base path.
fn probe_url(base: &Url, path: &str) -> Url {
    let mut url = base.clone();
    url.set_path(&join_paths(base.path(), path));
    url.set_query(None);
    url
}
