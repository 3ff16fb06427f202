// src/load_balancer/balancer.rs
use super::RoundRobin;
use crate::metrics::{MetricsCollector, Timer};
use crate::proxy::{Backend, ProxyError};
use hyper::{Body, Request, Response};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum BalancerError {
    #[error("backend pool is empty")]
    EmptyPool,
}

/// Owns the fixed, ordered backend pool and rotates requests across it.
pub struct Balancer {
    listen_port: u16,
    backends: Vec<Arc<dyn Backend>>,
    rotation: RoundRobin,
    metrics: Option<Arc<MetricsCollector>>,
}

impl Balancer {
    pub fn new(listen_port: u16, backends: Vec<Arc<dyn Backend>>) -> Result<Self, BalancerError> {
        if backends.is_empty() {
            return Err(BalancerError::EmptyPool);
        }

        Ok(Self {
            listen_port,
            backends,
            rotation: RoundRobin::new(),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        metrics.update_backend_counts(self.alive_count(), self.backends.len());
        self.metrics = Some(metrics);
        self
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// The pool in rotation order. Never changes after construction.
    pub fn backends(&self) -> &[Arc<dyn Backend>] {
        &self.backends
    }

    pub fn alive_count(&self) -> usize {
        self.backends.iter().filter(|b| b.is_alive()).count()
    }

    pub fn select_next(&self) -> Result<Arc<dyn Backend>, ProxyError> {
        self.rotation
            .select(&self.backends)
            .ok_or(ProxyError::NoHealthyBackends)
    }

    /// Route one request to the next live backend and return its answer untouched.
    pub async fn dispatch(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "dispatch",
            %request_id,
            method = %req.method(),
            path = %req.uri().path(),
        );

        async move {
            let backend = match self.select_next() {
                Ok(backend) => backend,
                Err(err) => {
                    warn!(backends = self.backends.len(), "no live backend to forward to");
                    if let Some(metrics) = &self.metrics {
                        metrics.record_no_backend();
                    }
                    return Err(err);
                }
            };

            info!(backend = %backend.address(), "forwarding request");
            let timer = Timer::new();
            let result = backend.handle(req).await;

            match &result {
                Ok(response) => debug!(status = %response.status(), "upstream responded"),
                Err(err) => warn!(backend = %backend.address(), %err, "forwarding failed"),
            }
            if let Some(metrics) = &self.metrics {
                let status = match &result {
                    Ok(response) => response.status(),
                    Err(err) => err.status(),
                };
                metrics.record_request(backend.address(), status.as_u16(), timer.elapsed());
            }

            result
        }
        .instrument(span)
        .await
    }
}
