// src/metrics/collector.rs
use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct MetricsRegistry {
    registry: Registry,
    collector: Arc<MetricsCollector>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let collector = Arc::new(MetricsCollector::new(&registry)?);

        Ok(Self {
            registry,
            collector,
        })
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    pub fn gather(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

pub struct MetricsCollector {
    // Request metrics
    pub requests_total: IntCounterVec,
    pub request_duration_seconds: HistogramVec,
    pub no_backend_total: IntCounter,

    // Backend metrics
    pub backend_health_status: IntGaugeVec,
    pub healthy_backends: IntGauge,
    pub total_backends: IntGauge,
}

impl MetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new("lb_requests_total", "Requests dispatched to a backend"),
            &["backend", "status_code"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "lb_request_duration_seconds",
                "Time spent waiting on the backend, in seconds",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        let no_backend_total = IntCounter::new(
            "lb_no_backend_total",
            "Requests rejected because no backend was alive",
        )?;
        registry.register(Box::new(no_backend_total.clone()))?;

        let backend_health_status = IntGaugeVec::new(
            Opts::new(
                "lb_backend_health_status",
                "Backend health status (1=alive, 0=not alive)",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_health_status.clone()))?;

        let healthy_backends = IntGauge::new("lb_healthy_backends", "Number of alive backends")?;
        registry.register(Box::new(healthy_backends.clone()))?;

        let total_backends = IntGauge::new("lb_total_backends", "Total number of backends")?;
        registry.register(Box::new(total_backends.clone()))?;

        Ok(Self {
            requests_total,
            request_duration_seconds,
            no_backend_total,
            backend_health_status,
            healthy_backends,
            total_backends,
        })
    }

    pub fn record_request(&self, backend: &str, status_code: u16, duration: Duration) {
        let status = status_code.to_string();
        self.requests_total
            .with_label_values(&[backend, &status])
            .inc();

        self.request_duration_seconds
            .with_label_values(&[backend])
            .observe(duration.as_secs_f64());
    }

    pub fn record_no_backend(&self) {
        self.no_backend_total.inc();
    }

    pub fn update_backend_health(&self, backend: &str, healthy: bool) {
        let value = if healthy { 1 } else { 0 };
        self.backend_health_status
            .with_label_values(&[backend])
            .set(value);
    }

    pub fn update_backend_counts(&self, healthy: usize, total: usize) {
        self.healthy_backends.set(healthy as i64);
        self.total_backends.set(total as i64);
    }
}

// Helper for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
