// src/main.rs
use anyhow::{Context, Result};
use round_robin_lb::{
    config,
    health::HealthChecker,
    load_balancer::Balancer,
    metrics::{start_metrics_server, MetricsRegistry},
    proxy::{Backend, HttpBackend},
    server::{RequestHandler, ServerBuilder},
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("round_robin_lb=info".parse()?)
                .add_directive("hyper=info".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    info!("Loading configuration from: {}", config_path);
    let config = config::load_config(&config_path).await?;

    // A bad address aborts startup; there is no partial pool.
    let backends = config
        .backend_addresses()
        .map(|address| HttpBackend::new(address, &config.proxy).map(Arc::new))
        .collect::<Result<Vec<_>, _>>()
        .context("Invalid backend configuration")?;

    for backend in &backends {
        info!("Registered backend {}", backend.address());
    }

    let pool: Vec<Arc<dyn Backend>> = backends
        .iter()
        .map(|backend| backend.clone() as Arc<dyn Backend>)
        .collect();
    let mut balancer = Balancer::new(config.port, pool)?;

    // Metrics are optional
    let metrics = if config.metrics.enabled {
        let registry = MetricsRegistry::new()?;
        let collector = registry.collector();
        start_metrics_server(
            config.metrics_addr(),
            registry,
            config.metrics.path.clone(),
        )
        .await?;
        balancer = balancer.with_metrics(collector.clone());
        Some(collector)
    } else {
        None
    };

    // Health checking is optional; without it every backend stays alive.
    let health_checker = if config.health_check.enabled {
        let checker = Arc::new(HealthChecker::new(
            config.health_check.clone(),
            backends.clone(),
            metrics,
        )?);
        tokio::spawn(checker.clone().start());
        Some(checker)
    } else {
        None
    };

    let balancer = Arc::new(balancer);
    let addr = config.listen_addr();
    info!(
        "Load balancer started on port {} with {} backends",
        balancer.listen_port(),
        balancer.backends().len()
    );

    ServerBuilder::new(addr)
        .with_handler(RequestHandler::new(balancer))
        .serve(shutdown_signal())
        .await?;

    if let Some(checker) = health_checker {
        checker.shutdown();
    }

    info!("Load balancer stopped");
    Ok(())
}

// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
