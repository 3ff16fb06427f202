// src/metrics/server.rs
use super::MetricsRegistry;
use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{header, Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

/// Serve the Prometheus text format on `addr` at `path`, in the background.
pub async fn start_metrics_server(
    addr: SocketAddr,
    registry: MetricsRegistry,
    path: String,
) -> Result<()> {
    let registry = Arc::new(registry);
    let metrics_path = Arc::new(path);
    let service_path = metrics_path.clone();

    let make_service = make_service_fn(move |_| {
        let registry = registry.clone();
        let path = service_path.clone();

        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                let path = path.clone();

                async move { Ok::<_, Infallible>(render(&req, &registry, &path)) }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_service);

    info!(
        "Metrics server listening on http://{}{}",
        addr,
        metrics_path.as_str()
    );

    tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(())
}

fn render(req: &Request<Body>, registry: &MetricsRegistry, path: &str) -> Response<Body> {
    if req.uri().path() != path {
        return status_response(StatusCode::NOT_FOUND, "Not Found");
    }

    match registry.gather() {
        Ok(metrics) => {
            let mut response = Response::new(Body::from(metrics));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            status_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
        }
    }
}

fn status_response(status: StatusCode, message: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn only_the_metrics_path_is_served() {
        let registry = MetricsRegistry::new().unwrap();
        registry.collector().update_backend_counts(2, 3);

        let hit = render(
            &Request::get("/metrics").body(Body::empty()).unwrap(),
            &registry,
            "/metrics",
        );
        assert_eq!(hit.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(hit.into_body()).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("lb_healthy_backends 2"));

        let miss = render(
            &Request::get("/other").body(Body::empty()).unwrap(),
            &registry,
            "/metrics",
        );
        assert_eq!(miss.status(), StatusCode::NOT_FOUND);
    }
}
