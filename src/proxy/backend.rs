// src/proxy/backend.rs
use super::proxy::{Proxy, ProxyError};
use crate::config::ProxyConfig;
use async_trait::async_trait;
use hyper::{Body, Request, Response};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use url::Url;

/// An upstream the balancer can hand a request to.
///
/// The balancer only ever sees `Arc<dyn Backend>`, so other variants
/// (weighted, sticky, ...) can be added without touching selection.
#[async_trait]
pub trait Backend: Send + Sync + fmt::Debug {
    /// The address exactly as it was configured.
    fn address(&self) -> &str;

    /// Whether this backend may currently be selected.
    fn is_alive(&self) -> bool;

    /// Forward one request and relay the upstream's response.
    async fn handle(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError>;
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("invalid backend address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },
}

/// A plain HTTP(S) upstream reached through a single-host [`Proxy`].
pub struct HttpBackend {
    address: String,
    proxy: Proxy,

    // Runtime state
    alive: AtomicBool,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    consecutive_failures: AtomicUsize,
    consecutive_successes: AtomicUsize,
}

impl HttpBackend {
    pub fn new(address: impl Into<String>, config: &ProxyConfig) -> Result<Self, BackendError> {
        let address = address.into();
        let url = parse_target(&address)?;

        Ok(Self {
            proxy: Proxy::new(url, config.request_timeout()),
            address,
            alive: AtomicBool::new(true),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            consecutive_failures: AtomicUsize::new(0),
            consecutive_successes: AtomicUsize::new(0),
        })
    }

    pub fn url(&self) -> &Url {
        self.proxy.target()
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }

    /// Feed one probe outcome; returns the streak length it extends.
    pub fn record_probe(&self, success: bool) -> usize {
        if success {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            self.consecutive_successes.store(0, Ordering::Relaxed);
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
        }
    }

    pub fn consecutive_failures(&self) -> usize {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn consecutive_successes(&self) -> usize {
        self.consecutive_successes.load(Ordering::Relaxed)
    }

    pub fn get_metrics(&self) -> BackendMetrics {
        BackendMetrics {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn address(&self) -> &str {
        &self.address
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    async fn handle(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let result = self.proxy.forward(req).await;
        if result.is_err() {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

impl fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpBackend")
            .field("address", &self.address)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendMetrics {
    pub total_requests: u64,
    pub failed_requests: u64,
}

fn parse_target(address: &str) -> Result<Url, BackendError> {
    let invalid = |reason: String| BackendError::InvalidAddress {
        address: address.to_string(),
        reason,
    };

    let url = Url::parse(address).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(invalid(format!("unsupported scheme {:?}", other))),
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ClientAddr;
    use hyper::StatusCode;

    fn backend(address: &str) -> HttpBackend {
        HttpBackend::new(address, &ProxyConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn address_is_kept_verbatim() {
        let b = backend("https://Example.com:443/base/");
        assert_eq!(b.address(), "https://Example.com:443/base/");
        assert_eq!(b.url().host_str(), Some("example.com"));
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        for address in ["", "not a url", "ftp://example.com", "http://", "unix:/tmp/sock"] {
            let err = HttpBackend::new(address, &ProxyConfig::default()).unwrap_err();
            let BackendError::InvalidAddress { address: reported, .. } = err;
            assert_eq!(reported, address);
        }
    }

    #[tokio::test]
    async fn alive_by_default_and_settable() {
        let b = backend("http://127.0.0.1:9");
        assert!(b.is_alive());
        b.set_alive(false);
        assert!(!b.is_alive());
        b.set_alive(true);
        assert!(b.is_alive());
    }

    #[tokio::test]
    async fn probe_streaks_reset_each_other() {
        let b = backend("http://127.0.0.1:9");
        assert_eq!(b.record_probe(false), 1);
        assert_eq!(b.record_probe(false), 2);
        assert_eq!(b.record_probe(true), 1);
        assert_eq!(b.consecutive_failures(), 0);
        assert_eq!(b.consecutive_successes(), 1);
    }

    #[tokio::test]
    async fn forwards_and_relays_the_upstream_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/items")
            .match_query(mockito::Matcher::UrlEncoded("page".into(), "2".into()))
            .match_body("payload")
            .with_status(201)
            .with_header("x-upstream", "one")
            .with_body("created")
            .create_async()
            .await;

        let b = backend(&server.url());
        let req = Request::post("/items?page=2")
            .body(Body::from("payload"))
            .unwrap();

        let response = b.handle(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get("x-upstream").unwrap(), "one");
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(&body[..], b"created");

        mock.assert_async().await;
        assert_eq!(b.get_metrics(), BackendMetrics { total_requests: 1, failed_requests: 0 });
    }

    #[tokio::test]
    async fn host_and_forwarded_for_are_rewritten_on_the_wire() {
        let mut server = mockito::Server::new_async().await;
        let host = server.host_with_port();
        let mock = server
            .mock("GET", "/")
            .match_header("host", host.as_str())
            .match_header("x-forwarded-for", "10.0.0.1")
            .match_header("x-session", mockito::Matcher::Missing)
            .with_status(200)
            .create_async()
            .await;

        let b = backend(&server.url());
        let mut req = Request::get("/")
            .header("host", "lb.example.com")
            .header("connection", "x-session")
            .header("x-session", "abc")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ClientAddr("10.0.0.1:40000".parse().unwrap()));

        let response = b.handle(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn slow_upstream_times_out_as_gateway_timeout() {
        // Accepts connections but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let config = ProxyConfig {
            request_timeout_secs: Some(1),
        };
        let b = HttpBackend::new(format!("http://{}", addr), &config).unwrap();

        let err = b
            .handle(Request::get("/slow").body(Body::empty()).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Timeout));
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(b.get_metrics().failed_requests, 1);

        silent.abort();
    }

    #[tokio::test]
    async fn upstream_error_statuses_are_relayed_not_raised() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let b = backend(&server.url());
        let response = b.handle(Request::get("/").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(b.is_alive());
    }

    #[tokio::test]
    async fn connection_failure_surfaces_as_upstream_error() {
        // Nothing listens on the discard port in the test environment.
        let b = backend("http://127.0.0.1:9");
        let err = b
            .handle(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyError::Upstream(_)));
        assert_eq!(b.get_metrics().failed_requests, 1);
        assert!(b.is_alive());
    }
}
