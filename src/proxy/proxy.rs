// ────────────────────────────────
// src/proxy/proxy.rs
// Single-host HTTP forwarding: rewrite the request onto one upstream
// and relay whatever comes back.
// ────────────────────────────────

use hyper::client::HttpConnector;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Body, Client, Request, Response, StatusCode, Uri, Version};
use hyper_tls::HttpsConnector;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use url::Url;

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Peer address of the inbound connection, carried in request extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

type HttpsClient = Client<HttpsConnector<HttpConnector>, Body>;

pub struct Proxy {
    target: Url,
    authority: String,
    client: HttpsClient,
    timeout: Option<Duration>,
}

impl Proxy {
    /// `target` must already be a validated http(s) URL with a host.
    pub fn new(target: Url, timeout: Option<Duration>) -> Self {
        let authority = match (target.host_str(), target.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => String::new(),
        };
        let client = Client::builder().build::<_, Body>(HttpsConnector::new());

        Self {
            target,
            authority,
            client,
            timeout,
        }
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    pub async fn forward(&self, mut req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let uri = self.rewrite_uri(req.uri())?;
        let client_ip = req.extensions().get::<ClientAddr>().map(|addr| addr.0.ip());

        *req.uri_mut() = uri;
        // The outbound leg is always HTTP/1.1 (or negotiated by the connector).
        *req.version_mut() = Version::HTTP_11;

        let headers = req.headers_mut();
        remove_hop_by_hop_headers(headers);
        if let Some(ip) = client_ip {
            append_forwarded_for(headers, ip);
        }
        if let Ok(host) = HeaderValue::from_str(&self.authority) {
            headers.insert(header::HOST, host);
        }

        let pending = self.client.request(req);
        let result = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, pending)
                .await
                .map_err(|_| ProxyError::Timeout)?,
            None => pending.await,
        };

        let mut response = result.map_err(|e| ProxyError::Upstream(e.to_string()))?;
        remove_hop_by_hop_headers(response.headers_mut());
        Ok(response)
    }

    fn rewrite_uri(&self, uri: &Uri) -> Result<Uri, ProxyError> {
        let path = join_paths(self.target.path(), uri.path());
        let query = join_queries(self.target.query().unwrap_or(""), uri.query().unwrap_or(""));

        let mut rewritten = format!("{}://{}{}", self.target.scheme(), self.authority, path);
        if !query.is_empty() {
            rewritten.push('?');
            rewritten.push_str(&query);
        }

        rewritten
            .parse::<Uri>()
            .map_err(|e| ProxyError::InvalidRequest(e.to_string()))
    }
}

/// Joins with exactly one slash at the seam.
pub(crate) fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

fn join_queries(base: &str, query: &str) -> String {
    if base.is_empty() || query.is_empty() {
        format!("{}{}", base, query)
    } else {
        format!("{}&{}", base, query)
    }
}

fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, client_ip: IpAddr) {
    let prior: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();

    let value = if prior.is_empty() {
        client_ip.to_string()
    } else {
        format!("{}, {}", prior.join(", "), client_ip)
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("No healthy backends available")]
    NoHealthyBackends,

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoHealthyBackends => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<ProxyError> for Response<Body> {
    fn from(err: ProxyError) -> Self {
        let message = match err {
            ProxyError::NoHealthyBackends => "No healthy backends available",
            ProxyError::Upstream(_) => "Bad gateway",
            ProxyError::Timeout => "Gateway timeout",
            ProxyError::InvalidRequest(_) => "Bad request",
        };

        let mut response = Response::new(Body::from(message));
        *response.status_mut() = err.status();
        response
    }
}
