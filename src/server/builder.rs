// ────────────────────────────────
// src/server/builder.rs
// ────────────────────────────────
use crate::proxy::ClientAddr;
use crate::server::listener::bind_tcp;
use anyhow::{Context, Result};
use hyper::{server::conn::Http, Body, Request, Response};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower::{Service, ServiceExt};

/// Builder pattern so `main.rs` can inject its request handler.
pub struct ServerBuilder<H>
where
    H: Service<Request<Body>, Response = Response<Body>> + Send + Clone + 'static,
    H::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    H::Future: Send + 'static,
{
    addr: SocketAddr,
    handler: Option<H>,
}

impl<H> ServerBuilder<H>
where
    H: Service<Request<Body>, Response = Response<Body>> + Send + Clone + 'static,
    H::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    H::Future: Send + 'static,
{
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, handler: None }
    }

    /// Inject the request handler (usually a `RequestHandler` around the balancer).
    pub fn with_handler(mut self, handler: H) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = bind_tcp(self.addr).await?;
        self.serve_listener(listener, shutdown).await
    }

    /// Serve on an already-bound listener until `shutdown` resolves.
    pub async fn serve_listener<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let handler = self
            .handler
            .context("handler must be set via with_handler()")?;
        let local = listener.local_addr()?;
        tracing::info!("HTTP server listening on {}", local);

        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        // Usually fd exhaustion; keep accepting.
                        tracing::warn!(%err, "accept failed");
                        continue;
                    }
                },
                _ = &mut shutdown => {
                    tracing::info!("HTTP server on {} stopped accepting", local);
                    return Ok(());
                }
            };

            // Tag each request with the connection's peer for X-Forwarded-For.
            let svc = handler.clone().map_request(move |mut req: Request<Body>| {
                req.extensions_mut().insert(ClientAddr(peer));
                req
            });

            // One Tokio task per connection.
            tokio::spawn(async move {
                let http = Http::new();
                if let Err(err) = http.serve_connection(stream, svc).await {
                    tracing::warn!(%peer, %err, "connection error");
                }
            });
        }
    }
}
