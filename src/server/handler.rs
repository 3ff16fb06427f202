// src/server/handler.rs
use hyper::{Body, Request, Response};
use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;

use crate::load_balancer::Balancer;

/// Routes every inbound request, whatever its path or method, through the balancer.
#[derive(Clone)]
pub struct RequestHandler {
    balancer: Arc<Balancer>,
}

impl RequestHandler {
    pub fn new(balancer: Arc<Balancer>) -> Self {
        Self { balancer }
    }
}

impl Service<Request<Body>> for RequestHandler {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let balancer = self.balancer.clone();
        Box::pin(async move {
            // Failures become gateway responses instead of dropped connections.
            Ok(balancer.dispatch(req).await.unwrap_or_else(|err| err.into()))
        })
    }
}
