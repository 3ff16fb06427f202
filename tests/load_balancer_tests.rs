// tests/load_balancer_tests.rs
use hyper::{Body, Client, Request, StatusCode};
use round_robin_lb::{
    config::ProxyConfig,
    load_balancer::Balancer,
    proxy::{Backend, HttpBackend},
    server::{bind_tcp, RequestHandler, ServerBuilder},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;

struct Harness {
    addr: SocketAddr,
    backends: Vec<Arc<HttpBackend>>,
    stop: Option<oneshot::Sender<()>>,
    server: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl Harness {
    async fn start(addresses: &[String]) -> Self {
        let backends: Vec<Arc<HttpBackend>> = addresses
            .iter()
            .map(|a| Arc::new(HttpBackend::new(a.as_str(), &ProxyConfig::default()).unwrap()))
            .collect();
        let pool = backends.iter().map(|b| b.clone() as Arc<dyn Backend>).collect();

        let listener = bind_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let balancer = Arc::new(Balancer::new(addr.port(), pool).unwrap());

        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(
            ServerBuilder::new(addr)
                .with_handler(RequestHandler::new(balancer))
                .serve_listener(listener, async move {
                    let _ = stopped.await;
                }),
        );

        Self {
            addr,
            backends,
            stop: Some(stop),
            server,
        }
    }

    async fn get(&self, path: &str) -> (StatusCode, String) {
        let req = Request::get(format!("http://{}{}", self.addr, path))
            .body(Body::empty())
            .unwrap();
        let response = Client::new().request(req).await.unwrap();
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.server.await.unwrap().unwrap();
    }
}

async fn named_upstream(name: &str) -> mockito::ServerGuard {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", mockito::Matcher::Any)
        .with_status(200)
        .with_body(name)
        .create_async()
        .await;
    server
}

#[tokio::test]
async fn requests_rotate_across_backends() {
    let a = named_upstream("a").await;
    let b = named_upstream("b").await;
    let c = named_upstream("c").await;
    let lb = Harness::start(&[a.url(), b.url(), c.url()]).await;

    let mut seen = Vec::new();
    for path in ["/", "/one", "/two?x=1", "/three", "/four"] {
        let (status, body) = lb.get(path).await;
        assert_eq!(status, StatusCode::OK);
        seen.push(body);
    }
    assert_eq!(seen, ["a", "b", "c", "a", "b"]);

    lb.shutdown().await;
}

#[tokio::test]
async fn dead_backends_are_skipped() {
    let a = named_upstream("a").await;
    let b = named_upstream("b").await;
    let lb = Harness::start(&[a.url(), b.url()]).await;

    lb.backends[0].set_alive(false);
    for _ in 0..3 {
        assert_eq!(lb.get("/").await, (StatusCode::OK, "b".to_string()));
    }

    lb.backends[1].set_alive(false);
    let (status, _) = lb.get("/").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    lb.shutdown().await;
}

#[tokio::test]
async fn upstream_failures_are_relayed_as_bad_gateway() {
    let lb = Harness::start(&["http://127.0.0.1:9".to_string()]).await;

    let (status, _) = lb.get("/anything").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    // Forwarding failures never change liveness.
    assert!(lb.backends[0].is_alive());

    lb.shutdown().await;
}
