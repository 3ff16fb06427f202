// src/proxy/mod.rs
mod proxy;
mod backend;

pub use proxy::{ClientAddr, Proxy, ProxyError};
pub(crate) use proxy::join_paths;
pub use backend::{Backend, BackendError, BackendMetrics, HttpBackend};
