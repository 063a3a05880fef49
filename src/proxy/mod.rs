//
// src/proxy/mod.rs
//
mod backend;
mod pool;
mod proxy;

pub use backend::{format_bytes, format_duration, Backend, BackendStats, ConnectionGuard};
pub use pool::{PoolStats, ServerPool};
pub use proxy::{
    ClientAddr, Forwarder, HttpForwarder, Proxy, ProxyError, FAVICON_PATH, X_FORWARDED_FOR,
    X_REQUEST_ID,
};
