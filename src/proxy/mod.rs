// src/proxy/mod.rs
mod backend;
mod forward;
mod pool;
mod proxy;

pub use backend::Backend;
pub use forward::{ClientAddr, Forward, HttpClient, ReverseProxy};
pub use pool::ServerPool;
pub use proxy::{Proxy, ProxyError};
