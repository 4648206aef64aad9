// src/proxy/forward.rs
// Forwarding capability and the hyper-backed reverse proxy that implements it.

use super::ProxyError;
use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION};
use hyper::{Body, Client, Request, Response, Uri, Version};
use hyper_tls::HttpsConnector;
use std::net::{IpAddr, SocketAddr};
use url::{Position, Url};

pub type HttpClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Relays a request to one upstream and hands back its response.
#[async_trait]
pub trait Forward: Send + Sync {
    async fn forward(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError>;
}

/// Address of the downstream client, attached to each request by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

const HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Single-host reverse proxy: rewrites the request onto `target` and streams
/// method, headers and body through a shared hyper client.
#[derive(Clone, Debug)]
pub struct ReverseProxy {
    target: Url,
    client: HttpClient,
}

impl ReverseProxy {
    pub fn new(target: Url, client: HttpClient) -> Self {
        Self { target, client }
    }

    pub fn build_client() -> HttpClient {
        Client::builder().build(HttpsConnector::new())
    }

    fn upstream_uri(&self, uri: &Uri) -> Result<Uri, ProxyError> {
        let base = self.target.path().trim_end_matches('/');
        let mut upstream = format!("{}{}{}", &self.target[..Position::AfterPort], base, uri.path());

        match (self.target.query(), uri.query()) {
            (Some(a), Some(b)) => {
                upstream.push('?');
                upstream.push_str(a);
                upstream.push('&');
                upstream.push_str(b);
            }
            (Some(q), None) | (None, Some(q)) => {
                upstream.push('?');
                upstream.push_str(q);
            }
            (None, None) => {}
        }

        upstream
            .parse::<Uri>()
            .map_err(|e| ProxyError::InvalidUri(e.to_string()))
    }
}

#[async_trait]
impl Forward for ReverseProxy {
    async fn forward(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let (mut parts, body) = req.into_parts();

        parts.uri = self.upstream_uri(&parts.uri)?;
        parts.version = Version::HTTP_11;
        strip_hop_headers(&mut parts.headers);

        if let Some(ClientAddr(addr)) = parts.extensions.get::<ClientAddr>().copied() {
            append_forwarded_for(&mut parts.headers, addr.ip());
        }

        let mut response = self.client.request(Request::from_parts(parts, body)).await?;
        strip_hop_headers(response.headers_mut());
        Ok(response)
    }
}

fn strip_hop_headers(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_HEADERS {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, ip: IpAddr) {
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{}, {}", prior, ip),
        None => ip.to_string(),
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(HeaderName::from_static(X_FORWARDED_FOR), value);
    }
}
