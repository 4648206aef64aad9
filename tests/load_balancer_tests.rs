// tests/load_balancer_tests.rs
use async_trait::async_trait;
use hyper::{Body, Client, Request, StatusCode};
use roundrobin_lb::config::{BackendConfig, HealthCheckConfig};
use roundrobin_lb::health::HealthChecker;
use roundrobin_lb::proxy::{Proxy, ReverseProxy, ServerPool};
use roundrobin_lb::server::{Listener, RequestHandler, ServerBuilder};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct Balancer {
    addr: SocketAddr,
    pool: Arc<ServerPool>,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<anyhow::Result<()>>,
}

impl Balancer {
    async fn stop(mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        tokio::time::timeout(Duration::from_secs(5), self.server)
            .await
            .expect("server should stop after shutdown")
            .unwrap()
    }
}

/// Fails the first `failures` accepts with `error()`, then behaves like the
/// wrapped listener.
struct FlakyListener {
    inner: TcpListener,
    failures: AtomicUsize,
    error: fn() -> io::Error,
}

#[async_trait]
impl Listener for FlakyListener {
    type Conn = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err((self.error)());
        }
        self.inner.accept().await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

fn pool_for(urls: &[String]) -> Arc<ServerPool> {
    let configs: Vec<BackendConfig> = urls
        .iter()
        .map(|u| BackendConfig {
            url: u.parse().unwrap(),
        })
        .collect();
    Arc::new(ServerPool::from_configs(&configs, &ReverseProxy::build_client()))
}

fn serve<L: Listener + 'static>(listener: L, pool: Arc<ServerPool>) -> Balancer {
    let addr = listener.local_addr().unwrap();
    let handler = RequestHandler::new(Arc::new(Proxy::new(pool.clone(), None)));
    let (tx, rx) = oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        ServerBuilder::new(addr)
            .with_handler(handler)
            .serve_on(listener, async {
                let _ = rx.await;
            })
            .await
    });

    Balancer {
        addr,
        pool,
        shutdown: Some(tx),
        server,
    }
}

async fn start_balancer(urls: &[String]) -> Balancer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    serve(listener, pool_for(urls))
}

async fn get(addr: SocketAddr, path: &str) -> (StatusCode, String) {
    let resp = Client::new()
        .get(format!("http://{}{}", addr, path).parse().unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn test_round_robin_distribution() {
    let mut servers = Vec::new();
    let mut mocks = Vec::new();
    for i in 0..3 {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/test")
            .with_status(200)
            .with_body(format!("Server {}", i))
            .expect(3)
            .create_async()
            .await;
        servers.push(server);
        mocks.push(mock);
    }

    let urls: Vec<String> = servers.iter().map(|s| s.url()).collect();
    let lb = start_balancer(&urls).await;

    let mut responses: HashMap<String, usize> = HashMap::new();
    for _ in 0..9 {
        let (status, body) = get(lb.addr, "/test").await;
        assert_eq!(status, StatusCode::OK);
        *responses.entry(body).or_default() += 1;
    }

    for i in 0..3 {
        assert_eq!(responses.get(&format!("Server {}", i)), Some(&3));
    }
    for mock in mocks {
        mock.assert_async().await;
    }
}

#[tokio::test]
async fn test_dead_backend_never_receives_traffic() {
    let mut servers = Vec::new();
    let mut mocks = Vec::new();
    for i in 0..3 {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("GET", "/").with_body(format!("{}", i));
        let mock = if i == 1 {
            mock.expect(0)
        } else {
            mock.expect_at_least(1)
        };
        let mock = mock.create_async().await;
        servers.push(server);
        mocks.push(mock);
    }

    let urls: Vec<String> = servers.iter().map(|s| s.url()).collect();
    let lb = start_balancer(&urls).await;
    lb.pool.backends()[1].set_alive(false);

    for _ in 0..8 {
        let (status, body) = get(lb.addr, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_ne!(body, "1");
    }

    for mock in mocks {
        mock.assert_async().await;
    }
}

#[tokio::test]
async fn test_service_unavailable_when_all_backends_down() {
    let lb = start_balancer(&["http://127.0.0.1:1".to_string()]).await;
    lb.pool.backends()[0].set_alive(false);

    let (status, body) = get(lb.addr, "/anything").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, "Service not available");
}

#[tokio::test]
async fn test_unreachable_backend_is_bad_gateway_without_retry() {
    let mut healthy = mockito::Server::new_async().await;
    let untouched = healthy
        .mock("GET", "/")
        .expect(0)
        .create_async()
        .await;

    // Cursor starts at 0, so the first request claims index 1.
    let lb = start_balancer(&[healthy.url(), "http://127.0.0.1:1".to_string()]).await;

    let (status, _) = get(lb.addr, "/").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    untouched.assert_async().await;
}

#[tokio::test]
async fn test_client_address_and_request_are_forwarded() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/orders")
        .match_header("x-forwarded-for", "127.0.0.1")
        .match_header("x-request-tag", "abc")
        .match_body("{\"qty\":2}")
        .with_status(201)
        .with_header("x-served-by", "orders-1")
        .with_body("accepted")
        .create_async()
        .await;

    let lb = start_balancer(&[server.url()]).await;

    let req = Request::post(format!("http://{}/orders", lb.addr))
        .header("x-request-tag", "abc")
        .body(Body::from("{\"qty\":2}"))
        .unwrap();
    let resp = Client::new().request(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::CREATED);
    assert_eq!(resp.headers()["x-served-by"], "orders-1");
    let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
    assert_eq!(&body[..], b"accepted");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_health_check_takes_backend_out_and_back_in() {
    let mut server = mockito::Server::new_async().await;
    let _traffic = server
        .mock("GET", "/work")
        .with_body("done")
        .create_async()
        .await;
    let health = server
        .mock("GET", "/health")
        .with_status(200)
        .create_async()
        .await;

    let lb = start_balancer(&[server.url()]).await;
    let checker = HealthChecker::new(
        HealthCheckConfig {
            interval_secs: 10,
            timeout_secs: 2,
            path: "/health".to_string(),
        },
        lb.pool.clone(),
        None,
    )
    .unwrap();

    checker.run_once().await;
    assert_eq!(get(lb.addr, "/work").await, (StatusCode::OK, "done".to_string()));

    // Unmatched requests get mockito's 501, which fails the check.
    health.remove_async().await;
    checker.run_once().await;
    assert!(!lb.pool.backends()[0].is_alive());
    assert_eq!(get(lb.addr, "/work").await.0, StatusCode::SERVICE_UNAVAILABLE);

    let _health = server
        .mock("GET", "/health")
        .with_status(200)
        .create_async()
        .await;
    checker.run_once().await;
    assert_eq!(get(lb.addr, "/work").await, (StatusCode::OK, "done".to_string()));
}

#[tokio::test]
async fn test_server_keeps_accepting_after_accept_failures() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/")
        .with_body("still here")
        .expect(2)
        .create_async()
        .await;

    let listener = FlakyListener {
        inner: TcpListener::bind("127.0.0.1:0").await.unwrap(),
        // EMFILE, "Too many open files"
        failures: AtomicUsize::new(3),
        error: || io::Error::from_raw_os_error(24),
    };
    let lb = serve(listener, pool_for(&[server.url()]));

    let first = tokio::time::timeout(Duration::from_secs(5), get(lb.addr, "/"))
        .await
        .expect("server should recover from accept failures");
    assert_eq!(first, (StatusCode::OK, "still here".to_string()));
    assert_eq!(get(lb.addr, "/").await.0, StatusCode::OK);
    assert!(!lb.server.is_finished());

    mock.assert_async().await;
    lb.stop().await.unwrap();
}

#[tokio::test]
async fn test_aborted_connections_are_skipped() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server.mock("GET", "/").with_body("ok").create_async().await;

    let listener = FlakyListener {
        inner: TcpListener::bind("127.0.0.1:0").await.unwrap(),
        failures: AtomicUsize::new(5),
        error: || io::ErrorKind::ConnectionAborted.into(),
    };
    let lb = serve(listener, pool_for(&[server.url()]));

    assert_eq!(get(lb.addr, "/").await, (StatusCode::OK, "ok".to_string()));
    lb.stop().await.unwrap();
}

#[tokio::test]
async fn test_serve_returns_ok_once_shutdown_resolves() {
    let lb = start_balancer(&["http://127.0.0.1:1".to_string()]).await;
    let addr = lb.addr;
    lb.pool.backends()[0].set_alive(false);
    assert_eq!(get(addr, "/").await.0, StatusCode::SERVICE_UNAVAILABLE);

    lb.stop().await.unwrap();

    // Give the runtime a moment to drop the listener socket.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(TcpStream::connect(addr).await.is_err());
}
