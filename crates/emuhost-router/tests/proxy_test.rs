//! Proxy routing against real upstream servers on ephemeral ports

use axum::{
    body::Body,
    http::{
        header::{CONNECTION, UPGRADE},
        Request, Response, StatusCode,
    },
    response::IntoResponse,
    Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use emuhost_auth::{AuthError, AuthGate, JwtTokenService, TokenService};
use emuhost_control::{DeviceRegistry, Keyspace};
use emuhost_proto::{DeviceRecord, DeviceSpec, DeviceStatus, Identity};
use emuhost_router::{ProxyConfig, ProxyRouter, RouteError};
use emuhost_store::MemoryStore;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const SECRET: &[u8] = b"router_test_secret_0123456789abcd";

/// Upstream that answers `<name> <path?query> auth=<yes|no>`
async fn spawn_upstream(name: &'static str) -> u16 {
    let app = Router::new().fallback(move |req: Request<Body>| async move {
        let path = req
            .uri()
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_default();
        let auth = if req.headers().contains_key("authorization") {
            "yes"
        } else {
            "no"
        };
        format!("{} {} auth={}", name, path, auth)
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

/// Upstream that echoes request bodies back with the method in `x-method`,
/// and echoes raw bytes after a `Connection: upgrade` handshake
async fn spawn_echo_upstream() -> u16 {
    let app = Router::new().fallback(|mut req: Request<Body>| async move {
        if req.headers().contains_key(UPGRADE) {
            let on_upgrade = hyper::upgrade::on(&mut req);
            tokio::spawn(async move {
                if let Ok(upgraded) = on_upgrade.await {
                    let (mut reader, mut writer) = tokio::io::split(TokioIo::new(upgraded));
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                }
            });
            return Response::builder()
                .status(StatusCode::SWITCHING_PROTOCOLS)
                .header(CONNECTION, "upgrade")
                .header(UPGRADE, "echo")
                .body(Body::empty())
                .unwrap();
        }

        let method = req.method().to_string();
        let body = axum::body::to_bytes(req.into_body(), usize::MAX)
            .await
            .unwrap();
        Response::builder()
            .header("x-method", method)
            .body(Body::from(body))
            .unwrap()
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

/// Serve the proxy itself so upgrades run over a real connection
async fn serve_proxy(router: ProxyRouter) -> u16 {
    let app = Router::new().fallback(move |req: Request<Body>| {
        let router = router.clone();
        async move {
            match router.route(req).await {
                Ok(response) => response,
                Err(e) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
            }
        }
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

async fn read_response_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

struct Fixture {
    router: ProxyRouter,
    registry: DeviceRegistry,
    tokens: Arc<JwtTokenService>,
}

fn fixture() -> Fixture {
    let tokens =
        Arc::new(JwtTokenService::new(SECRET, "emuhost", ChronoDuration::hours(1)).unwrap());
    let registry = DeviceRegistry::new(Arc::new(MemoryStore::new()), Keyspace::new("test:"));
    let router = ProxyRouter::new(
        AuthGate::new(tokens.clone()),
        registry.clone(),
        ProxyConfig {
            upstream_host: "127.0.0.1".to_string(),
            connect_timeout: Duration::from_secs(2),
        },
    );

    Fixture {
        router,
        registry,
        tokens,
    }
}

async fn add_device(registry: &DeviceRegistry, owner: &str, port: u16, status: DeviceStatus) {
    let record = DeviceRecord::pending(owner, port, &DeviceSpec::new("pixel", "30"));
    registry.register(&record).await.unwrap();
    if status == DeviceStatus::Running {
        registry
            .update_status(&record.device_id, DeviceStatus::Running)
            .await
            .unwrap();
    }
}

fn request(path: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(path).method("GET");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_missing_credential_rejected_without_lookup() {
    let f = fixture();
    let result = f.router.route(request("/vnc.html", None)).await;

    assert!(matches!(
        result,
        Err(RouteError::Unauthorized(AuthError::MissingCredential))
    ));
}

#[tokio::test]
async fn test_request_forwarded_to_own_device() {
    let f = fixture();
    let port = spawn_upstream("alice-upstream").await;
    add_device(&f.registry, "alice", port, DeviceStatus::Running).await;
    let (token, _) = f.tokens.mint("alice", "Alice").unwrap();

    let response = f
        .router
        .route(request("/vnc.html?autoconnect=true", Some(&token)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_text(response).await,
        "alice-upstream /vnc.html?autoconnect=true auth=no"
    );
}

#[tokio::test]
async fn test_identity_never_reaches_another_users_device() {
    let f = fixture();
    let alice_port = spawn_upstream("alice-upstream").await;
    let bob_port = spawn_upstream("bob-upstream").await;
    add_device(&f.registry, "alice", alice_port, DeviceStatus::Running).await;
    add_device(&f.registry, "bob", bob_port, DeviceStatus::Running).await;

    let (bob_token, _) = f.tokens.mint("bob", "Bob").unwrap();
    let mut req = request("/alice-device/vnc.html", Some(&bob_token));
    req.headers_mut()
        .insert("x-device-id", "alice-device".parse().unwrap());

    let response = f.router.route(req).await.unwrap();
    assert!(body_text(response).await.starts_with("bob-upstream "));

    // A user without a device is not routed anywhere
    let (carol_token, _) = f.tokens.mint("carol", "Carol").unwrap();
    assert!(matches!(
        f.router.route(request("/", Some(&carol_token))).await,
        Err(RouteError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_expired_credential_rejected() {
    let f = fixture();
    let port = spawn_upstream("alice-upstream").await;
    add_device(&f.registry, "alice", port, DeviceStatus::Running).await;

    let now = Utc::now();
    let expired = Identity::new(
        "alice",
        "Alice",
        now - ChronoDuration::hours(2),
        now - ChronoDuration::minutes(1),
    );
    let token = f.tokens.issue(&expired).unwrap();

    assert!(matches!(
        f.router.route(request("/", Some(&token))).await,
        Err(RouteError::Unauthorized(AuthError::Expired))
    ));
}

#[tokio::test]
async fn test_pending_device_not_ready() {
    let f = fixture();
    add_device(&f.registry, "alice", 21000, DeviceStatus::Pending).await;
    let (token, _) = f.tokens.mint("alice", "Alice").unwrap();

    assert!(matches!(
        f.router.route(request("/", Some(&token))).await,
        Err(RouteError::DeviceNotReady {
            status: DeviceStatus::Pending,
            ..
        })
    ));
}

#[tokio::test]
async fn test_unreachable_upstream() {
    let f = fixture();
    // Bind then drop to get a port nothing listens on
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    add_device(&f.registry, "alice", port, DeviceStatus::Running).await;
    let (token, _) = f.tokens.mint("alice", "Alice").unwrap();

    assert!(matches!(
        f.router.route(request("/", Some(&token))).await,
        Err(RouteError::Upstream(_))
    ));
}

#[tokio::test]
async fn test_streamed_post_body_reaches_device() {
    let f = fixture();
    let port = spawn_echo_upstream().await;
    add_device(&f.registry, "alice", port, DeviceStatus::Running).await;
    let (token, _) = f.tokens.mint("alice", "Alice").unwrap();

    // Many chunks with no length up front
    let chunks: Vec<Vec<u8>> = (0..64u8).map(|i| vec![b'a' + i % 26; 16 * 1024]).collect();
    let expected = chunks.concat();
    let body = Body::from_stream(futures::stream::iter(
        chunks.into_iter().map(Ok::<_, std::io::Error>),
    ));

    let req = Request::builder()
        .method("POST")
        .uri("/upload")
        .header("authorization", format!("Bearer {}", token))
        .header("content-type", "application/octet-stream")
        .body(body)
        .unwrap();

    let response = f.router.route(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-method"], "POST");

    let echoed = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(echoed.len(), expected.len());
    assert!(echoed == expected);
}

#[tokio::test]
async fn test_upgraded_connection_is_spliced_to_device() {
    let f = fixture();
    let upstream = spawn_echo_upstream().await;
    add_device(&f.registry, "alice", upstream, DeviceStatus::Running).await;
    let (token, _) = f.tokens.mint("alice", "Alice").unwrap();
    let proxy = serve_proxy(f.router.clone()).await;

    let exchange = async {
        let mut stream = TcpStream::connect(("127.0.0.1", proxy)).await.unwrap();
        let handshake = format!(
            "GET /websockify HTTP/1.1\r\n\
             Host: 127.0.0.1:{proxy}\r\n\
             Authorization: Bearer {token}\r\n\
             Connection: Upgrade\r\n\
             Upgrade: echo\r\n\r\n"
        );
        stream.write_all(handshake.as_bytes()).await.unwrap();

        let head = read_response_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 101"), "unexpected head: {head}");

        for frame in [&b"hello device"[..], &b"second frame"[..]] {
            stream.write_all(frame).await.unwrap();
            let mut echoed = vec![0u8; frame.len()];
            stream.read_exact(&mut echoed).await.unwrap();
            assert_eq!(echoed, frame);
        }
    };

    tokio::time::timeout(Duration::from_secs(5), exchange)
        .await
        .expect("upgrade exchange timed out");
}

#[tokio::test]
async fn test_upgrade_without_credential_is_refused() {
    let f = fixture();
    let upstream = spawn_echo_upstream().await;
    add_device(&f.registry, "alice", upstream, DeviceStatus::Running).await;
    let proxy = serve_proxy(f.router.clone()).await;

    let mut stream = TcpStream::connect(("127.0.0.1", proxy)).await.unwrap();
    let handshake = format!(
        "GET /websockify HTTP/1.1\r\n\
         Host: 127.0.0.1:{proxy}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: echo\r\n\r\n"
    );
    stream.write_all(handshake.as_bytes()).await.unwrap();

    let head = tokio::time::timeout(Duration::from_secs(5), read_response_head(&mut stream))
        .await
        .unwrap();
    assert!(head.starts_with("HTTP/1.1 502"), "unexpected head: {head}");
}
