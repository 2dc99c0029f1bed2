//! End-to-end tests over a real listener: subdomain routing, the platform
//! API and the WebSocket event stream.

mod common;

use common::TestPlatform;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::{SinkExt, StreamExt};
use hostdeck::db::ServiceStatus;
use hostdeck::events::Event;
use hostdeck::proxy::BASE_DOMAIN_KEY;
use hostdeck::ws::EventStream;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

struct Harness {
    t: TestPlatform,
    addr: SocketAddr,
    _shutdown: watch::Sender<bool>,
}

impl Harness {
    async fn start() -> Self {
        let t = TestPlatform::new().await;
        t.db().set_setting(BASE_DOMAIN_KEY, "example.test").unwrap();
        t.platform.domains.invalidate();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, rx) = watch::channel(false);
        let server = t.platform.server(rx);
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        Self {
            t,
            addr,
            _shutdown: shutdown,
        }
    }

    async fn request(&self, method: &str, host: &str, path: &str, body: &[u8]) -> (u16, String) {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        let head = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\nContent-Length: {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n",
            method,
            path,
            host,
            body.len()
        );
        stream.write_all(head.as_bytes()).await.unwrap();
        stream.write_all(body).await.unwrap();

        let mut raw = Vec::new();
        tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut raw))
            .await
            .expect("response timed out")
            .unwrap();
        parse_response(&raw)
    }

    async fn get(&self, host: &str, path: &str) -> (u16, String) {
        self.request("GET", host, path, b"").await
    }
}

fn parse_response(raw: &[u8]) -> (u16, String) {
    let text = String::from_utf8_lossy(raw).to_string();
    let status = text
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

/// A loopback backend that answers every request with its own request head
async fn echo_backend() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    head.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.write_all(&head).await;
            });
        }
    });
    port
}

async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_live_service_is_proxied_with_forwarded_headers() {
    let h = Harness::start().await;
    let service = h.t.static_site("shop");
    let port = echo_backend().await;
    h.t.db()
        .set_service_container(&service.id, "c1", "img", port, ServiceStatus::Running)
        .unwrap();

    let (status, body) = h.get("shop.example.test", "/cart?id=3").await;
    assert_eq!(status, 200);
    assert!(body.starts_with("GET /cart?id=3 HTTP/1.1"));
    let lower = body.to_ascii_lowercase();
    assert!(lower.contains("x-forwarded-host: shop.example.test"));
    assert!(lower.contains("x-forwarded-proto: http"));
    assert!(lower.contains("x-request-id:"));
    // The client's Connection header belongs to its own hop
    assert!(!lower.contains("connection: close"));

    // Labels match case-insensitively
    let (status, _) = h.get("SHOP.Example.Test", "/").await;
    assert_eq!(status, 200);

    let stats = h.t.platform.proxy.pool().stats();
    assert_eq!(stats.requests(), 2);
    assert_eq!(stats.failures(), 0);
}

#[tokio::test]
async fn test_routing_failures_map_to_status_codes() {
    let h = Harness::start().await;

    let (status, body) = h.get("ghost.example.test", "/").await;
    assert_eq!(status, 404);
    assert!(body.contains("ghost"));

    let stopped = h.t.static_site("idle");
    h.t.db()
        .set_service_container(&stopped.id, "c2", "img", 24500, ServiceStatus::Stopped)
        .unwrap();
    let (status, _) = h.get("idle.example.test", "/").await;
    assert_eq!(status, 503);

    let broken = h.t.static_site("broken");
    let dead = unused_port().await;
    h.t.db()
        .set_service_container(&broken.id, "c3", "img", dead, ServiceStatus::Running)
        .unwrap();
    let (status, _) = h.get("broken.example.test", "/").await;
    assert_eq!(status, 502);

    // Only the dead upstream reached the pool
    let stats = h.t.platform.proxy.pool().stats();
    assert_eq!(stats.requests(), 1);
    assert_eq!(stats.failures(), 1);
}

#[tokio::test]
async fn test_platform_paths_are_never_proxied() {
    let h = Harness::start().await;
    let service = h.t.static_site("api-owner");
    let port = echo_backend().await;
    h.t.db()
        .set_service_container(&service.id, "c1", "img", port, ServiceStatus::Running)
        .unwrap();

    let (status, body) = h.get("example.test", "/api/health").await;
    assert_eq!(status, 200);
    assert!(body.contains(r#""engine":"ok""#));

    // Subdomain requests under /api/ reach the platform, not the service
    let (status, body) = h.get("api-owner.example.test", "/api/health").await;
    assert_eq!(status, 200);
    assert!(body.contains(r#""success":true"#));
}

#[tokio::test]
async fn test_git_intake_validates_names() {
    let h = Harness::start().await;
    h.t.static_site("taken");

    let (status, body) = h
        .request(
            "POST",
            "example.test",
            "/api/services/git",
            br#"{"url":"https://example.invalid/repo.git","name":"TAKEN"}"#,
        )
        .await;
    assert_eq!(status, 409);
    assert!(body.contains(r#""success":false"#));

    let (status, _) = h
        .request(
            "POST",
            "example.test",
            "/api/services/git",
            br#"{"url":"https://example.invalid/repo.git","name":"-bad name-"}"#,
        )
        .await;
    assert_eq!(status, 400);

    let (status, _) = h
        .request("POST", "example.test", "/api/services/git", b"not json")
        .await;
    assert_eq!(status, 400);

    assert_eq!(h.t.db().list_services().unwrap().len(), 1);
}

#[tokio::test]
async fn test_domain_change_takes_effect_immediately() {
    let h = Harness::start().await;
    let service = h.t.static_site("blog");
    let port = echo_backend().await;
    h.t.db()
        .set_service_container(&service.id, "c1", "img", port, ServiceStatus::Running)
        .unwrap();

    let (status, _) = h
        .request("PUT", "example.test", "/api/settings/domain", br#"{"domain":"Apps.Internal."}"#)
        .await;
    assert_eq!(status, 200);

    let (status, body) = h.get("localhost", "/api/settings/domain").await;
    assert_eq!(status, 200);
    assert!(body.contains("apps.internal"));

    let (status, body) = h.get("blog.apps.internal", "/posts").await;
    assert_eq!(status, 200);
    assert!(body.starts_with("GET /posts"));
    // The old domain is no longer a routing suffix, so the platform answers
    let (status, _) = h.get("blog.example.test", "/posts").await;
    assert_eq!(status, 404);

    let (status, _) = h
        .request("PUT", "apps.internal", "/api/settings/domain", br#"{"domain":"not a domain"}"#)
        .await;
    assert_eq!(status, 400);
}

fn site_archive() -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    let html = b"<h1>uploaded</h1>";
    let mut header = tar::Header::new_gnu();
    header.set_size(html.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "site/index.html", &html[..])
        .unwrap();
    builder.into_inner().unwrap().finish().unwrap()
}

#[tokio::test]
async fn test_upload_intake_deploys_archive() {
    let h = Harness::start().await;

    let (status, body) = h
        .request(
            "POST",
            "example.test",
            "/api/services/upload?filename=site.tar.gz&name=site",
            &site_archive(),
        )
        .await;
    assert_eq!(status, 201, "{}", body);

    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    let id = json["data"]["id"].as_str().unwrap().to_string();
    assert!(json["data"]["port"].as_u64().is_some());

    let mut status = ServiceStatus::Building;
    for _ in 0..100 {
        status = h.t.service(&id).status;
        if status != ServiceStatus::Building {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(status, ServiceStatus::Running);

    // The archive's single top-level directory was flattened
    let source = hostdeck::source::Workspace::new(h.t.platform.config.services_dir()).source_dir(&id);
    assert!(source.join("index.html").is_file());

    // Staged uploads are cleaned up
    let staged = std::fs::read_dir(h.t.platform.config.uploads_dir()).unwrap().count();
    assert_eq!(staged, 0);
}

async fn next_event<S>(ws: &mut S, wanted: &str) -> serde_json::Value
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
                    if json["type"] == wanted {
                        return json;
                    }
                }
                Some(Ok(_)) => {}
                other => panic!("stream ended: {:?}", other),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {} event", wanted))
}

#[tokio::test]
async fn test_event_stream_delivers_logs_and_status() {
    let h = Harness::start().await;
    let service = h.t.static_site("chatty");
    h.t.deploy(&service.id).await.unwrap();
    let container = h.t.service(&service.id).container_id.unwrap();
    h.t.engine.emit(&container, "booted");

    let stream = TcpStream::connect(h.addr).await.unwrap();
    let (mut ws, _) = tokio_tungstenite::client_async("ws://example.test/api/events", stream)
        .await
        .unwrap();

    let subscribe = serde_json::json!({ "type": "subscribe_logs", "serviceId": service.id });
    ws.send(Message::Text(subscribe.to_string())).await.unwrap();

    let history = next_event(&mut ws, "log_history").await;
    assert_eq!(history["serviceId"], service.id.as_str());
    assert!(history["logs"]
        .as_array()
        .unwrap()
        .iter()
        .any(|line| line == "booted"));

    h.t.engine.emit(&container, "request handled");
    let log = loop {
        let log = next_event(&mut ws, "log").await;
        if log["message"] == "request handled" {
            break log;
        }
    };
    assert_eq!(log["serviceId"], service.id.as_str());

    h.t.platform
        .events
        .publish(Event::status(&service.id, ServiceStatus::Stopped));
    let status = next_event(&mut ws, "status").await;
    assert_eq!(status["status"], "stopped");

    let metrics = serde_json::json!({ "type": "get_metrics", "serviceId": service.id });
    ws.send(Message::Text(metrics.to_string())).await.unwrap();
    let sample = next_event(&mut ws, "metrics").await;
    assert_eq!(sample["serviceId"], service.id.as_str());
}

#[tokio::test]
async fn test_subscribe_answers_while_log_queue_is_full() {
    let t = TestPlatform::new().await;
    let alpha = t.static_site("alpha");
    let beta = t.static_site("beta");
    t.deploy(&alpha.id).await.unwrap();
    t.deploy(&beta.id).await.unwrap();
    let container = t.service(&alpha.id).container_id.unwrap();

    // A tiny pipe, so the server blocks on a client that stops reading
    let (client_io, server_io) = tokio::io::duplex(1024);
    let stream = EventStream::new(t.platform.db.clone(), t.platform.lifecycle.clone(), t.platform.events.clone());
    tokio::spawn(async move {
        let ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        stream.serve(ws).await;
    });
    let mut ws = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

    let subscribe = serde_json::json!({ "type": "subscribe_logs", "serviceId": alpha.id });
    ws.send(Message::Text(subscribe.to_string())).await.unwrap();
    next_event(&mut ws, "log_history").await;

    for i in 0..1280 {
        t.engine.emit(&container, &format!("line {}", i));
        tokio::task::yield_now().await;
    }

    let subscribe = serde_json::json!({ "type": "subscribe_logs", "serviceId": beta.id });
    ws.send(Message::Text(subscribe.to_string())).await.unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let history = next_event(&mut ws, "log_history").await;
            if history["serviceId"] == beta.id.as_str() {
                break;
            }
        }
    })
    .await
    .expect("subscription reply never arrived");
}

#[tokio::test]
async fn test_events_path_requires_upgrade() {
    let h = Harness::start().await;
    let (status, _) = h.get("example.test", "/api/events").await;
    assert_eq!(status, 400);
}

/// A backend that accepts any upgrade and greets in the same write as its 101
async fn greeting_upgrade_backend() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => head.extend_from_slice(&buf[..n]),
            }
        }
        let reply = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: chat\r\nConnection: Upgrade\r\n\r\nhello";
        if stream.write_all(reply).await.is_err() {
            return;
        }
        while let Ok(n) = stream.read(&mut buf).await {
            if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                return;
            }
        }
    });
    port
}

async fn read_until(stream: &mut TcpStream, raw: &mut Vec<u8>, wanted: &[u8]) {
    let mut buf = [0u8; 1024];
    tokio::time::timeout(Duration::from_secs(5), async {
        while !raw.windows(wanted.len()).any(|w| w == wanted) {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before {:?}", String::from_utf8_lossy(wanted));
            raw.extend_from_slice(&buf[..n]);
        }
    })
    .await
    .expect("upgraded bytes never arrived");
}

#[tokio::test]
async fn test_upgrade_forwards_bytes_sent_with_the_101() {
    let h = Harness::start().await;
    let service = h.t.static_site("chat");
    let port = greeting_upgrade_backend().await;
    h.t.db()
        .set_service_container(&service.id, "c1", "img", port, ServiceStatus::Running)
        .unwrap();

    let mut stream = TcpStream::connect(h.addr).await.unwrap();
    stream
        .write_all(b"GET /room HTTP/1.1\r\nHost: chat.example.test\r\nConnection: Upgrade\r\nUpgrade: chat\r\n\r\n")
        .await
        .unwrap();

    let mut raw = Vec::new();
    read_until(&mut stream, &mut raw, b"\r\n\r\n").await;
    assert!(raw.starts_with(b"HTTP/1.1 101"));
    read_until(&mut stream, &mut raw, b"hello").await;

    stream.write_all(b"ping").await.unwrap();
    read_until(&mut stream, &mut raw, b"ping").await;
}

#[tokio::test]
async fn test_listener_stops_when_shutdown_sender_is_dropped() {
    let t = TestPlatform::new().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (shutdown, rx) = watch::channel(false);
    let server = tokio::spawn(t.platform.server(rx).serve(listener));

    drop(shutdown);
    let result = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("listener kept running without a shutdown sender")
        .unwrap();
    assert!(result.is_ok());
}
