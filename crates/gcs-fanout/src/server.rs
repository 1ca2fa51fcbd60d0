//! Viewer-facing server.
//!
//! * `Upgrade: websocket` on the configured path → registered subscriber,
//!   one text frame per broadcast.
//! * Plain `GET`/`HEAD` on any path → current snapshot as JSON.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use gcs_fc::shutdown_requested;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::broadcast::{snapshot_payload, Fanout};
use crate::registry::Subscriber;
use crate::ViewerConfig;

const MAX_HEAD: usize = 16 * 1024;
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ViewerServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

struct Shared {
    fanout: Arc<Fanout>,
    ws_path: String,
    buffer: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Subscribe,
    Snapshot { head_only: bool },
    NotFound,
    MethodNotAllowed,
    BadRequest,
}

impl ViewerServer {
    pub async fn bind(cfg: &ViewerConfig, fanout: Arc<Fanout>) -> Result<Self> {
        let listener = TcpListener::bind(cfg.bind())
            .await
            .with_context(|| format!("bind viewer server on {}", cfg.bind()))?;
        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                fanout,
                ws_path: cfg.ws_path().to_string(),
                buffer: cfg.subscriber_buffer(),
            }),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts viewers until `shutdown` fires.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        match self.local_addr() {
            Ok(addr) => info!("viewer: listening on {} (websocket {})", addr, self.shared.ws_path),
            Err(e) => warn!("viewer: listening on unknown address: {}", e),
        }

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let shared = self.shared.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, shared, shutdown).await {
                                debug!("viewer: {}: {:#}", peer, e);
                            }
                        });
                    }
                    Err(e) => warn!("viewer: accept error: {}", e),
                },
            }
        }
        info!("viewer: stopped");
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let read = tokio::time::timeout(HEAD_TIMEOUT, read_head(&mut stream))
        .await
        .map_err(|_| anyhow::anyhow!("no request head within {:?}", HEAD_TIMEOUT))??;
    let Some((buf, head_len)) = read else {
        return respond(&mut stream, "431 Request Header Fields Too Large", "{}", false).await;
    };
    let head = String::from_utf8_lossy(&buf[..head_len]).into_owned();

    match route(&head, &shared.ws_path) {
        Route::Subscribe => {
            let (Some(key), Some("13")) = (header(&head, "sec-websocket-key"), header(&head, "sec-websocket-version"))
            else {
                return respond(&mut stream, "400 Bad Request", "{}", false).await;
            };
            let accept = derive_accept_key(key.as_bytes());
            let reply = format!(
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Accept: {}\r\n\
                 \r\n",
                accept
            );
            stream.write_all(reply.as_bytes()).await.context("write handshake")?;
            // bytes past the head belong to the websocket
            let rest = buf[head_len..].to_vec();
            let ws = WebSocketStream::from_partially_read(stream, rest, Role::Server, None).await;
            handle_ws(ws, peer, &shared, shutdown).await
        }
        Route::Snapshot { head_only } => {
            let body = snapshot_payload(shared.fanout.store());
            respond(&mut stream, "200 OK", &body, head_only).await
        }
        Route::NotFound => respond(&mut stream, "404 Not Found", "{}", false).await,
        Route::MethodNotAllowed => respond(&mut stream, "405 Method Not Allowed", "{}", false).await,
        Route::BadRequest => respond(&mut stream, "400 Bad Request", "{}", false).await,
    }
}

/// Reads until the blank line ending the request head. Returns the bytes read
/// (possibly running past the head) and the head length, or `None` if the
/// head is over `MAX_HEAD`.
async fn read_head(stream: &mut TcpStream) -> Result<Option<(Vec<u8>, usize)>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = head_end(&buf) {
            return Ok(Some((buf, end)));
        }
        if buf.len() >= MAX_HEAD {
            return Ok(None);
        }
        let n = stream.read(&mut chunk).await.context("read request")?;
        anyhow::ensure!(n > 0, "connection closed mid-request");
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

async fn respond(stream: &mut TcpStream, status: &str, body: &str, head_only: bool) -> Result<()> {
    let response = http_response(status, body, head_only);
    stream.write_all(response.as_bytes()).await.context("write response")?;
    stream.shutdown().await.ok();
    Ok(())
}

async fn handle_ws(
    ws: WebSocketStream<TcpStream>,
    peer: SocketAddr,
    shared: &Shared,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let registry = shared.fanout.registry();
    let (sub, mut rx) = Subscriber::channel(shared.buffer);
    let id = registry.register(sub);
    info!("viewer: {} connected as {} ({} connected)", peer, id, registry.len());

    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
            payload = rx.recv() => match payload {
                Some(p) => {
                    if let Err(e) = ws_tx.send(Message::Text(p.to_string().into())).await {
                        debug!("viewer: {} write failed: {}", peer, e);
                        break;
                    }
                }
                // dropped by the fan-out
                None => break,
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!("viewer: {} read failed: {}", peer, e);
                    break;
                }
                // viewers have nothing to say
                Some(Ok(_)) => {}
            },
        }
    }

    registry.unregister(id);
    info!("viewer: {} ({}) disconnected ({} connected)", peer, id, registry.len());
    Ok(())
}

fn route(head: &str, ws_path: &str) -> Route {
    let Some(request_line) = head.lines().next() else { return Route::BadRequest };
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Route::BadRequest;
    };
    let path = target.split('?').next().unwrap_or(target);

    let is_upgrade =
        header(head, "upgrade").is_some_and(|v| v.to_ascii_lowercase().contains("websocket"));

    match (method, is_upgrade) {
        ("GET", true) if path == ws_path => Route::Subscribe,
        (_, true) => Route::NotFound,
        ("GET", false) => Route::Snapshot { head_only: false },
        ("HEAD", false) => Route::Snapshot { head_only: true },
        _ => Route::MethodNotAllowed,
    }
}

/// First value of header `name`, case-insensitive.
fn header<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

fn http_response(status: &str, body: &str, head_only: bool) -> String {
    format!(
        "HTTP/1.1 {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Cache-Control: no-store\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        body.len(),
        if head_only { "" } else { body }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use gcs_fc::{FieldUpdate, TelemetryStore};
    use serde_json::Value;
    use std::time::Duration;
    use tokio_tungstenite::connect_async;

    const UPGRADE: &str = "GET /ws HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";

    #[test]
    fn routes() {
        assert_eq!(route(UPGRADE, "/ws"), Route::Subscribe);
        assert_eq!(route("GET /ws?token=x HTTP/1.1\r\nupgrade: WebSocket\r\n\r\n", "/ws"), Route::Subscribe);
        assert_eq!(route(UPGRADE, "/telemetry"), Route::NotFound);
        assert_eq!(route("GET /state HTTP/1.1\r\nHost: x\r\n\r\n", "/ws"), Route::Snapshot { head_only: false });
        assert_eq!(route("HEAD / HTTP/1.1\r\n\r\n", "/ws"), Route::Snapshot { head_only: true });
        assert_eq!(route("POST /state HTTP/1.1\r\n\r\n", "/ws"), Route::MethodNotAllowed);
        assert_eq!(route("", "/ws"), Route::BadRequest);
        assert_eq!(route("garbage\r\n", "/ws"), Route::BadRequest);
    }

    #[test]
    fn head_response_keeps_length_but_no_body() {
        let r = http_response("200 OK", "{\"a\":1}", true);
        assert!(r.contains("Content-Length: 7\r\n"));
        assert!(r.ends_with("\r\n\r\n"));
    }

    #[test]
    fn header_lookup_is_case_insensitive_and_skips_request_line() {
        let head = "GET /ws HTTP/1.1\r\nHost: localhost:8000\r\nsec-websocket-key:  abc== \r\n\r\n";
        assert_eq!(header(head, "Sec-WebSocket-Key"), Some("abc=="));
        assert_eq!(header(head, "host"), Some("localhost:8000"));
        assert_eq!(header(head, "upgrade"), None);
        assert_eq!(header("GET: x\r\n\r\n", "get"), None);
    }

    #[test]
    fn head_end_finds_blank_line() {
        assert_eq!(head_end(b"GET / HTTP/1.1\r\n\r\nrest"), Some(18));
        assert_eq!(head_end(b"GET / HTTP/1.1\r\nHost: x\r\n"), None);
    }

    const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
    const ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

    async fn read_response_head(stream: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    async fn start() -> (SocketAddr, Arc<Fanout>, watch::Sender<bool>) {
        let fanout = Arc::new(Fanout::new(Arc::new(TelemetryStore::new()), Arc::new(Registry::new())));
        let cfg = ViewerConfig { bind: Some("127.0.0.1:0".into()), ..Default::default() };
        let server = ViewerServer::bind(&cfg, fanout.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(server.serve(stop_rx));
        (addr, fanout, stop_tx)
    }

    async fn wait_for_viewers(fanout: &Fanout, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while fanout.registry().len() != n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("viewer count never settled");
    }

    #[tokio::test]
    async fn websocket_viewer_receives_broadcast() {
        let (addr, fanout, _stop) = start().await;
        let (mut ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        wait_for_viewers(&fanout, 1).await;

        fanout.store().apply(&[FieldUpdate::Latitude(47.397742), FieldUpdate::Armed(true)]);
        let report = fanout.broadcast().await;
        assert_eq!(report.delivered, 1);

        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let v: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
        assert_eq!(v["lat"], 47.397742);
        assert_eq!(v["armed"], true);

        ws.close(None).await.unwrap();
        wait_for_viewers(&fanout, 0).await;
    }

    #[tokio::test]
    async fn plain_http_gets_snapshot() {
        let (addr, fanout, _stop) = start().await;
        fanout.store().update(FieldUpdate::Heading(180));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET /state HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
        let mut resp = String::new();
        stream.read_to_string(&mut resp).await.unwrap();

        assert!(resp.starts_with("HTTP/1.1 200 OK"), "{resp}");
        assert!(resp.contains("Access-Control-Allow-Origin: *"));
        let body = resp.split("\r\n\r\n").nth(1).unwrap();
        let v: Value = serde_json::from_str(body).unwrap();
        assert_eq!(v["heading"], 180);
        assert_eq!(v["mode"], "UNKNOWN");
        assert!(fanout.registry().is_empty());
    }

    #[tokio::test]
    async fn shutdown_closes_viewers() {
        let (addr, fanout, stop) = start().await;
        let (mut ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        wait_for_viewers(&fanout, 1).await;

        stop.send(true).unwrap();

        let next = tokio::time::timeout(Duration::from_secs(5), ws.next()).await.unwrap();
        assert!(matches!(next, Some(Ok(Message::Close(_))) | None | Some(Err(_))));
        wait_for_viewers(&fanout, 0).await;
    }

    #[tokio::test]
    async fn upgrade_with_long_head_in_two_segments_subscribes() {
        let (addr, fanout, _stop) = start().await;
        let cookie = "c".repeat(3000);
        let request = format!(
            "GET /ws HTTP/1.1\r\nHost: localhost\r\nCookie: session={cookie}\r\n\
             Upgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Key: {KEY}\r\nSec-WebSocket-Version: 13\r\n\r\n"
        );
        let (first, second) = request.as_bytes().split_at(1500);

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(first).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        stream.write_all(second).await.unwrap();

        let head = read_response_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 101"), "{head}");
        assert!(head.contains(&format!("Sec-WebSocket-Accept: {ACCEPT}\r\n")), "{head}");
        wait_for_viewers(&fanout, 1).await;

        let mut ws = WebSocketStream::from_raw_socket(stream, Role::Client, None).await;
        fanout.store().update(FieldUpdate::Armed(true));
        assert_eq!(fanout.broadcast().await.delivered, 1);

        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let v: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
        assert_eq!(v["armed"], true);
    }

    #[tokio::test]
    async fn upgrade_without_key_is_rejected() {
        let (addr, fanout, _stop) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(UPGRADE.as_bytes()).await.unwrap();

        let mut resp = String::new();
        stream.read_to_string(&mut resp).await.unwrap();
        assert!(resp.starts_with("HTTP/1.1 400"), "{resp}");
        assert!(fanout.registry().is_empty());
    }

    #[tokio::test]
    async fn oversized_head_is_refused() {
        let (addr, _fanout, _stop) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        // exactly MAX_HEAD bytes and no blank line, so nothing is left unread
        let mut request = b"GET / HTTP/1.1\r\nX-Filler: ".to_vec();
        request.resize(MAX_HEAD, b'x');
        stream.write_all(&request).await.unwrap();

        let head = read_response_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 431"), "{head}");
    }
}
