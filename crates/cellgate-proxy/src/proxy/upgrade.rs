//! WebSocket upgrade relay.
//!
//! Replays the client's upgrade handshake toward the backend gateway
//! (path prefix stripped, auth headers attached), relays the backend's
//! response verbatim, then wires the two sockets together:
//! backend-to-client bytes are copied unmodified; client-to-backend bytes
//! flow through the frame codec and the message rewriter, one frame at a
//! time, so forwarded order always matches receipt order.

use super::http::{backend_path_and_query, read_head, write_simple_response, HttpHead, USER_HEADER};
use super::{ConnectionInfo, ProxyGateway};
use crate::rewrite::{MessageRewriter, Rewrite};
use cellgate_core::{encode, Frame, FrameBuffer, GateError, GateResult, Opcode};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Kernel id from a channel path like `…/kernels/{id}/channels`.
pub(crate) fn kernel_id_from_path(path: &str) -> Option<String> {
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    segments
        .by_ref()
        .find(|s| *s == "kernels")
        .and_then(|_| segments.next())
        .map(str::to_string)
}

/// Build the upgrade request replayed toward the backend.
fn build_backend_upgrade(
    head: &HttpHead,
    backend_path: &str,
    host: &str,
    auth_token: Option<&str>,
    forward_user_auth: bool,
) -> Vec<u8> {
    let mut out = format!("{} {} HTTP/1.1\r\n", head.method, backend_path);
    for (name, value) in &head.headers {
        if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("authorization") {
            continue;
        }
        if name.eq_ignore_ascii_case(USER_HEADER) && !forward_user_auth {
            continue;
        }
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str(&format!("Host: {host}\r\n"));
    if let Some(token) = auth_token {
        out.push_str(&format!("Authorization: token {token}\r\n"));
    }
    out.push_str("\r\n");
    out.into_bytes()
}

fn response_status(head_bytes: &[u8]) -> Option<u16> {
    let text = std::str::from_utf8(head_bytes).ok()?;
    text.split_whitespace().nth(1)?.parse().ok()
}

/// Connect to the backend and replay the upgrade request.
async fn open_backend(addr: &str, request: &[u8]) -> GateResult<TcpStream> {
    let mut backend = TcpStream::connect(addr)
        .await
        .map_err(|e| GateError::UpstreamConnect(format!("connect {addr}: {e}")))?;
    backend
        .write_all(request)
        .await
        .map_err(|e| GateError::UpstreamConnect(format!("handshake write: {e}")))?;
    Ok(backend)
}

/// Handle one accepted upgrade request end to end.
pub(crate) async fn proxy_upgrade(
    gateway: Arc<ProxyGateway>,
    mut client: TcpStream,
    peer: std::net::SocketAddr,
    head: HttpHead,
    client_leftover: Vec<u8>,
) {
    let Some(stripped) = head.target.strip_prefix(&gateway.config.prefix) else {
        debug!(target = %head.target, "upgrade outside configured prefix");
        write_simple_response(&mut client, 404, "Not Found", "unknown path").await;
        return;
    };
    let Some(kernel_id) = kernel_id_from_path(head.path()) else {
        debug!(target = %head.target, "upgrade target is not a kernel channel");
        write_simple_response(&mut client, 404, "Not Found", "unknown path").await;
        return;
    };

    let host = gateway.config.gateway_host().to_string();
    let port = gateway.config.gateway_port();
    let backend_addr = format!("{host}:{port}");

    // Same composition as control-plane forwarding, so a gateway URL
    // carrying a base path routes channels and kernels identically.
    let backend_path = match backend_path_and_query(&gateway.config.gateway_url, stripped) {
        Ok(path) => path,
        Err(e) => {
            warn!(target = %head.target, error = %e, "cannot build backend path");
            write_simple_response(&mut client, 502, "Bad Gateway", "bad backend url").await;
            return;
        }
    };
    let request = build_backend_upgrade(
        &head,
        &backend_path,
        &backend_addr,
        gateway.config.auth_token.as_deref(),
        gateway.config.forward_user_auth,
    );
    let mut backend = match open_backend(&backend_addr, &request).await {
        Ok(stream) => stream,
        Err(e) => {
            // Fatal to this connection only, never process-wide.
            warn!(backend = %backend_addr, error = %e, "backend connect failed");
            write_simple_response(&mut client, 502, "Bad Gateway", "backend unreachable").await;
            return;
        }
    };

    // Relay the backend's handshake response verbatim; the client's
    // Sec-WebSocket-Key passed through, so the accept key matches.
    let (response_head, backend_leftover) = match read_head(&mut backend).await {
        Ok(parts) => parts,
        Err(e) => {
            warn!(backend = %backend_addr, error = %e, "backend handshake read failed");
            write_simple_response(&mut client, 502, "Bad Gateway", "backend unreachable").await;
            return;
        }
    };
    if client.write_all(&response_head).await.is_err() {
        return;
    }

    if response_status(&response_head) != Some(101) {
        warn!(
            backend = %backend_addr,
            status = response_status(&response_head),
            "backend rejected the upgrade"
        );
        return;
    }
    if !backend_leftover.is_empty() && client.write_all(&backend_leftover).await.is_err() {
        return;
    }

    info!(kernel_id = %kernel_id, peer = %peer, "proxied connection established");

    // A reconnect within the retention window keeps the kernel alive.
    gateway.reaper.cancel(&kernel_id).await;

    let info = ConnectionInfo {
        kernel_id: kernel_id.clone(),
        peer,
        target: head.target.clone(),
    };
    gateway.notify_observers(&head, &info).await;

    let (mut backend_read, backend_write) = backend.into_split();
    let (client_read, mut client_write) = client.into_split();

    // Backend-to-client flows unchanged.
    let downstream = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut backend_read, &mut client_write).await;
    });

    let rewriter = Arc::clone(&gateway.rewriter);
    if let Err(e) = pump_frames(client_read, backend_write, rewriter, &client_leftover).await {
        debug!(kernel_id = %kernel_id, error = %e, "client relay ended with error");
    }

    downstream.abort();

    // Client gone: keep the kernel for the retention window, then delete.
    info!(kernel_id = %kernel_id, "client disconnected, scheduling kernel deletion");
    gateway.reaper.schedule(&kernel_id).await;
}

/// Pump client frames to the backend through the rewriting pipeline.
///
/// One sequential loop per connection: a frame's rewrite-and-forward
/// completes before the next frame is considered, so backend order always
/// matches receipt order even when rewrite latencies vary.
pub(crate) async fn pump_frames<R, W>(
    mut reader: R,
    mut writer: W,
    rewriter: Arc<MessageRewriter>,
    initial: &[u8],
) -> GateResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut frames = FrameBuffer::new();
    let mut ready = frames.feed(initial);
    let mut buf = vec![0u8; 8192];

    loop {
        for frame in ready.drain(..) {
            forward_frame(&mut writer, &rewriter, frame).await?;
        }
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        ready = frames.feed(&buf[..n]);
    }
    Ok(())
}

async fn forward_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    rewriter: &MessageRewriter,
    frame: Frame,
) -> GateResult<()> {
    if frame.opcode != Opcode::Text {
        // Control and binary frames pass through unexamined.
        writer.write_all(&encode(&[frame])).await?;
        return Ok(());
    }

    match rewriter.substitute(&frame.payload_text()).await {
        Rewrite::Forward(payload) => {
            let out = Frame {
                fin: frame.fin,
                opcode: Opcode::Text,
                mask: frame.mask,
                payload: payload.into_bytes(),
            };
            writer.write_all(&encode(&[out])).await?;
        }
        Rewrite::Discard => {
            debug!("message suppressed by rewriter");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionRegistry;
    use cellgate_core::{decode, GateError, Notebook, NotebookStore};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn extracts_kernel_id_from_channel_path() {
        assert_eq!(
            kernel_id_from_path("/api/kernels/abc-123/channels").as_deref(),
            Some("abc-123")
        );
        assert_eq!(kernel_id_from_path("/api/sessions"), None);
        assert_eq!(kernel_id_from_path("/api/kernels"), None);
    }

    #[test]
    fn backend_upgrade_rewrites_host_and_auth() {
        let head = HttpHead::parse(
            b"GET /api/kernels/k/channels HTTP/1.1\r\n\
              Host: proxy:9700\r\n\
              Authorization: Bearer client-token\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              X-Forwarded-User: {\"name\":\"jo\"}\r\n\r\n",
        )
        .unwrap();

        let bytes = build_backend_upgrade(&head, "/api/kernels/k/channels", "kg:8888", Some("tok"), false);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("GET /api/kernels/k/channels HTTP/1.1\r\n"));
        assert!(text.contains("Host: kg:8888\r\n"));
        assert!(text.contains("Authorization: token tok\r\n"));
        assert!(text.contains("Upgrade: websocket\r\n"));
        // Client credentials and identity are not leaked unless enabled.
        assert!(!text.contains("Bearer client-token"));
        assert!(!text.contains("X-Forwarded-User"));

        let with_user = build_backend_upgrade(&head, "/x", "kg:8888", None, true);
        let text = String::from_utf8(with_user).unwrap();
        assert!(text.contains("X-Forwarded-User"));
        assert!(!text.contains("Authorization"));
    }

    #[tokio::test]
    async fn unreachable_backend_is_an_upstream_connect_error() {
        let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = unused.local_addr().unwrap().to_string();
        drop(unused);

        let err = open_backend(&dead_addr, b"GET / HTTP/1.1\r\n\r\n")
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::UpstreamConnect(_)));
    }

    #[test]
    fn parses_response_status() {
        assert_eq!(response_status(b"HTTP/1.1 101 Switching Protocols\r\n\r\n"), Some(101));
        assert_eq!(response_status(b"HTTP/1.1 403 Forbidden\r\n\r\n"), Some(403));
    }

    /// Store whose first lookup is slow, for ordering tests.
    struct SlowFirstStore {
        first: AtomicBool,
    }

    #[async_trait::async_trait]
    impl NotebookStore for SlowFirstStore {
        async fn get(&self, _path: &str) -> cellgate_core::GateResult<Arc<Notebook>> {
            if self.first.swap(false, Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Ok(Arc::new(
                serde_json::from_str(
                    r#"{"cells": [
                        {"cell_type": "code", "source": ["first()"]},
                        {"cell_type": "code", "source": ["second()"]}
                    ]}"#,
                )
                .unwrap(),
            ))
        }
    }

    struct RejectingStore;

    #[async_trait::async_trait]
    impl NotebookStore for RejectingStore {
        async fn get(&self, path: &str) -> cellgate_core::GateResult<Arc<Notebook>> {
            Err(GateError::Lookup(format!("no {path}")))
        }
    }

    fn execute_frame(session: &str, code: &str) -> Frame {
        let payload = serde_json::json!({
            "header": {"msg_type": "execute_request", "session": session},
            "content": {"code": code}
        })
        .to_string();
        Frame {
            fin: true,
            opcode: Opcode::Text,
            mask: Some([0x11, 0x22, 0x33, 0x44]),
            payload: payload.into_bytes(),
        }
    }

    async fn run_pump(rewriter: Arc<MessageRewriter>, frames: &[Frame]) -> Vec<Frame> {
        let (mut client_tx, client_rx) = tokio::io::duplex(64 * 1024);
        let (backend_tx, mut backend_rx) = tokio::io::duplex(64 * 1024);

        let wire = encode(frames);
        let writer = tokio::spawn(async move {
            client_tx.write_all(&wire).await.unwrap();
            // Dropping closes the client side; the pump sees EOF.
        });

        pump_frames(client_rx, backend_tx, rewriter, &[]).await.unwrap();
        writer.await.unwrap();

        let mut out = Vec::new();
        backend_rx.read_to_end(&mut out).await.unwrap();
        decode(&out)
    }

    #[tokio::test(start_paused = true)]
    async fn preserves_order_when_first_rewrite_is_slow() {
        let sessions = Arc::new(SessionRegistry::new());
        sessions.record("s1".into(), "nb.ipynb".into()).await;
        let rewriter = Arc::new(MessageRewriter::new(
            sessions,
            Arc::new(SlowFirstStore {
                first: AtomicBool::new(true),
            }),
        ));

        // A's lookup stalls 500ms; B's resolves immediately. Forwarded
        // order must still be A then B.
        let forwarded = run_pump(
            rewriter,
            &[execute_frame("s1", "0"), execute_frame("s1", "1")],
        )
        .await;

        assert_eq!(forwarded.len(), 2);
        let first: serde_json::Value =
            serde_json::from_slice(&forwarded[0].payload).unwrap();
        let second: serde_json::Value =
            serde_json::from_slice(&forwarded[1].payload).unwrap();
        assert_eq!(first["content"]["code"], "first()");
        assert_eq!(second["content"]["code"], "second()");
    }

    #[tokio::test]
    async fn discarded_message_keeps_the_stream_alive() {
        let sessions = Arc::new(SessionRegistry::new());
        sessions.record("s1".into(), "nb.ipynb".into()).await;
        let rewriter = Arc::new(MessageRewriter::new(sessions, Arc::new(RejectingStore)));

        let heartbeat = Frame {
            fin: true,
            opcode: Opcode::Text,
            mask: Some([1, 2, 3, 4]),
            payload: br#"{"header": {"msg_type": "kernel_info_request", "session": "s1"}}"#.to_vec(),
        };
        let forwarded = run_pump(
            rewriter,
            &[execute_frame("s1", "0"), heartbeat.clone()],
        )
        .await;

        // The execute request was suppressed; the following message
        // still went through, unchanged.
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].payload, heartbeat.payload);
    }

    #[tokio::test]
    async fn binary_and_control_frames_pass_through() {
        let sessions = Arc::new(SessionRegistry::new());
        let rewriter = Arc::new(MessageRewriter::new(sessions, Arc::new(RejectingStore)));

        let ping = Frame {
            fin: true,
            opcode: Opcode::Ping,
            mask: Some([9, 9, 9, 9]),
            payload: b"hb".to_vec(),
        };
        let blob = Frame {
            fin: true,
            opcode: Opcode::Binary,
            mask: Some([5, 6, 7, 8]),
            payload: vec![0xDE, 0xAD, 0xBE, 0xEF],
        };
        let forwarded = run_pump(rewriter, &[ping.clone(), blob.clone()]).await;

        assert_eq!(forwarded.len(), 2);
        assert_eq!(forwarded[0].opcode, Opcode::Ping);
        assert_eq!(forwarded[1].payload, blob.payload);
    }
}
