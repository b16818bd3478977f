//! Minimal HTTP/1.1 head handling and control-plane passthrough.
//!
//! The proxy only needs to understand enough HTTP to (a) recognize a
//! WebSocket upgrade and replay it toward the backend, and (b) forward
//! plain control-plane requests (kernel create and friends) through
//! `reqwest`, observing kernel-creation responses to populate the
//! session registry.

use super::ProxyGateway;
use cellgate_core::{GateError, GateResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Cap on request/response head size.
const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Request header carrying the notebook path at kernel-creation time.
pub const NOTEBOOK_PATH_HEADER: &str = "x-kernel-notebook-path";
/// Request header carrying the session id at kernel-creation time.
pub const SESSION_ID_HEADER: &str = "x-kernel-session-id";
/// Serialized caller identity, forwarded when user-auth forwarding is on.
pub const USER_HEADER: &str = "x-forwarded-user";

/// A parsed HTTP/1.1 request or response head.
#[derive(Debug, Clone)]
pub struct HttpHead {
    /// Request method, or the HTTP version for a response head.
    pub method: String,
    /// Request target (path + query), or the status code for a response.
    pub target: String,
    pub headers: Vec<(String, String)>,
}

impl HttpHead {
    /// Parse head bytes (start line through the blank line).
    pub fn parse(bytes: &[u8]) -> GateResult<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| GateError::Http("head is not valid UTF-8".to_string()))?;
        let mut lines = text.split("\r\n");

        let start = lines
            .next()
            .ok_or_else(|| GateError::Http("empty head".to_string()))?;
        let mut parts = start.split_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| GateError::Http("missing method".to_string()))?
            .to_string();
        let target = parts
            .next()
            .ok_or_else(|| GateError::Http("missing request target".to_string()))?
            .to_string();

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
        }

        Ok(Self {
            method,
            target,
            headers,
        })
    }

    /// First header value with the given name, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether this request asks for a WebSocket upgrade.
    pub fn is_upgrade(&self) -> bool {
        let upgrade = self
            .header("upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
        let connection = self
            .header("connection")
            .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"));
        upgrade && connection
    }

    /// Request path without the query string.
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or(&self.target)
    }
}

/// Read a head (up to and including `\r\n\r\n`) from a stream.
///
/// Returns the raw head bytes and any bytes read past the blank line.
pub async fn read_head<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> GateResult<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = find_blank_line(&buf) {
            let leftover = buf.split_off(end);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(GateError::Http("request head too large".to_string()));
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(GateError::Http("connection closed mid-head".to_string()));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Write a minimal diagnostic response and close.
pub async fn write_simple_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: u16,
    reason: &str,
    body: &str,
) {
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = writer.write_all(response.as_bytes()).await;
}

/// Compose the backend URL for a stripped request target.
///
/// The client prefix has already been removed; the backend's own `/api`
/// base is prepended under whatever path the gateway URL carries.
pub fn backend_target(gateway_url: &reqwest::Url, stripped: &str) -> GateResult<reqwest::Url> {
    let (path, query) = match stripped.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (stripped, None),
    };
    let mut url = gateway_url.clone();
    let base = gateway_url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{base}/api{path}"));
    url.set_query(query);
    Ok(url)
}

/// Path-and-query form of [`backend_target`], for raw request lines.
pub fn backend_path_and_query(
    gateway_url: &reqwest::Url,
    stripped: &str,
) -> GateResult<String> {
    let url = backend_target(gateway_url, stripped)?;
    Ok(match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    })
}

/// Forward a plain control-plane request to the backend via `reqwest`,
/// observing kernel-creation responses to populate the session registry.
pub(crate) async fn proxy_api_request<S: AsyncRead + AsyncWrite + Unpin>(
    gateway: &ProxyGateway,
    stream: &mut S,
    head: HttpHead,
    leftover: Vec<u8>,
) {
    let Some(stripped) = head.target.strip_prefix(&gateway.config.prefix) else {
        debug!(target = %head.target, "request outside configured prefix");
        write_simple_response(stream, 404, "Not Found", "unknown path").await;
        return;
    };
    let stripped = stripped.to_string();

    // Collect the body per Content-Length.
    let content_length: usize = head
        .header("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = leftover;
    body.truncate(content_length.min(body.len()));
    let mut chunk = [0u8; 4096];
    while body.len() < content_length {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => body.extend_from_slice(&chunk[..n]),
            Err(e) => {
                debug!(error = %e, "client body read failed");
                return;
            }
        }
    }

    let method = match reqwest::Method::from_bytes(head.method.as_bytes()) {
        Ok(m) => m,
        Err(_) => {
            write_simple_response(stream, 400, "Bad Request", "bad method").await;
            return;
        }
    };
    let url = match backend_target(&gateway.config.gateway_url, &stripped) {
        Ok(u) => u,
        Err(e) => {
            warn!(error = %e, "cannot build backend url");
            write_simple_response(stream, 502, "Bad Gateway", "bad backend url").await;
            return;
        }
    };

    let is_kernel_create = method == reqwest::Method::POST && head.path().ends_with("/kernels");

    let mut request = gateway.http.request(method, url.clone()).body(body);
    if let Some(ct) = head.header("content-type") {
        request = request.header(reqwest::header::CONTENT_TYPE, ct);
    }
    if let Some(token) = &gateway.config.auth_token {
        request = request.header(reqwest::header::AUTHORIZATION, format!("token {token}"));
    }
    if gateway.config.forward_user_auth {
        if let Some(user) = head.header(USER_HEADER) {
            request = request.header(USER_HEADER, user);
        }
    }

    let response = match request.send().await {
        Ok(r) => r,
        Err(e) => {
            warn!(url = %url, error = %e, "backend request failed");
            write_simple_response(stream, 502, "Bad Gateway", "backend unreachable").await;
            return;
        }
    };

    let status = response.status();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let response_body = match response.bytes().await {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "backend response read failed");
            write_simple_response(stream, 502, "Bad Gateway", "backend read failed").await;
            return;
        }
    };

    // Control-plane correlation: a successful kernel creation binds the
    // session id to the notebook path supplied as request metadata.
    if is_kernel_create && status.is_success() {
        observe_kernel_creation(gateway, &head, &response_body).await;
    }

    let reason = status.canonical_reason().unwrap_or("");
    let head_out = format!(
        "HTTP/1.1 {} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status.as_u16(),
        response_body.len()
    );
    if stream.write_all(head_out.as_bytes()).await.is_ok() {
        let _ = stream.write_all(&response_body).await;
    }
}

async fn observe_kernel_creation(gateway: &ProxyGateway, head: &HttpHead, body: &[u8]) {
    let kernel_id = serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("id").and_then(|id| id.as_str()).map(str::to_string));

    let Some(kernel_id) = kernel_id else {
        debug!("kernel creation response without an id");
        return;
    };

    match (head.header(NOTEBOOK_PATH_HEADER), head.header(SESSION_ID_HEADER)) {
        (Some(notebook_path), Some(session_id)) => {
            info!(kernel_id = %kernel_id, session_id, notebook = %notebook_path, "kernel created");
            gateway
                .registry
                .record(session_id.to_string(), notebook_path.to_string())
                .await;
        }
        _ => {
            debug!(kernel_id = %kernel_id, "kernel created without correlation headers");
        }
    }
}
