//! HTTP surface: listener, request parsing, response writing, routing.
//!
//! A non-blocking accept loop hands each connection to its own thread; one
//! request per connection, `Connection: close`. Streaming routes write the
//! multipart headers and then iterate a hub subscription, so a slow client
//! only ever stalls its own thread. Every response carries the
//! observability headers.

pub mod handlers;
mod pages;

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::auth::{gate, GateDecision, Session, SigningKey};
use crate::capture::CameraStream;
use crate::config::SettingsStore;
use crate::hub::Subscription;
use crate::snapshot::SnapshotWorker;
use crate::workers::StreamWorkers;

const MAX_REQUEST_BYTES: usize = 64 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_IDLE: Duration = Duration::from_millis(50);

pub const SESSION_COOKIE: &str = "session";
const PERMANENT_SESSION_SECS: u64 = 30 * 24 * 3600;

/// Everything the handlers need, shared across connection threads.
pub struct AppState {
    pub settings: Arc<SettingsStore>,
    pub camera: Arc<CameraStream>,
    pub workers: Arc<StreamWorkers>,
    pub snapshots: Arc<SnapshotWorker>,
    pub signing_key: SigningKey,
    /// Deployment bearer token for `/status`; empty means session auth.
    pub api_token: String,
    pub device_name: String,
    pub version: String,
    pub port: u16,
    pub login_user: String,
    pub login_pass: String,
}

impl AppState {
    pub fn device_id(&self) -> String {
        self.settings.device_id()
    }
}

#[derive(Debug)]
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("http server thread panicked"))?;
        }
        Ok(())
    }
}

/// Spawn the accept loop on an already-bound listener.
pub fn spawn(listener: TcpListener, state: Arc<AppState>) -> Result<ServerHandle> {
    let addr = listener.local_addr()?;
    listener.set_nonblocking(true)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_thread = shutdown.clone();
    let join = std::thread::Builder::new()
        .name("http-accept".to_string())
        .spawn(move || accept_loop(listener, state, shutdown_thread))
        .context("spawn http accept thread")?;

    Ok(ServerHandle {
        addr,
        shutdown,
        join: Some(join),
    })
}

fn accept_loop(listener: TcpListener, state: Arc<AppState>, shutdown: Arc<AtomicBool>) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let state = state.clone();
                let spawned = std::thread::Builder::new()
                    .name("http-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &state) {
                            log::debug!("http connection ended: {err}");
                        }
                    });
                if let Err(err) = spawned {
                    log::error!("failed to spawn connection thread: {err}");
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_IDLE);
            }
            Err(err) => {
                log::error!("http accept failed: {err}");
                std::thread::sleep(ACCEPT_IDLE);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Requests
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct HttpRequest {
    pub method: String,
    /// Path without the query string.
    pub path: String,
    /// Path including the query string, as requested.
    pub raw_path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.raw_path.split_once('?')?.1;
        parse_urlencoded(query).remove(name)
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        let header = self.header("cookie")?;
        for pair in header.split(';') {
            let (k, v) = pair.split_once('=')?;
            if k.trim() == name {
                return Some(v.trim().to_string());
            }
        }
        None
    }

    /// `application/x-www-form-urlencoded` body fields.
    pub fn form(&self) -> HashMap<String, String> {
        parse_urlencoded(&String::from_utf8_lossy(&self.body))
    }

    pub fn form_or_query(&self, name: &str) -> Option<String> {
        self.form().remove(name).or_else(|| self.query_param(name))
    }
}

fn parse_urlencoded(raw: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        let decode = |s: &str| {
            urlencoding::decode(&s.replace('+', " "))
                .map(|c| c.into_owned())
                .unwrap_or_else(|_| s.to_string())
        };
        map.insert(decode(k), decode(v));
    }
    map
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
    };

    let head = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if content_length > MAX_REQUEST_BYTES {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        raw_path: raw_path.to_string(),
        headers,
        body,
    })
}

// ----------------------------------------------------------------------------
// Responses
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl Response {
    pub fn new(status: u16, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type: content_type.to_string(),
            body: body.into(),
            headers: Vec::new(),
        }
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self::new(status, "text/plain; charset=utf-8", body.as_bytes().to_vec())
    }

    pub fn html(status: u16, body: String) -> Self {
        Self::new(status, "text/html; charset=utf-8", body.into_bytes())
    }

    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self::new(
            status,
            "application/json",
            serde_json::to_vec(value).unwrap_or_default(),
        )
    }

    pub fn redirect(location: &str) -> Self {
        let mut resp = Self::new(302, "text/html; charset=utf-8", Vec::new());
        resp.headers
            .push(("Location".to_string(), location.to_string()));
        resp
    }

    pub fn empty(status: u16) -> Self {
        Self::new(status, "text/plain; charset=utf-8", Vec::new())
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// A handler result: a complete response, or a stream subscription to drain
/// into the socket.
pub enum Reply {
    Full(Response),
    MultipartStream(Subscription),
}

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "HTTP/1.1 200 OK",
        204 => "HTTP/1.1 204 No Content",
        302 => "HTTP/1.1 302 Found",
        400 => "HTTP/1.1 400 Bad Request",
        401 => "HTTP/1.1 401 Unauthorized",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        502 => "HTTP/1.1 502 Bad Gateway",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    }
}

fn observability_headers(state: &AppState) -> String {
    format!(
        "Server: OpenSentry/{version}\r\nX-OpenSentry-Version: {version}\r\nX-OpenSentry-Device: {device}\r\n",
        version = state.version,
        device = state.device_id(),
    )
}

fn write_full_response(
    stream: &mut TcpStream,
    state: &AppState,
    response: &Response,
    set_cookie: Option<&str>,
) -> Result<()> {
    let mut head = String::new();
    head.push_str(status_line(response.status));
    head.push_str("\r\n");
    head.push_str(&format!("Content-Type: {}\r\n", response.content_type));
    head.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
    for (name, value) in &response.headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    if let Some(cookie) = set_cookie {
        head.push_str(&format!("Set-Cookie: {cookie}\r\n"));
    }
    head.push_str(&observability_headers(state));
    head.push_str("Connection: close\r\n\r\n");

    stream.write_all(head.as_bytes())?;
    stream.write_all(&response.body)?;
    Ok(())
}

fn write_multipart_stream(
    stream: &mut TcpStream,
    state: &AppState,
    subscription: Subscription,
    set_cookie: Option<&str>,
) -> Result<()> {
    let mut head = String::new();
    head.push_str(status_line(200));
    head.push_str("\r\n");
    head.push_str("Content-Type: multipart/x-mixed-replace; boundary=frame\r\n");
    head.push_str("Cache-Control: no-store, no-cache, must-revalidate, max-age=0, no-transform\r\n");
    head.push_str("Pragma: no-cache\r\n");
    head.push_str("Expires: 0\r\n");
    head.push_str("X-Accel-Buffering: no\r\n");
    if let Some(cookie) = set_cookie {
        head.push_str(&format!("Set-Cookie: {cookie}\r\n"));
    }
    head.push_str(&observability_headers(state));
    head.push_str("Connection: close\r\n\r\n");
    stream.write_all(head.as_bytes())?;

    // The subscription ends on hub shutdown; a write error means the client
    // went away. Neither blocks the producer.
    for part in subscription {
        stream.write_all(&part)?;
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Per-connection dispatch
// ----------------------------------------------------------------------------

fn session_cookie_header(key: &SigningKey, session: &Session) -> String {
    if session.is_empty() {
        format!("{SESSION_COOKIE}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0")
    } else {
        let value = key.encode_session(session);
        let mut cookie = format!("{SESSION_COOKIE}={value}; Path=/; HttpOnly; SameSite=Lax");
        if session.permanent {
            cookie.push_str(&format!("; Max-Age={PERMANENT_SESSION_SECS}"));
        }
        cookie
    }
}

fn handle_connection(mut stream: TcpStream, state: &AppState) -> Result<()> {
    // Accepted sockets do not reliably inherit the listener's blocking mode.
    stream.set_nonblocking(false)?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            let response = Response::text(400, "bad request");
            let _ = write_full_response(&mut stream, state, &response, None);
            return Err(err);
        }
    };

    let endpoint = handlers::route_endpoint(&request.path);
    let mut session = request
        .cookie(SESSION_COOKIE)
        .map(|value| state.signing_key.decode_session(&value))
        .unwrap_or_default();
    let session_before = session.clone();

    let reply = match gate(endpoint, &request.raw_path, &mut session, &state.settings.auth()) {
        GateDecision::Allow => handlers::dispatch(endpoint, &request, &mut session, state),
        GateDecision::RedirectOauth2Login => Reply::Full(Response::redirect("/oauth2/login")),
        GateDecision::RedirectLocalLogin => {
            let mut location = format!(
                "/login?next={}",
                urlencoding::encode(&request.raw_path)
            );
            if session.oauth2_fallback {
                location.push_str("&fallback=1");
            }
            Reply::Full(Response::redirect(&location))
        }
    };

    let cookie = (session != session_before)
        .then(|| session_cookie_header(&state.signing_key, &session));

    match reply {
        Reply::Full(response) => {
            if response.status >= 500 {
                log::warn!(
                    "{} {} -> {}",
                    request.method,
                    request.path,
                    response.status
                );
            }
            write_full_response(&mut stream, state, &response, cookie.as_deref())
        }
        Reply::MultipartStream(subscription) => {
            write_multipart_stream(&mut stream, state, subscription, cookie.as_deref())
        }
    }
}
