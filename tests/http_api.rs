//! End-to-end HTTP surface tests against a full server instance with the
//! placeholder camera and temp directories.

use anyhow::{anyhow, Result};
use serde_json::Value;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

use opensentry::auth::SigningKey;
use opensentry::web::{self, AppState, ServerHandle};
use opensentry::{CameraConfig, CameraStream, Overlay, SettingsStore, SnapshotWorker, StreamWorkers};

struct TestServer {
    _dir: tempfile::TempDir,
    addr: SocketAddr,
    snapshots_dir: std::path::PathBuf,
    camera: Arc<CameraStream>,
    workers: Arc<StreamWorkers>,
    handle: Option<ServerHandle>,
}

impl TestServer {
    fn new(api_token: &str, auth_section: Option<&str>) -> Result<Self> {
        let dir = tempdir()?;
        let config_path = dir.path().join("config.json");
        let snapshots_dir = dir.path().join("snapshots");
        let auth = auth_section.unwrap_or(r#"{"auth_mode": "local"}"#);
        std::fs::write(
            &config_path,
            format!(
                r#"{{
                    "video": {{"device": "stub://test", "width": 160, "height": 120, "fps": 30}},
                    "snapshots": {{"directory": {snap_dir:?}}},
                    "stream": {{"fps": 60, "max_width": 320}},
                    "auth": {auth}
                }}"#,
                snap_dir = snapshots_dir.to_string_lossy(),
            ),
        )?;

        let settings = Arc::new(SettingsStore::open(&config_path)?);
        let camera = Arc::new(CameraStream::new(CameraConfig::from_settings(
            &settings.video(),
        )));
        camera.start();
        let overlay = Arc::new(Overlay::without_font());
        let snapshots = Arc::new(SnapshotWorker::new(
            settings.clone(),
            camera.clone(),
            overlay.clone(),
        ));
        let workers = Arc::new(StreamWorkers::start(
            camera.clone(),
            settings.clone(),
            overlay,
            snapshots.clone(),
        ));

        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        let state = Arc::new(AppState {
            settings,
            camera: camera.clone(),
            workers: workers.clone(),
            snapshots,
            signing_key: SigningKey::new(b"test-secret".to_vec()),
            api_token: api_token.to_string(),
            device_name: "OpenSentry".to_string(),
            version: "0.0.0-test".to_string(),
            port,
            login_user: "admin".to_string(),
            login_pass: "admin".to_string(),
        });
        let handle = web::spawn(listener, state)?;
        std::fs::create_dir_all(&snapshots_dir)?;

        Ok(Self {
            _dir: dir,
            addr: handle.addr,
            snapshots_dir,
            camera,
            workers,
            handle: Some(handle),
        })
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop().expect("failed to stop http server");
        }
        self.workers.stop();
        self.camera.stop();
    }
}

struct HttpResponse {
    status: u16,
    headers: String,
    body: Vec<u8>,
}

impl HttpResponse {
    fn header(&self, name: &str) -> Option<String> {
        let prefix = format!("{}:", name.to_lowercase());
        self.headers
            .lines()
            .find(|line| line.to_lowercase().starts_with(&prefix))
            .and_then(|line| line.split_once(':').map(|(_, v)| v.trim().to_string()))
    }

    fn json(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

fn send_request(addr: SocketAddr, raw: &str) -> Result<HttpResponse> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(raw.as_bytes())?;
    let mut data = Vec::new();
    stream.read_to_end(&mut data)?;
    parse_response(&data)
}

fn parse_response(data: &[u8]) -> Result<HttpResponse> {
    let header_end = data
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| anyhow!("no header terminator"))?;
    let headers = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let status: u16 = headers
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| anyhow!("no status line"))?;
    Ok(HttpResponse {
        status,
        headers,
        body: data[header_end + 4..].to_vec(),
    })
}

fn get(addr: SocketAddr, path: &str, extra_headers: &str) -> Result<HttpResponse> {
    send_request(
        addr,
        &format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n{extra_headers}\r\n"),
    )
}

fn post_form(
    addr: SocketAddr,
    path: &str,
    body: &str,
    extra_headers: &str,
) -> Result<HttpResponse> {
    send_request(
        addr,
        &format!(
            "POST {path} HTTP/1.1\r\nHost: localhost\r\n\
             Content-Type: application/x-www-form-urlencoded\r\n\
             Content-Length: {}\r\n{extra_headers}\r\n{body}",
            body.len()
        ),
    )
}

fn session_cookie(response: &HttpResponse) -> Option<String> {
    let set_cookie = response.header("set-cookie")?;
    let value = set_cookie.split(';').next()?;
    Some(format!("Cookie: {value}\r\n"))
}

fn login(server: &TestServer) -> Result<String> {
    let response = post_form(
        server.addr,
        "/login",
        "username=admin&password=admin&next=%2F",
        "",
    )?;
    assert_eq!(response.status, 302);
    assert_eq!(response.header("location").as_deref(), Some("/"));
    session_cookie(&response).ok_or_else(|| anyhow!("login set no cookie"))
}

#[test]
fn health_is_open_and_carries_observability_headers() -> Result<()> {
    let server = TestServer::new("", None)?;
    let response = get(server.addr, "/health", "")?;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"ok");
    assert!(response.header("server").unwrap().starts_with("OpenSentry/"));
    assert!(response.header("x-opensentry-version").is_some());
    let device = response.header("x-opensentry-device").unwrap();
    assert_eq!(device.len(), 12);
    Ok(())
}

#[test]
fn anonymous_settings_redirects_to_login_with_next() -> Result<()> {
    let server = TestServer::new("", None)?;
    let response = get(server.addr, "/settings", "")?;
    assert_eq!(response.status, 302);
    let location = response.header("location").unwrap();
    assert!(location.starts_with("/login"));
    assert!(location.contains("next=%2Fsettings"));
    Ok(())
}

#[test]
fn local_login_grants_a_session() -> Result<()> {
    let server = TestServer::new("", None)?;
    let cookie = login(&server)?;

    let index = get(server.addr, "/", &cookie)?;
    assert_eq!(index.status, 200);
    assert!(index.header("content-type").unwrap().starts_with("text/html"));

    // Wrong credentials re-render the form with the error message.
    let rejected = post_form(server.addr, "/login", "username=admin&password=nope&next=%2F", "")?;
    assert_eq!(rejected.status, 200);
    assert!(String::from_utf8_lossy(&rejected.body).contains("Invalid credentials"));
    Ok(())
}

#[test]
fn logout_clears_the_session() -> Result<()> {
    let server = TestServer::new("", None)?;
    let cookie = login(&server)?;
    let response = get(server.addr, "/logout", &cookie)?;
    assert_eq!(response.status, 302);
    assert_eq!(response.header("location").as_deref(), Some("/login"));
    assert!(response.header("set-cookie").unwrap().contains("Max-Age=0"));

    // The old stale cookie no longer matters: a fresh client is anonymous.
    let after = get(server.addr, "/settings", "")?;
    assert_eq!(after.status, 302);
    Ok(())
}

#[test]
fn raw_stream_emits_multipart_jpeg_parts() -> Result<()> {
    let server = TestServer::new("", None)?;
    let cookie = login(&server)?;

    let mut stream = TcpStream::connect(server.addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(
        format!("GET /video_feed HTTP/1.1\r\nHost: localhost\r\n{cookie}\r\n").as_bytes(),
    )?;

    // Collect headers plus at least 1 KiB of body, then drop the connection.
    let mut data = Vec::new();
    let mut buf = [0u8; 2048];
    while data.len() < 4096 {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => data.extend_from_slice(&buf[..n]),
            Err(_) => break,
        }
    }
    drop(stream);

    let header_end = data
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("stream headers");
    let headers = String::from_utf8_lossy(&data[..header_end]).to_lowercase();
    assert!(headers.contains("200 ok"));
    assert!(headers.contains("content-type: multipart/x-mixed-replace; boundary=frame"));
    assert!(headers.contains("x-accel-buffering: no"));
    assert!(headers.contains("cache-control: no-store"));
    assert!(headers.contains("server: opensentry/"));

    let first_kib = &data[header_end + 4..(header_end + 4 + 1024).min(data.len())];
    let as_text = String::from_utf8_lossy(first_kib);
    assert!(
        as_text.contains("--frame") || as_text.contains("Content-Type: image/jpeg"),
        "first KiB must contain a multipart boundary"
    );
    Ok(())
}

#[test]
fn anonymous_stream_request_is_redirected() -> Result<()> {
    let server = TestServer::new("", None)?;
    let response = get(server.addr, "/video_feed", "")?;
    assert_eq!(response.status, 302);
    Ok(())
}

#[test]
fn status_without_configured_token_is_open() -> Result<()> {
    let server = TestServer::new("", None)?;
    let response = get(server.addr, "/status", "")?;
    assert_eq!(response.status, 200);
    let body = response.json()?;
    assert!(body["id"].is_string());
    assert!(body["name"].is_string());
    assert!(body["version"].is_string());
    assert!(body["routes"].is_object());
    assert!(body["routes"]["snapshots"].as_bool().unwrap());
    assert!(body["camera"]["running"].is_boolean());
    assert!(body["camera"]["has_frame"].is_boolean());
    assert_eq!(body["auth_mode"], "session");
    Ok(())
}

#[test]
fn status_bearer_distinguishes_missing_and_wrong_tokens() -> Result<()> {
    let server = TestServer::new("secret-token", None)?;

    let missing = get(server.addr, "/status", "")?;
    assert_eq!(missing.status, 401);

    let wrong = get(server.addr, "/status", "Authorization: Bearer wrong\r\n")?;
    assert_eq!(wrong.status, 403);

    let right = get(server.addr, "/status", "Authorization: Bearer secret-token\r\n")?;
    assert_eq!(right.status, 200);
    let body = right.json()?;
    assert_eq!(body["auth_mode"], "token");
    Ok(())
}

#[test]
fn snapshot_list_retrieve_and_delete_round_trip() -> Result<()> {
    let server = TestServer::new("", None)?;
    let cookie = login(&server)?;
    std::fs::write(
        server.snapshots_dir.join("2026-01-01_00-00-00_motion_77px.jpg"),
        [0xFF, 0xD8, 0xFF, 0xD9],
    )?;

    let list = get(server.addr, "/api/snapshots/list", &cookie)?;
    assert_eq!(list.status, 200);
    let body = list.json()?;
    assert_eq!(body["count"], 1);
    let entry = &body["snapshots"][0];
    assert_eq!(entry["filename"], "2026-01-01_00-00-00_motion_77px.jpg");
    assert_eq!(entry["motion_detected"], true);
    assert_eq!(entry["motion_area"], 77);

    let image = get(
        server.addr,
        "/api/snapshots/image/2026-01-01_00-00-00_motion_77px.jpg",
        &cookie,
    )?;
    assert_eq!(image.status, 200);
    assert_eq!(image.header("content-type").as_deref(), Some("image/jpeg"));
    assert_eq!(&image.body[..2], &[0xFF, 0xD8]);

    let deleted = post_form(
        server.addr,
        "/api/snapshots/delete/2026-01-01_00-00-00_motion_77px.jpg",
        "",
        &cookie,
    )?;
    assert_eq!(deleted.status, 200);
    assert_eq!(deleted.json()?["success"], true);

    let gone = get(
        server.addr,
        "/api/snapshots/image/2026-01-01_00-00-00_motion_77px.jpg",
        &cookie,
    )?;
    assert_eq!(gone.status, 404);
    Ok(())
}

#[test]
fn snapshot_filenames_with_traversal_are_rejected() -> Result<()> {
    let server = TestServer::new("", None)?;
    let cookie = login(&server)?;
    // The sentinel file must survive every attempt below.
    let sentinel = server.snapshots_dir.join("keep.jpg");
    std::fs::write(&sentinel, [0xFF, 0xD8, 0xFF, 0xD9])?;

    for bad in [
        "/api/snapshots/image/..%2Fconfig.json",
        "/api/snapshots/image/%2e%2e%2fconfig.json",
        "/api/snapshots/delete/..%5Ckeep.jpg",
    ] {
        let response = get(server.addr, bad, &cookie)?;
        assert_eq!(response.status, 400, "{bad} must be rejected");
        assert_eq!(response.json()?["error"], "Invalid filename");
    }
    assert!(sentinel.exists());
    Ok(())
}

#[test]
fn favicon_is_a_silent_204() -> Result<()> {
    let server = TestServer::new("", None)?;
    let response = get(server.addr, "/favicon.ico", "")?;
    assert_eq!(response.status, 204);
    assert!(response.body.is_empty());
    Ok(())
}

#[test]
fn settings_post_updates_and_clamps_values() -> Result<()> {
    let server = TestServer::new("", None)?;
    let cookie = login(&server)?;

    let response = post_form(
        server.addr,
        "/settings",
        "md_min_area=750&md_pad=20&snapshot_interval=500&snapshot_retention_count=5&snapshot_retention_days=90&snapshot_directory=snaps2&snapshot_motion_detection=on",
        &cookie,
    )?;
    assert_eq!(response.status, 302);

    let page = get(server.addr, "/settings", &cookie)?;
    assert_eq!(page.status, 200);
    let html = String::from_utf8_lossy(&page.body).into_owned();
    assert!(html.contains("value=\"750\""));
    assert!(html.contains("value=\"20\""));
    // Out-of-range submissions land on the clamp boundaries.
    assert!(html.contains("value=\"60\""));
    assert!(html.contains("value=\"10\""));
    assert!(html.contains("value=\"30\""));
    Ok(())
}

#[test]
fn logs_download_serves_recent_lines() -> Result<()> {
    let server = TestServer::new("", None)?;
    let cookie = login(&server)?;
    let response = get(server.addr, "/logs/download?n=50", &cookie)?;
    assert_eq!(response.status, 200);
    assert!(response
        .header("content-disposition")
        .unwrap()
        .contains("opensentry-logs.txt"));
    assert!(!response.body.is_empty());
    Ok(())
}

#[test]
fn unreachable_oauth2_metadata_renders_the_fallback_page() -> Result<()> {
    // Port 9 on localhost refuses connections immediately.
    let auth = r#"{
        "auth_mode": "oauth2",
        "oauth2_base_url": "http://127.0.0.1:9",
        "oauth2_client_id": "opensentry"
    }"#;
    let server = TestServer::new("", Some(auth))?;

    // Anonymous session-required routes bounce to the OAuth2 login.
    let redirect = get(server.addr, "/settings", "")?;
    assert_eq!(redirect.status, 302);
    assert_eq!(redirect.header("location").as_deref(), Some("/oauth2/login"));

    let unavailable = get(server.addr, "/oauth2/login?next=%2Fsettings", "")?;
    assert_eq!(unavailable.status, 503);
    let html = String::from_utf8_lossy(&unavailable.body).into_owned();
    assert!(html.contains("/oauth2/fallback?next="));
    assert!(html.contains("Retry OAuth2 login"));

    // The fallback route marks the session and returns to local login.
    let fallback = get(server.addr, "/oauth2/fallback?next=%2Fsettings", "")?;
    assert_eq!(fallback.status, 302);
    let location = fallback.header("location").unwrap();
    assert!(location.starts_with("/login"));
    assert!(location.contains("fallback=1"));

    let fallback_cookie = session_cookie(&fallback).expect("fallback sets session");
    let form = get(server.addr, "/login?next=%2Fsettings&fallback=1", &fallback_cookie)?;
    assert_eq!(form.status, 200, "fallback session reaches the local form");
    Ok(())
}

#[test]
fn oauth2_test_api_reports_probe_failures() -> Result<()> {
    let server = TestServer::new("", None)?;
    let cookie = login(&server)?;

    let missing = get(server.addr, "/api/oauth2/test", &cookie)?;
    assert_eq!(missing.status, 400);

    let unreachable = get(
        server.addr,
        "/api/oauth2/test?base_url=http%3A%2F%2F127.0.0.1%3A9",
        &cookie,
    )?;
    assert_eq!(unreachable.status, 502);
    assert_eq!(unreachable.json()?["ok"], false);
    Ok(())
}

#[test]
fn unknown_route_is_404_for_logged_in_sessions() -> Result<()> {
    let server = TestServer::new("", None)?;
    let cookie = login(&server)?;
    let response = get(server.addr, "/definitely-not-a-route", &cookie)?;
    assert_eq!(response.status, 404);
    Ok(())
}
