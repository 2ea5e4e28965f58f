//! opensentryd - OpenSentry surveillance daemon
//!
//! This daemon:
//! 1. Loads the persisted configuration and environment overrides
//! 2. Starts the camera capture loop and the stream/snapshot workers
//! 3. Serves the HTTP surface (streams, snapshot APIs, settings, auth)
//! 4. Advertises the device over mDNS
//! 5. Shuts everything down on Ctrl-C

use anyhow::{anyhow, Result};
use std::net::TcpListener;
use std::sync::{mpsc, Arc};

use opensentry::web::{self, AppState};
use opensentry::{CameraConfig, CameraStream, Overlay, SettingsStore, SnapshotWorker, StreamWorkers};

const PORT_SCAN_ATTEMPTS: u16 = 10;

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE"))
        .unwrap_or(false)
}

/// Bind the preferred port, walking forward a few ports when it is busy.
fn bind_with_fallback(preferred: u16, attempts: u16) -> Result<TcpListener> {
    for offset in 0..attempts.max(1) {
        let port = preferred.saturating_add(offset);
        match TcpListener::bind(("0.0.0.0", port)) {
            Ok(listener) => return Ok(listener),
            Err(err) => log::debug!("port {port} unavailable: {err}"),
        }
    }
    Err(anyhow!(
        "no free port in {preferred}..{}",
        preferred.saturating_add(attempts)
    ))
}

fn main() -> Result<()> {
    opensentry::logbuf::init_logging();
    opensentry::encode::init_jpeg_encoder();

    let version = env_or("OPENSENTRY_VERSION", env!("CARGO_PKG_VERSION"));
    let device_name = env_or("OPENSENTRY_DEVICE_NAME", "OpenSentry");
    let api_token = std::env::var("OPENSENTRY_API_TOKEN")
        .unwrap_or_default()
        .trim()
        .to_string();
    let mdns_disable = env_flag("OPENSENTRY_MDNS_DISABLE");
    let login_user = env_or("OPENSENTRY_USER", "admin");
    let login_pass = env_or("OPENSENTRY_PASS", "admin");
    let config_path = env_or("OPENSENTRY_CONFIG", "config.json");

    log::info!("Starting OpenSentry...");
    let settings = Arc::new(SettingsStore::open(&config_path)?);
    let device_id = settings.device_id();

    log::info!("Starting camera stream...");
    let camera = Arc::new(CameraStream::new(CameraConfig::from_settings(
        &settings.video(),
    )));
    camera.start();

    let overlay = Arc::new(Overlay::from_env());
    let snapshots = Arc::new(SnapshotWorker::new(
        settings.clone(),
        camera.clone(),
        overlay.clone(),
    ));
    snapshots.start();
    let workers = Arc::new(StreamWorkers::start(
        camera.clone(),
        settings.clone(),
        overlay,
        snapshots.clone(),
    ));

    let preferred: u16 = env_or("OPENSENTRY_PORT", "5000")
        .parse()
        .map_err(|_| anyhow!("OPENSENTRY_PORT must be an integer"))?;
    let listener = bind_with_fallback(preferred, PORT_SCAN_ATTEMPTS)?;
    let port = listener.local_addr()?.port();
    log::info!("Binding HTTP server on port {port} (preferred {preferred})");

    let state = Arc::new(AppState {
        settings: settings.clone(),
        camera: camera.clone(),
        workers: workers.clone(),
        snapshots: snapshots.clone(),
        signing_key: opensentry::auth::SigningKey::from_env(),
        api_token: api_token.clone(),
        device_name: device_name.clone(),
        version: version.clone(),
        port,
        login_user,
        login_pass,
    });
    let server = web::spawn(listener, state)?;

    log::info!(
        "Device ID: {device_id}, Version: {version}, mDNS: {}",
        if mdns_disable { "DISABLED" } else { "ENABLED" }
    );
    log::info!("Access the snapshot gallery at http://0.0.0.0:{port}/");

    let mut mdns = if mdns_disable {
        None
    } else {
        let txt: Vec<(String, String)> = vec![
            ("id".into(), device_id.clone()),
            ("name".into(), device_name.clone()),
            ("ver".into(), version.clone()),
            ("caps".into(), "raw,motion".into()),
            (
                "auth".into(),
                if api_token.is_empty() { "session" } else { "token" }.into(),
            ),
            ("api".into(), "/status,/health".into()),
            ("path".into(), "/".into()),
            ("proto".into(), "1".into()),
        ];
        Some(opensentry::mdns::MdnsAdvertiser::start(
            &device_name,
            port,
            &txt,
        ))
    };

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("opensentryd running; waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");

    if let Some(mdns) = mdns.as_mut() {
        mdns.stop();
    }
    server.stop()?;
    workers.stop();
    snapshots.stop();
    camera.stop();
    Ok(())
}
