//! Route handlers.
//!
//! Semantics mirror the settings/auth/snapshot surface described in the
//! route table: every handler receives the parsed request, the decoded
//! session (mutations propagate back as a Set-Cookie), and the shared app
//! state. Client-visible errors stay short; full context goes to the log.

use chrono::Local;
use serde_json::json;

use super::pages;
use super::{AppState, HttpRequest, Reply, Response};
use crate::auth::{
    check_bearer, exchange_code, gen_pkce, make_state, probe_oauth2, verify_state, BearerCheck,
    Session,
};
use crate::config::SnapshotSettings;
use crate::logbuf::dump_logs;
use crate::snapshot::list_snapshots;

/// Endpoint name for a path; the names feed the auth gate.
pub fn route_endpoint(path: &str) -> &'static str {
    match path {
        "/" => "index",
        "/health" => "health",
        "/favicon.ico" => "favicon",
        "/status" => "status",
        "/login" => "login",
        "/logout" => "logout",
        "/oauth2/login" => "oauth2_login",
        "/oauth2/callback" => "oauth2_callback",
        "/oauth2/fallback" => "oauth2_fallback",
        "/api/oauth2/test" => "oauth2_test_api",
        "/video_feed" => "video_feed",
        "/video_feed_motion" => "video_feed_motion",
        "/api/snapshot" => "api_snapshot",
        "/api/snapshots/latest" => "snapshots_latest",
        "/api/snapshots/list" => "snapshots_list",
        "/settings" => "settings",
        "/logs/download" => "logs_download",
        _ if path.starts_with("/api/snapshots/image/") => "snapshot_image",
        _ if path.starts_with("/api/snapshots/delete/") => "snapshot_delete",
        _ => "",
    }
}

pub fn dispatch(
    endpoint: &str,
    request: &HttpRequest,
    session: &mut Session,
    state: &AppState,
) -> Reply {
    match (endpoint, request.method.as_str()) {
        ("health", "GET") => Reply::Full(Response::text(200, "ok")),
        ("favicon", "GET") => Reply::Full(Response::empty(204)),
        ("status", "GET") => Reply::Full(status(request, state)),
        ("index", "GET") => Reply::Full(index(state)),
        ("login", "GET" | "POST") => Reply::Full(login(request, session, state)),
        ("logout", "GET") => Reply::Full(logout(session)),
        ("oauth2_login", "GET") => Reply::Full(oauth2_login(request, session, state)),
        ("oauth2_callback", "GET") => Reply::Full(oauth2_callback(request, session, state)),
        ("oauth2_fallback", "GET") => Reply::Full(oauth2_fallback(request, session)),
        ("oauth2_test_api", "GET") => Reply::Full(oauth2_test(request)),
        ("video_feed", "GET") => Reply::MultipartStream(state.workers.raw.subscribe()),
        ("video_feed_motion", "GET") => Reply::MultipartStream(state.workers.motion.subscribe()),
        ("api_snapshot", "GET") => Reply::Full(api_snapshot(state)),
        ("snapshots_latest", "GET") => Reply::Full(snapshots_latest(state)),
        ("snapshots_list", "GET") => Reply::Full(snapshots_list(state)),
        ("snapshot_image", "GET") => Reply::Full(snapshot_image(request, state)),
        ("snapshot_delete", "POST" | "DELETE") => Reply::Full(snapshot_delete(request, state)),
        ("settings", "GET" | "POST") => Reply::Full(settings(request, state)),
        ("logs_download", "GET") => Reply::Full(logs_download(request)),
        ("", _) => Reply::Full(Response::json(404, &json!({"error": "not_found"}))),
        _ => Reply::Full(Response::json(405, &json!({"error": "method_not_allowed"}))),
    }
}

// ----------------------------------------------------------------------------
// Status and index
// ----------------------------------------------------------------------------

fn status(request: &HttpRequest, state: &AppState) -> Response {
    if !state.api_token.is_empty() {
        match check_bearer(request.header("authorization"), &state.api_token) {
            BearerCheck::Missing => {
                return Response::json(401, &json!({"error": "unauthorized"}))
            }
            BearerCheck::Mismatch => {
                return Response::json(403, &json!({"error": "forbidden"}))
            }
            BearerCheck::Ok => {}
        }
    }

    let has_frame = state.camera.has_frame();
    let stream_ok = state.camera.is_running() && has_frame;
    let body = json!({
        "id": state.device_id(),
        "name": state.device_name,
        "version": state.version,
        "port": state.port,
        "caps": ["raw", "motion"],
        "routes": {
            "raw": stream_ok,
            "motion": stream_ok,
            "snapshots": true,
        },
        "camera": {
            "running": state.camera.is_running(),
            "has_frame": has_frame,
        },
        "auth_mode": if state.api_token.is_empty() { "session" } else { "token" },
    });
    Response::json(200, &body)
}

fn index(state: &AppState) -> Response {
    Response::html(200, pages::index_page(&state.device_name))
}

// ----------------------------------------------------------------------------
// Local login
// ----------------------------------------------------------------------------

fn login(request: &HttpRequest, session: &mut Session, state: &AppState) -> Response {
    if request.method == "GET" && request.query_param("fallback").is_some() {
        session.oauth2_fallback = true;
    }
    let allow_fallback =
        request.query_param("fallback").is_some() || session.oauth2_fallback;

    let next = request
        .form_or_query("next")
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "/".to_string());

    let mut error = "";
    if request.method == "POST" {
        let form = request.form();
        let username = form.get("username").map(|u| u.trim()).unwrap_or("");
        let password = form.get("password").map(String::as_str).unwrap_or("");
        if username == state.login_user && password == state.login_pass {
            session.logged_in = true;
            session.user = Some(username.to_string());
            return Response::redirect(&next);
        }
        error = "Invalid credentials";
    }

    if !session.logged_in && state.settings.auth().oauth2_effective() && !allow_fallback {
        return Response::redirect("/oauth2/login");
    }
    Response::html(200, pages::login_page(&next, error))
}

fn logout(session: &mut Session) -> Response {
    *session = Session::default();
    Response::redirect("/login")
}

// ----------------------------------------------------------------------------
// OAuth2 flow
// ----------------------------------------------------------------------------

fn request_base_url(request: &HttpRequest) -> String {
    let host = request.header("host").unwrap_or("localhost");
    format!("http://{host}")
}

fn oauth2_login(request: &HttpRequest, session: &mut Session, state: &AppState) -> Response {
    let auth = state.settings.auth();
    if !auth.oauth2_effective() {
        return Response::redirect("/login");
    }

    let next = session
        .next
        .clone()
        .or_else(|| request.query_param("next"))
        .unwrap_or_else(|| "/".to_string());

    let metadata = match probe_oauth2(&auth.oauth2_base_url) {
        Ok(metadata) => metadata,
        Err(err) => {
            log::error!("oauth2 metadata probe failed: {err}");
            return Response::html(
                503,
                pages::oauth2_unavailable_page(&auth.oauth2_base_url, &err.to_string(), &next),
            );
        }
    };

    let client_id = auth.oauth2_client_id.trim();
    if client_id.is_empty() {
        return Response::text(400, "Missing oauth2_client_id in settings");
    }
    let scope = {
        let s = auth.oauth2_scope.trim();
        if s.is_empty() { "openid" } else { s }.to_string()
    };

    // The session must survive the authorization round-trip.
    session.permanent = true;
    let (code_verifier, code_challenge) = gen_pkce();
    // The verifier rides inside the signed state so the callback can recover
    // it even when the session cookie is lost at the redirect boundary.
    let oauth2_state = make_state(&state.signing_key, Some(&code_verifier));
    session.oauth2_state = Some(oauth2_state.clone());
    session.code_verifier = Some(code_verifier);
    session.next = Some(next);

    let redirect_uri = format!("{}/oauth2/callback", request_base_url(request));
    let mut auth_url = match url::Url::parse(&metadata.authorization_endpoint) {
        Ok(url) => url,
        Err(err) => {
            log::error!("invalid authorization_endpoint: {err}");
            return Response::text(502, "Invalid authorization endpoint");
        }
    };
    auth_url
        .query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", client_id)
        .append_pair("redirect_uri", &redirect_uri)
        .append_pair("scope", &scope)
        .append_pair("state", &oauth2_state)
        .append_pair("code_challenge_method", "S256")
        .append_pair("code_challenge", &code_challenge);

    log::info!(
        "OAuth2 login: state={}..., redirect_uri={redirect_uri}",
        &oauth2_state[..16.min(oauth2_state.len())]
    );
    Response::redirect(auth_url.as_str())
}

fn oauth2_callback(request: &HttpRequest, session: &mut Session, state: &AppState) -> Response {
    let auth = state.settings.auth();
    if auth.auth_mode != "oauth2" {
        return Response::redirect("/login");
    }

    let code = request.query_param("code");
    let callback_state = request.query_param("state");
    let (Some(code), Some(callback_state)) = (code, callback_state) else {
        log::error!("OAuth2 callback missing code or state");
        return Response::text(400, "Invalid OAuth2 callback");
    };

    // Accept the state if it matches the session, or if it independently
    // verifies against the signing key within the freshness window.
    let verified = verify_state(&state.signing_key, &callback_state);
    let session_match = session.oauth2_state.as_deref() == Some(callback_state.as_str());
    if !session_match && verified.is_none() {
        log::error!("OAuth2 callback state validation failed");
        return Response::text(400, "Invalid OAuth2 callback");
    }

    let metadata = match probe_oauth2(&auth.oauth2_base_url) {
        Ok(metadata) => metadata,
        Err(err) => {
            log::error!("oauth2 metadata probe failed at callback: {err}");
            let next = session.next.clone().unwrap_or_else(|| "/".to_string());
            return Response::html(
                503,
                pages::oauth2_callback_unavailable_page(&err.to_string(), &next),
            );
        }
    };

    // PKCE verifier: session first, signed-state recovery second.
    let code_verifier = match session.code_verifier.clone() {
        Some(verifier) => verifier,
        None => match verified.and_then(|payload| payload.v) {
            Some(verifier) => {
                log::info!("OAuth2 callback: recovered code_verifier from state");
                verifier
            }
            None => {
                return Response::text(
                    400,
                    "Missing PKCE verifier in session. Please try logging in again.",
                )
            }
        },
    };

    let redirect_uri = format!("{}/oauth2/callback", request_base_url(request));
    let secret = auth.oauth2_client_secret.trim();
    let tokens = match exchange_code(
        &metadata.token_endpoint,
        &code,
        &redirect_uri,
        auth.oauth2_client_id.trim(),
        &code_verifier,
        (!secret.is_empty()).then_some(secret),
    ) {
        Ok(tokens) => tokens,
        Err(err) => {
            log::error!("{err}");
            return Response::text(502, &err.to_string());
        }
    };

    session.oauth2_state = None;
    session.code_verifier = None;
    session.logged_in = true;
    session.user = Some("oauth2".to_string());
    session.tokens = Some(tokens);
    let dest = session.next.take().unwrap_or_else(|| "/".to_string());
    Response::redirect(&dest)
}

fn oauth2_fallback(request: &HttpRequest, session: &mut Session) -> Response {
    session.oauth2_fallback = true;
    let dest = request
        .query_param("next")
        .or_else(|| session.next.clone())
        .unwrap_or_else(|| "/".to_string());
    Response::redirect(&format!(
        "/login?next={}&fallback=1",
        urlencoding::encode(&dest)
    ))
}

fn oauth2_test(request: &HttpRequest) -> Response {
    let Some(base_url) = request.query_param("base_url").filter(|b| !b.trim().is_empty())
    else {
        return Response::json(400, &json!({"ok": false, "error": "base_url required"}));
    };
    match probe_oauth2(base_url.trim()) {
        Ok(metadata) => Response::json(
            200,
            &json!({
                "ok": true,
                "issuer": metadata.issuer,
                "authorization_endpoint": metadata.authorization_endpoint,
                "token_endpoint": metadata.token_endpoint,
            }),
        ),
        Err(err) => Response::json(502, &json!({"ok": false, "error": err.to_string()})),
    }
}

// ----------------------------------------------------------------------------
// Snapshot APIs
// ----------------------------------------------------------------------------

fn api_snapshot(state: &AppState) -> Response {
    let latest = state
        .workers
        .motion_latest()
        .or_else(|| state.snapshots.get_latest());
    let Some(jpeg) = latest else {
        return Response::json(503, &json!({"error": "No frame available"}));
    };
    let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
    Response::new(200, "image/jpeg", jpeg.to_vec())
        .with_header(
            "Content-Disposition",
            &format!("attachment; filename=\"opensentry-snapshot-{stamp}.jpg\""),
        )
        .with_header(
            "Cache-Control",
            "no-store, no-cache, must-revalidate, max-age=0",
        )
}

fn snapshots_latest(state: &AppState) -> Response {
    let Some(jpeg) = state.snapshots.get_latest() else {
        return Response::json(503, &json!({"error": "No snapshot available"}));
    };
    Response::new(200, "image/jpeg", jpeg.to_vec())
        .with_header("Cache-Control", "no-cache, must-revalidate")
        .with_header("Pragma", "no-cache")
}

fn snapshots_list(state: &AppState) -> Response {
    let dir = match state.snapshots.snapshots_dir() {
        Ok(dir) => dir,
        Err(err) => {
            log::error!("failed to list snapshots: {err}");
            return Response::json(500, &json!({"error": "snapshot directory unavailable"}));
        }
    };
    match list_snapshots(&dir) {
        Ok(entries) => Response::json(
            200,
            &json!({
                "count": entries.len(),
                "snapshots": entries,
            }),
        ),
        Err(err) => {
            log::error!("failed to list snapshots: {err}");
            Response::json(500, &json!({"error": "failed to list snapshots"}))
        }
    }
}

/// Filename from the trailing path segment; traversal characters are
/// rejected before the filesystem is touched.
fn snapshot_name(path: &str, prefix: &str) -> Result<String, Response> {
    let raw = path.strip_prefix(prefix).unwrap_or_default();
    let name = urlencoding::decode(raw)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| raw.to_string());
    if name.is_empty() || name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(Response::json(400, &json!({"error": "Invalid filename"})));
    }
    Ok(name)
}

fn snapshot_image(request: &HttpRequest, state: &AppState) -> Response {
    let name = match snapshot_name(&request.path, "/api/snapshots/image/") {
        Ok(name) => name,
        Err(response) => return response,
    };
    let dir = match state.snapshots.snapshots_dir() {
        Ok(dir) => dir,
        Err(err) => {
            log::error!("failed to retrieve snapshot {name}: {err}");
            return Response::json(500, &json!({"error": "snapshot directory unavailable"}));
        }
    };
    let path = dir.join(&name);
    if !path.exists() {
        return Response::json(404, &json!({"error": "Snapshot not found"}));
    }
    match std::fs::read(&path) {
        Ok(bytes) => Response::new(200, "image/jpeg", bytes),
        Err(err) => {
            log::error!("failed to retrieve snapshot {name}: {err}");
            Response::json(500, &json!({"error": "failed to read snapshot"}))
        }
    }
}

fn snapshot_delete(request: &HttpRequest, state: &AppState) -> Response {
    let name = match snapshot_name(&request.path, "/api/snapshots/delete/") {
        Ok(name) => name,
        Err(response) => return response,
    };
    let dir = match state.snapshots.snapshots_dir() {
        Ok(dir) => dir,
        Err(err) => {
            log::error!("failed to delete snapshot {name}: {err}");
            return Response::json(500, &json!({"error": "snapshot directory unavailable"}));
        }
    };
    let path = dir.join(&name);
    if !path.exists() {
        return Response::json(404, &json!({"error": "Snapshot not found"}));
    }
    match std::fs::remove_file(&path) {
        Ok(()) => {
            log::info!("deleted snapshot: {name}");
            Response::json(
                200,
                &json!({"success": true, "message": format!("Deleted {name}")}),
            )
        }
        Err(err) => {
            log::error!("failed to delete snapshot {name}: {err}");
            Response::json(500, &json!({"error": "failed to delete snapshot"}))
        }
    }
}

// ----------------------------------------------------------------------------
// Settings
// ----------------------------------------------------------------------------

fn settings(request: &HttpRequest, state: &AppState) -> Response {
    if request.method == "POST" {
        return settings_post(request, state);
    }

    let config = state.settings.snapshot();
    let camera_ok = state.camera.is_running() && state.camera.has_frame();
    Response::html(
        200,
        pages::settings_page(&config, camera_ok, &state.device_name, state.port, &state.version),
    )
}

fn parse_u64(value: Option<&String>, default: u64) -> u64 {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn settings_post(request: &HttpRequest, state: &AppState) -> Response {
    let form = request.form();
    match form.get("action").map(String::as_str) {
        Some("reset_motion") => {
            if let Err(err) = state.settings.reset_motion() {
                log::error!("failed to reset motion settings: {err}");
            }
            Response::redirect("/settings")
        }
        Some("update_auth") => {
            let mode = form
                .get("auth_mode")
                .map(|m| m.trim().to_lowercase())
                .unwrap_or_default();
            if mode != "local" && mode != "oauth2" {
                log::warn!("invalid auth_mode submitted: {mode}");
                return Response::redirect("/settings");
            }
            let base_url = form
                .get("oauth2_base_url")
                .map(|v| v.trim().to_string())
                .unwrap_or_default();
            let client_id = form
                .get("oauth2_client_id")
                .map(|v| v.trim().to_string())
                .unwrap_or_default();
            let client_secret = form
                .get("oauth2_client_secret")
                .map(|v| v.trim().to_string())
                .unwrap_or_default();
            let scope = form
                .get("oauth2_scope")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "openid profile email offline_access".to_string());

            if mode == "oauth2" {
                // The base URL must answer the discovery probe before the
                // mode switch is accepted.
                if let Err(err) = probe_oauth2(&base_url) {
                    log::error!("OAuth2 validation failed: {err}");
                    return Response::redirect("/settings");
                }
                if client_id.is_empty() {
                    log::error!("OAuth2 client_id required but not provided");
                    return Response::redirect("/settings");
                }
            }

            let result = state.settings.update(|cfg| {
                cfg.auth.auth_mode = mode.clone();
                if mode == "oauth2" {
                    cfg.auth.oauth2_base_url = base_url.clone();
                    cfg.auth.oauth2_client_id = client_id.clone();
                    cfg.auth.oauth2_client_secret = client_secret.clone();
                    cfg.auth.oauth2_scope = scope.clone();
                } else {
                    cfg.auth.clear_oauth2();
                }
            });
            if let Err(err) = result {
                log::error!("failed to save auth config: {err}");
            }
            Response::redirect("/settings")
        }
        _ => {
            let current = state.settings.snapshot();
            let min_area =
                parse_u64(form.get("md_min_area"), current.motion_detection.min_area as u64);
            let pad = parse_u64(form.get("md_pad"), current.motion_detection.pad as u64);
            let interval = parse_u64(form.get("snapshot_interval"), current.snapshots.interval);
            let motion_enabled = form.contains_key("snapshot_motion_detection");
            let retention_count = parse_u64(
                form.get("snapshot_retention_count"),
                current.snapshots.retention_count as u64,
            );
            let retention_days = parse_u64(
                form.get("snapshot_retention_days"),
                current.snapshots.retention_days,
            );
            let directory = form
                .get("snapshot_directory")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "snapshots".to_string());

            let result = state.settings.update(|cfg| {
                cfg.motion_detection.min_area = min_area.min(u32::MAX as u64) as u32;
                cfg.motion_detection.pad = pad.min(u32::MAX as u64) as u32;
                cfg.snapshots.interval = SnapshotSettings::clamp_interval(interval);
                cfg.snapshots.motion_detection = motion_enabled;
                cfg.snapshots.retention_count =
                    SnapshotSettings::clamp_retention_count(retention_count as usize);
                cfg.snapshots.retention_days =
                    SnapshotSettings::clamp_retention_days(retention_days);
                cfg.snapshots.directory = directory.clone();
            });
            if let Err(err) = result {
                log::error!("failed to save settings: {err}");
            }
            Response::redirect("/settings")
        }
    }
}

// ----------------------------------------------------------------------------
// Logs
// ----------------------------------------------------------------------------

fn logs_download(request: &HttpRequest) -> Response {
    let n = request
        .query_param("n")
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|&n| n > 0);
    let mut payload = dump_logs(n);
    if payload.is_empty() {
        payload = b"No logs captured yet.\n".to_vec();
    }
    Response::new(200, "text/plain; charset=utf-8", payload)
        .with_header(
            "Content-Disposition",
            "attachment; filename=\"opensentry-logs.txt\"",
        )
        .with_header(
            "Cache-Control",
            "no-store, no-cache, must-revalidate, max-age=0, no-transform",
        )
        .with_header("Pragma", "no-cache")
        .with_header("Expires", "0")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_table_covers_the_surface() {
        assert_eq!(route_endpoint("/"), "index");
        assert_eq!(route_endpoint("/health"), "health");
        assert_eq!(route_endpoint("/video_feed"), "video_feed");
        assert_eq!(route_endpoint("/api/snapshots/image/a.jpg"), "snapshot_image");
        assert_eq!(route_endpoint("/api/snapshots/delete/a.jpg"), "snapshot_delete");
        assert_eq!(route_endpoint("/nope"), "");
    }

    #[test]
    fn snapshot_names_reject_traversal() {
        for bad in ["../etc/passwd", "a/b.jpg", "a\\b.jpg", ""] {
            let path = format!("/api/snapshots/image/{bad}");
            assert!(
                snapshot_name(&path, "/api/snapshots/image/").is_err(),
                "{bad} must be rejected"
            );
        }
        let ok = snapshot_name(
            "/api/snapshots/image/2026-01-01_00-00-00_snapshot.jpg",
            "/api/snapshots/image/",
        )
        .expect("valid name");
        assert_eq!(ok, "2026-01-01_00-00-00_snapshot.jpg");
    }

    #[test]
    fn encoded_traversal_is_rejected_after_decoding() {
        let path = "/api/snapshots/image/%2e%2e%2fsecret.jpg";
        assert!(snapshot_name(path, "/api/snapshots/image/").is_err());
    }
}
