//! Minimal HTML shells for the browser-facing routes.
//!
//! The styled settings and gallery pages live outside this service; these
//! shells carry the forms and links the flows need and nothing else.

use crate::config::Config;

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
         <title>{title}</title>\n</head>\n<body>\n{body}\n</body>\n</html>\n"
    )
}

pub fn login_page(next: &str, error: &str) -> String {
    let body = format!(
        "<h1>OpenSentry Login</h1>\n\
         <form method=\"post\" action=\"/login\">\n\
         <input type=\"hidden\" name=\"next\" value=\"{next}\">\n\
         <label>Username <input name=\"username\" type=\"text\" autocomplete=\"username\" required></label>\n\
         <label>Password <input name=\"password\" type=\"password\" autocomplete=\"current-password\" required></label>\n\
         <p class=\"err\">{error}</p>\n\
         <button type=\"submit\">Sign in</button>\n\
         <p class=\"hint\">Default creds admin/admin. Set OPENSENTRY_USER, OPENSENTRY_PASS, OPENSENTRY_SECRET for production.</p>\n\
         </form>",
        next = escape(next),
        error = escape(error),
    );
    page("OpenSentry Login", &body)
}

pub fn index_page(device_name: &str) -> String {
    let body = format!(
        "<h1>{name}</h1>\n\
         <p><img id=\"latest\" src=\"/api/snapshots/latest\" alt=\"latest snapshot\"></p>\n\
         <p>\n\
         <a href=\"/video_feed\">Live stream</a> |\n\
         <a href=\"/video_feed_motion\">Motion stream</a> |\n\
         <a href=\"/api/snapshots/list\">Snapshot list</a> |\n\
         <a href=\"/settings\">Settings</a> |\n\
         <a href=\"/logout\">Logout</a>\n\
         </p>",
        name = escape(device_name),
    );
    page("OpenSentry", &body)
}

pub fn oauth2_unavailable_page(base_url: &str, detail: &str, next: &str) -> String {
    let next_q = urlencoding::encode(next).into_owned();
    let body = format!(
        "<h1>OAuth2 Unavailable</h1>\n\
         <p>The configured OAuth2 server appears to be unavailable.</p>\n\
         <p>Base URL: <code>{base}</code></p>\n\
         <p>Detail: {detail}</p>\n\
         <p>\n\
         <a href=\"/oauth2/login?next={next_q}\">Retry OAuth2 login</a> |\n\
         <a href=\"/oauth2/fallback?next={next_q}\">Use local login for now</a> |\n\
         <a href=\"/settings\">Settings</a>\n\
         </p>",
        base = escape(if base_url.is_empty() { "Not configured" } else { base_url }),
        detail = escape(detail),
    );
    page("OAuth2 Unavailable - OpenSentry", &body)
}

pub fn oauth2_callback_unavailable_page(detail: &str, next: &str) -> String {
    let next_q = urlencoding::encode(next).into_owned();
    let body = format!(
        "<h1>OAuth2 Server Unavailable</h1>\n\
         <p>Error: <code>{detail}</code></p>\n\
         <p><a href=\"/oauth2/fallback?next={next_q}\">Use Local Login</a></p>",
        detail = escape(detail),
    );
    page("OAuth2 Server Unavailable", &body)
}

pub fn settings_page(
    config: &Config,
    camera_ok: bool,
    device_name: &str,
    port: u16,
    version: &str,
) -> String {
    let motion = &config.motion_detection;
    let snaps = &config.snapshots;
    let auth = &config.auth;
    let motion_checked = if snaps.motion_detection { " checked" } else { "" };
    let camera_status = if camera_ok { "OK" } else { "NO SIGNAL" };
    let body = format!(
        "<h1>Settings - {name}</h1>\n\
         <p>Device {device} · version {version} · port {port} · camera {camera_status}</p>\n\
         <h2>Motion detection</h2>\n\
         <form method=\"post\" action=\"/settings\">\n\
         <label>Min area (px) <input name=\"md_min_area\" type=\"number\" min=\"0\" value=\"{min_area}\"></label>\n\
         <label>Box padding (px) <input name=\"md_pad\" type=\"number\" min=\"0\" value=\"{pad}\"></label>\n\
         <h2>Snapshots</h2>\n\
         <label>Interval (s) <input name=\"snapshot_interval\" type=\"number\" min=\"5\" max=\"60\" value=\"{interval}\"></label>\n\
         <label>Motion detection <input name=\"snapshot_motion_detection\" type=\"checkbox\"{motion_checked}></label>\n\
         <label>Retention count <input name=\"snapshot_retention_count\" type=\"number\" min=\"10\" max=\"1000\" value=\"{retention_count}\"></label>\n\
         <label>Retention days <input name=\"snapshot_retention_days\" type=\"number\" min=\"1\" max=\"30\" value=\"{retention_days}\"></label>\n\
         <label>Directory <input name=\"snapshot_directory\" type=\"text\" value=\"{directory}\"></label>\n\
         <button type=\"submit\">Save</button>\n\
         </form>\n\
         <form method=\"post\" action=\"/settings\">\n\
         <input type=\"hidden\" name=\"action\" value=\"reset_motion\">\n\
         <button type=\"submit\">Reset motion defaults</button>\n\
         </form>\n\
         <h2>Authentication</h2>\n\
         <form method=\"post\" action=\"/settings\">\n\
         <input type=\"hidden\" name=\"action\" value=\"update_auth\">\n\
         <label>Mode\n\
         <select name=\"auth_mode\">\n\
         <option value=\"local\"{local_sel}>local</option>\n\
         <option value=\"oauth2\"{oauth2_sel}>oauth2</option>\n\
         </select></label>\n\
         <label>Base URL <input name=\"oauth2_base_url\" type=\"text\" value=\"{base_url}\"></label>\n\
         <label>Client ID <input name=\"oauth2_client_id\" type=\"text\" value=\"{client_id}\"></label>\n\
         <label>Client secret <input name=\"oauth2_client_secret\" type=\"password\" value=\"{client_secret}\"></label>\n\
         <label>Scope <input name=\"oauth2_scope\" type=\"text\" value=\"{scope}\"></label>\n\
         <button type=\"submit\">Save authentication</button>\n\
         </form>\n\
         <p><a href=\"/\">Back</a> | <a href=\"/logs/download?n=500\">Download logs</a></p>",
        name = escape(device_name),
        device = escape(&config.device_id),
        version = escape(version),
        min_area = motion.min_area,
        pad = motion.pad,
        interval = snaps.interval,
        retention_count = snaps.retention_count,
        retention_days = snaps.retention_days,
        directory = escape(&snaps.directory),
        local_sel = if auth.auth_mode == "local" { " selected" } else { "" },
        oauth2_sel = if auth.auth_mode == "oauth2" { " selected" } else { "" },
        base_url = escape(&auth.oauth2_base_url),
        client_id = escape(&auth.oauth2_client_id),
        client_secret = escape(&auth.oauth2_client_secret),
        scope = escape(&auth.oauth2_scope),
    );
    page("OpenSentry Settings", &body)
}
