//! Authentication: signed-cookie sessions, PKCE, signed state, OAuth2
//! metadata probe and token exchange, and the per-request gate.
//!
//! The session lives entirely in a signed cookie; there is no server-side
//! session map. The OAuth2 state token is HMAC-signed and carries the PKCE
//! verifier, so the callback can finish the exchange even when the session
//! cookie was lost across the authorization redirect. The verifier is only
//! recoverable to a holder of the signing key.

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;

use crate::config::AuthSettings;

type HmacSha256 = Hmac<Sha256>;

/// Signed state (and session cookie) freshness window.
pub const STATE_MAX_AGE_SECS: u64 = 600;

const METADATA_TIMEOUT: Duration = Duration::from_secs(3);
const TOKEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Token subset retained from a successful exchange.
const TOKEN_KEYS: [&str; 5] = [
    "access_token",
    "refresh_token",
    "id_token",
    "expires_in",
    "token_type",
];

// ----------------------------------------------------------------------------
// Sessions
// ----------------------------------------------------------------------------

/// Per-client session, round-tripped through a signed cookie.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Session {
    #[serde(default)]
    pub logged_in: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default)]
    pub oauth2_fallback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth2_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_verifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<Map<String, Value>>,
    /// Survives the OAuth2 redirect round-trip (long Max-Age).
    #[serde(default)]
    pub permanent: bool,
}

impl Session {
    pub fn is_empty(&self) -> bool {
        *self == Session::default()
    }
}

/// HMAC signing key for sessions and state tokens.
#[derive(Clone)]
pub struct SigningKey {
    secret: Vec<u8>,
}

impl SigningKey {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// `OPENSENTRY_SECRET`, with the development default the login page
    /// warns about.
    pub fn from_env() -> Self {
        let secret =
            std::env::var("OPENSENTRY_SECRET").unwrap_or_else(|_| "change-this-in-prod".into());
        if secret == "change-this-in-prod" {
            log::warn!("OPENSENTRY_SECRET not set; using the default development secret");
        }
        Self::new(secret.into_bytes())
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }

    fn verify(&self, payload: &[u8], tag: &[u8]) -> bool {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(payload);
        mac.verify_slice(tag).is_ok()
    }

    /// `b64url(payload) + "." + b64url(HMAC-SHA256(key, payload))`.
    fn encode_signed(&self, payload: &[u8]) -> String {
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(payload),
            URL_SAFE_NO_PAD.encode(self.sign(payload))
        )
    }

    fn decode_signed(&self, token: &str) -> Option<Vec<u8>> {
        let (payload_b64, tag_b64) = token.split_once('.')?;
        let payload = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
        let tag = URL_SAFE_NO_PAD.decode(tag_b64).ok()?;
        self.verify(&payload, &tag).then_some(payload)
    }

    pub fn encode_session(&self, session: &Session) -> String {
        let payload = serde_json::to_vec(session).unwrap_or_default();
        self.encode_signed(&payload)
    }

    /// Invalid or tampered cookies yield a fresh anonymous session.
    pub fn decode_session(&self, cookie: &str) -> Session {
        self.decode_signed(cookie)
            .and_then(|payload| serde_json::from_slice(&payload).ok())
            .unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// PKCE and signed state
// ----------------------------------------------------------------------------

/// PKCE verifier (base64url of 40 random bytes, 43+ chars) and its S256
/// challenge.
pub fn gen_pkce() -> (String, String) {
    let mut bytes = [0u8; 40];
    rand::thread_rng().fill_bytes(&mut bytes);
    let verifier = URL_SAFE_NO_PAD.encode(bytes);
    let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
    (verifier, challenge)
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct StatePayload {
    /// Issue time, unix seconds.
    pub t: u64,
    /// Random nonce.
    pub n: String,
    /// PKCE verifier, embedded so the callback survives a lost session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn make_state(key: &SigningKey, verifier: Option<&str>) -> String {
    make_state_at(key, unix_now(), verifier)
}

fn make_state_at(key: &SigningKey, issued_at: u64, verifier: Option<&str>) -> String {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    let payload = StatePayload {
        t: issued_at,
        n: URL_SAFE_NO_PAD.encode(nonce),
        v: verifier.map(str::to_string),
    };
    key.encode_signed(&serde_json::to_vec(&payload).unwrap_or_default())
}

/// Verify signature and freshness; constant-time tag comparison happens
/// inside the HMAC verify.
pub fn verify_state(key: &SigningKey, state: &str) -> Option<StatePayload> {
    verify_state_with_age(key, state, STATE_MAX_AGE_SECS)
}

fn verify_state_with_age(key: &SigningKey, state: &str, max_age: u64) -> Option<StatePayload> {
    let payload = key.decode_signed(state)?;
    let parsed: StatePayload = serde_json::from_slice(&payload).ok()?;
    if parsed.t == 0 || unix_now().saturating_sub(parsed.t) > max_age {
        return None;
    }
    Some(parsed)
}

// ----------------------------------------------------------------------------
// OAuth2 metadata probe and token exchange
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
pub struct OidcMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
}

fn fetch_metadata(agent: &ureq::Agent, url: &str) -> Result<OidcMetadata> {
    let response = agent.get(url).call().map_err(|err| match err {
        ureq::Error::Status(code, _) => anyhow!("status {code}"),
        other => anyhow!("{other}"),
    })?;
    let value: Value = response.into_json()?;
    let field = |name: &str| -> Result<String> {
        match value.get(name).and_then(Value::as_str) {
            Some(s) if !s.is_empty() => Ok(s.to_string()),
            _ => Err(anyhow!("missing required fields")),
        }
    };
    Ok(OidcMetadata {
        issuer: field("issuer")?,
        authorization_endpoint: field("authorization_endpoint")?,
        token_endpoint: field("token_endpoint")?,
    })
}

/// Probe the OIDC discovery document, falling back to the RFC 8414 location.
pub fn probe_oauth2(base_url: &str) -> Result<OidcMetadata> {
    let base = base_url.trim_end_matches('/');
    if base.is_empty() {
        return Err(anyhow!("base_url required"));
    }
    let agent = ureq::AgentBuilder::new()
        .timeout(METADATA_TIMEOUT)
        .build();
    fetch_metadata(&agent, &format!("{base}/.well-known/openid-configuration")).or_else(|_| {
        fetch_metadata(
            &agent,
            &format!("{base}/.well-known/oauth-authorization-server"),
        )
    })
}

#[derive(Debug)]
pub enum ExchangeError {
    /// The token endpoint answered with a non-200 status.
    Status(u16),
    /// The request never completed.
    Transport(String),
}

impl std::fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status(code) => write!(f, "Token exchange failed: {code}"),
            Self::Transport(err) => write!(f, "Token exchange error: {err}"),
        }
    }
}

/// POST the authorization code with the PKCE verifier; a configured client
/// secret is sent via `client_secret_post`.
pub fn exchange_code(
    token_endpoint: &str,
    code: &str,
    redirect_uri: &str,
    client_id: &str,
    code_verifier: &str,
    client_secret: Option<&str>,
) -> std::result::Result<Map<String, Value>, ExchangeError> {
    let agent = ureq::AgentBuilder::new().timeout(TOKEN_TIMEOUT).build();
    let mut form: Vec<(&str, &str)> = vec![
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("client_id", client_id),
        ("code_verifier", code_verifier),
    ];
    if let Some(secret) = client_secret.filter(|s| !s.is_empty()) {
        form.push(("client_secret", secret));
    }

    let response = agent
        .post(token_endpoint)
        .send_form(&form)
        .map_err(|err| match err {
            ureq::Error::Status(code, _) => ExchangeError::Status(code),
            other => ExchangeError::Transport(other.to_string()),
        })?;
    let body: Value = response
        .into_json()
        .map_err(|err| ExchangeError::Transport(err.to_string()))?;

    let mut tokens = Map::new();
    for key in TOKEN_KEYS {
        if let Some(value) = body.get(key) {
            tokens.insert(key.to_string(), value.clone());
        }
    }
    Ok(tokens)
}

// ----------------------------------------------------------------------------
// Per-request gate
// ----------------------------------------------------------------------------

/// Routes reachable without a session.
const OPEN_ENDPOINTS: [&str; 8] = [
    "login",
    "oauth2_login",
    "oauth2_callback",
    "oauth2_fallback",
    "oauth2_test_api",
    "health",
    "favicon",
    "status",
];

#[derive(Debug, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    /// Effective OAuth2 mode and no fallback marker: `session.next` has been
    /// set, redirect to the OAuth2 login route.
    RedirectOauth2Login,
    /// Redirect to the local login form, carrying the requested URL.
    RedirectLocalLogin,
}

pub fn gate(
    endpoint: &str,
    requested_url: &str,
    session: &mut Session,
    auth: &AuthSettings,
) -> GateDecision {
    if OPEN_ENDPOINTS.contains(&endpoint) || session.logged_in {
        return GateDecision::Allow;
    }
    if auth.oauth2_effective() && !session.oauth2_fallback {
        session.next = Some(requested_url.to_string());
        return GateDecision::RedirectOauth2Login;
    }
    GateDecision::RedirectLocalLogin
}

// ----------------------------------------------------------------------------
// Bearer token check for /status
// ----------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
pub enum BearerCheck {
    Ok,
    Missing,
    Mismatch,
}

/// Constant-time comparison of the presented bearer against the deployment
/// token.
pub fn check_bearer(authorization: Option<&str>, expected: &str) -> BearerCheck {
    let Some(header) = authorization else {
        return BearerCheck::Missing;
    };
    let Some(presented) = header.strip_prefix("Bearer ") else {
        return BearerCheck::Missing;
    };
    let presented = presented.trim();
    if presented.len() != expected.len() {
        return BearerCheck::Mismatch;
    }
    if bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
        BearerCheck::Ok
    } else {
        BearerCheck::Mismatch
    }
}
